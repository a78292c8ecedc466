//! Stage 3: embed tissue tiles as feature vectors.

use super::routing::{load_batch, model_error, slide_relative, write_failures};
use super::{ensure_dirs, run_blocking, Stage, StageContext, StageError};
use crate::core::{StageId, StageOutput, StageStats};
use crate::models::{ensure_batch_len, ModelBackend};
use crate::utils::list_images;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Extension of feature files: raw little-endian `f32` values.
pub const FEATURE_EXTENSION: &str = "f32";

const INDEX_FILE: &str = "index.json";

/// One `index.json` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureIndexEntry {
    /// Source tile.
    pub image: PathBuf,
    /// Written feature file.
    pub feature: PathBuf,
}

/// Writes `03_features/<slide>/<stem>.f32` for every readable tissue tile.
#[derive(Debug, Clone)]
pub struct FeatureStage {
    backend: Arc<dyn ModelBackend>,
}

impl FeatureStage {
    /// Creates the stage over a model backend.
    #[must_use]
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

fn feature_path(out_dir: &Path, tile: &Path) -> PathBuf {
    out_dir.join(slide_relative(tile)).with_extension(FEATURE_EXTENSION)
}

fn write_vector(path: &Path, vector: &[f32]) -> Result<(), StageError> {
    if let Some(parent) = path.parent() {
        ensure_dirs([parent])?;
    }
    let bytes: Vec<u8> = vector.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes).map_err(|e| StageError::io(path, e))
}

fn extract(backend: &dyn ModelBackend, ctx: &StageContext) -> Result<StageStats, StageError> {
    let out_dir = ctx.output_dir();
    ensure_dirs([out_dir])?;
    let config = ctx.config();
    let tiles = list_images(ctx.input_dir());
    let mut failures = Vec::new();
    let mut index = Vec::with_capacity(tiles.len());
    let mut dim = None;

    if tiles.is_empty() {
        warn!(input = %ctx.input_dir().display(), "no tissue tiles to embed");
    } else {
        info!(tiles = tiles.len(), "extracting features");
        let model = backend
            .feature_extractor(config.model.as_deref())
            .map_err(|e| model_error(ctx, &e))?;
        for batch in tiles.chunks(config.batch_size.max(1)) {
            ctx.check_cancel()?;
            let (loaded, images) = load_batch(batch, config.image_size, &mut failures);
            if images.is_empty() {
                continue;
            }
            let vectors = model.extract(&images).map_err(|e| model_error(ctx, &e))?;
            ensure_batch_len(images.len(), vectors.len()).map_err(|e| model_error(ctx, &e))?;
            for (tile, vector) in loaded.into_iter().zip(vectors) {
                let feature = feature_path(out_dir, &tile);
                write_vector(&feature, &vector)?;
                dim.get_or_insert(vector.len());
                index.push(FeatureIndexEntry { image: tile, feature });
            }
        }
    }

    let index_path = out_dir.join(INDEX_FILE);
    let body = serde_json::to_string_pretty(&index).map_err(|e| StageError::io(&index_path, std::io::Error::other(e)))?;
    fs::write(&index_path, body).map_err(|e| StageError::io(&index_path, e))?;
    write_failures(out_dir, &failures)?;

    let written = index.len() as u64;
    let mut stats = StageStats::new().with_batch_size(config.batch_size);
    stats.processed = written;
    stats.saved = written;
    stats.failed = failures.len() as u64;
    stats.set_extra("input_total", serde_json::json!(stats.input_total()));
    if let Some(dim) = dim {
        stats.set_extra("feature_dim", serde_json::json!(dim));
    }
    Ok(stats)
}

#[async_trait]
impl Stage for FeatureStage {
    fn id(&self) -> StageId {
        StageId::Features
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let backend = Arc::clone(&self.backend);
        run_blocking(ctx, move |ctx| extract(backend.as_ref(), ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::testing::{self, fixtures, FakeBackend, FakeFault};

    fn context(dir: &Path) -> StageContext {
        StageContext::new(
            "s",
            fixtures::stage_config(StageId::Features),
            dir.join("02_bg_filter/tissue"),
            dir.join("03_features"),
            dir.join("reports/feat_stats.json"),
        )
    }

    fn read_vector(path: &Path) -> Vec<f32> {
        std::fs::read(path)
            .unwrap()
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    #[tokio::test]
    async fn test_writes_vectors_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let tissue = dir.path().join("02_bg_filter/tissue");
        fixtures::write_tile(&tissue.join("a/a_x0_y0.png"), [255, 0, 0]);
        fixtures::write_tile(&tissue.join("b/b_x0_y0.png"), [0, 255, 0]);
        std::fs::write(tissue.join("b/b_x8_y0.png"), b"junk").unwrap();
        let ctx = context(dir.path());

        let output = FeatureStage::new(Arc::new(FakeBackend::new())).execute(&ctx).await;

        let stats = testing::output_stats(&output);
        testing::assert_counts(stats, 2, 2, 0, 1);
        assert_eq!(stats.extra["feature_dim"], serde_json::json!(3));

        let out = ctx.output_dir();
        assert_eq!(read_vector(&out.join("a/a_x0_y0.f32")), vec![1.0, 0.0, 0.0]);
        assert_eq!(read_vector(&out.join("b/b_x0_y0.f32")), vec![0.0, 1.0, 0.0]);

        let index: Vec<FeatureIndexEntry> =
            serde_json::from_str(&std::fs::read_to_string(out.join(INDEX_FILE)).unwrap()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].feature, out.join("a/a_x0_y0.f32"));
        assert!(out.join("failed.json").is_file());
    }

    #[tokio::test]
    async fn test_short_batch_fails() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write_tile(&dir.path().join("02_bg_filter/tissue/a/t.png"), [1, 2, 3]);
        let ctx = context(dir.path());

        let output = FeatureStage::new(Arc::new(FakeBackend::new().with_fault(FakeFault::ShortBatch)))
            .execute(&ctx)
            .await;

        testing::assert_output_status(&output, StageStatus::Fail);
    }
}
