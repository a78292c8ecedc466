//! Stage 4: split tissue tiles into apt and not apt by their features.
//!
//! The classifier scores feature vectors, but what gets routed is the
//! companion tissue image `<tissue>/<slide>/<stem>.<ext>` the vector was
//! computed from. A feature file without a companion, or one that does not
//! decode as little-endian `f32`s, is a per-item failure.

use super::routing::{model_error, write_failures};
use super::{run_blocking, BinaryRouter, ClassLabels, Stage, StageContext, StageError, FEATURE_EXTENSION};
use crate::core::{StageId, StageOutput, StageStats};
use crate::errors::{ItemError, ItemErrorKind};
use crate::models::{ensure_batch_len, ModelBackend};
use crate::utils::{list_with_extension, IMAGE_EXTENSIONS};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Classifies feature vectors and routes their companion images.
#[derive(Debug, Clone)]
pub struct AptitudeStage {
    backend: Arc<dyn ModelBackend>,
}

impl AptitudeStage {
    /// Creates the stage over a model backend.
    #[must_use]
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

/// A feature file with its decoded vector and companion image.
struct Item {
    companion: PathBuf,
    rel: PathBuf,
    vector: Vec<f32>,
}

fn read_vector(path: &Path) -> Result<Vec<f32>, String> {
    let bytes = fs::read(path).map_err(|e| e.to_string())?;
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Err(format!("{} bytes is not a whole number of f32 values", bytes.len()));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

fn find_companion(tissue_dir: &Path, slide: &str, stem: &str) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| tissue_dir.join(slide).join(format!("{stem}.{ext}")))
        .find(|candidate| candidate.is_file())
}

fn prepare(feature: &Path, tissue_dir: &Path) -> Result<Item, ItemError> {
    let name = |p: Option<&std::ffi::OsStr>| p.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let slide = name(feature.parent().and_then(Path::file_name));
    let stem = name(feature.file_stem());

    let companion = find_companion(tissue_dir, &slide, &stem).ok_or_else(|| {
        ItemError::new(
            feature,
            ItemErrorKind::MissingCompanion,
            format!("no image for '{slide}/{stem}' under {}", tissue_dir.display()),
        )
    })?;
    let vector = read_vector(feature).map_err(|e| ItemError::new(feature, ItemErrorKind::CorruptFeature, e))?;
    let file = companion.file_name().map(PathBuf::from).unwrap_or_default();
    Ok(Item {
        rel: Path::new(&slide).join(file),
        companion,
        vector,
    })
}

fn classify(backend: &dyn ModelBackend, ctx: &StageContext) -> Result<StageStats, StageError> {
    let tissue_dir = ctx.require_companion_dir()?;
    let mut router = BinaryRouter::new(ctx, ctx.output_dir(), ClassLabels::APTITUDE)?;
    let features = list_with_extension(ctx.input_dir(), FEATURE_EXTENSION);
    let mut failures = Vec::new();

    if features.is_empty() {
        warn!(input = %ctx.input_dir().display(), "no feature files to classify");
    } else {
        info!(features = features.len(), threshold = router.threshold(), "classifying features");
        let model = backend
            .feature_classifier(ctx.require_model()?)
            .map_err(|e| model_error(ctx, &e))?;
        for batch in features.chunks(ctx.config().batch_size.max(1)) {
            ctx.check_cancel()?;
            let mut items = Vec::with_capacity(batch.len());
            for feature in batch {
                match prepare(feature, tissue_dir) {
                    Ok(item) => items.push(item),
                    Err(e) => {
                        debug!(error = %e, "skipping feature");
                        failures.push(e);
                    }
                }
            }
            if items.is_empty() {
                continue;
            }
            let vectors: Vec<Vec<f32>> = items.iter_mut().map(|i| std::mem::take(&mut i.vector)).collect();
            let scores = model.predict(&vectors).map_err(|e| model_error(ctx, &e))?;
            ensure_batch_len(vectors.len(), scores.len()).map_err(|e| model_error(ctx, &e))?;
            for (item, score) in items.iter().zip(scores) {
                router.route(&item.companion, &item.rel, score)?;
            }
        }
    }

    if !failures.is_empty() {
        warn!(failed = failures.len(), "feature files skipped");
    }
    write_failures(ctx.output_dir(), &failures)?;
    router.finish(failures.len() as u64)
}

#[async_trait]
impl Stage for AptitudeStage {
    fn id(&self) -> StageId {
        StageId::Aptitude
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let backend = Arc::clone(&self.backend);
        run_blocking(ctx, move |ctx| classify(backend.as_ref(), ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::testing::{self, fixtures, FakeBackend};

    fn context(dir: &Path) -> StageContext {
        StageContext::new(
            "s",
            fixtures::stage_config(StageId::Aptitude),
            dir.join("03_features"),
            dir.join("04_aptitude"),
            dir.join("reports/apt_stats.json"),
        )
        .with_companion_dir(dir.join("02_bg_filter/tissue"))
    }

    #[tokio::test]
    async fn test_routes_companions_by_feature_score() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fixtures::write_tile(&root.join("02_bg_filter/tissue/s1/good.png"), [1, 1, 1]);
        fixtures::write_tile(&root.join("02_bg_filter/tissue/s1/poor.jpg"), [1, 1, 1]);
        fixtures::write_feature(&root.join("03_features/s1/good.f32"), &[0.9, 0.0]);
        fixtures::write_feature(&root.join("03_features/s1/poor.f32"), &[0.2, 0.0]);
        fixtures::write_feature(&root.join("03_features/s1/orphan.f32"), &[0.9]);
        std::fs::write(root.join("03_features/s1/torn.f32"), [0u8; 6]).unwrap();
        fixtures::write_tile(&root.join("02_bg_filter/tissue/s1/torn.png"), [1, 1, 1]);
        let ctx = context(root);

        let output = AptitudeStage::new(Arc::new(FakeBackend::new())).execute(&ctx).await;

        let stats = testing::output_stats(&output);
        testing::assert_counts(stats, 2, 1, 1, 2);
        assert_eq!(stats.kept("apt"), 1);
        assert_eq!(stats.kept("not_apt"), 1);
        assert_eq!(stats.extra["apt_ratio"], serde_json::json!(0.5));

        let out = ctx.output_dir();
        assert!(out.join("apt/s1/good.png").is_file());
        assert!(out.join("not_apt/s1/poor.jpg").is_file());

        let failed: Vec<ItemError> =
            serde_json::from_str(&std::fs::read_to_string(out.join("failed.json")).unwrap()).unwrap();
        let kinds: Vec<_> = failed.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![ItemErrorKind::MissingCompanion, ItemErrorKind::CorruptFeature]);
    }

    #[tokio::test]
    async fn test_requires_companion_dir() {
        let dir = tempfile::tempdir().unwrap();
        fixtures::write_feature(&dir.path().join("03_features/s1/a.f32"), &[0.9]);
        let ctx = StageContext::new(
            "s",
            fixtures::stage_config(StageId::Aptitude),
            dir.path().join("03_features"),
            dir.path().join("04_aptitude"),
            dir.path().join("reports/apt_stats.json"),
        );

        let output = AptitudeStage::new(Arc::new(FakeBackend::new())).execute(&ctx).await;

        testing::assert_output_status(&output, StageStatus::Fail);
    }

    #[test]
    fn test_read_vector_rejects_partial_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v.f32");
        std::fs::write(&path, [0u8; 5]).unwrap();
        assert!(read_vector(&path).is_err());
        std::fs::write(&path, 1.5f32.to_le_bytes()).unwrap();
        assert_eq!(read_vector(&path).unwrap(), vec![1.5]);
    }
}
