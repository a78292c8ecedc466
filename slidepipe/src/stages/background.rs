//! Stage 2: split tiles into tissue and background.

use super::routing::{model_error, score_images, slide_relative, write_failures};
use super::{run_blocking, BinaryRouter, ClassLabels, Stage, StageContext, StageError};
use crate::core::{StageId, StageOutput, StageStats};
use crate::models::ModelBackend;
use crate::utils::list_images;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Scores every tile with an image classifier; tiles scoring at or above
/// the threshold go to `tissue/<slide>/`, the rest to `background/<slide>/`.
#[derive(Debug, Clone)]
pub struct BackgroundFilterStage {
    backend: Arc<dyn ModelBackend>,
}

impl BackgroundFilterStage {
    /// Creates the stage over a model backend.
    #[must_use]
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

fn filter(backend: &dyn ModelBackend, ctx: &StageContext) -> Result<StageStats, StageError> {
    let mut router = BinaryRouter::new(ctx, ctx.output_dir(), ClassLabels::BACKGROUND)?;
    let tiles = list_images(ctx.input_dir());
    let mut failures = Vec::new();

    if tiles.is_empty() {
        warn!(input = %ctx.input_dir().display(), "no tiles to classify");
    } else {
        info!(tiles = tiles.len(), threshold = router.threshold(), "classifying tiles");
        let model = backend
            .image_classifier(ctx.require_model()?, ctx.config().image_size)
            .map_err(|e| model_error(ctx, &e))?;
        score_images(ctx, model.as_ref(), &tiles, &mut failures, |path, score| {
            router.route(path, &slide_relative(path), score).map(drop)
        })?;
    }

    write_failures(ctx.output_dir(), &failures)?;
    router.finish(failures.len() as u64)
}

#[async_trait]
impl Stage for BackgroundFilterStage {
    fn id(&self) -> StageId {
        StageId::BackgroundFilter
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let backend = Arc::clone(&self.backend);
        run_blocking(ctx, move |ctx| filter(backend.as_ref(), ctx)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::StageStatus;
    use crate::testing::{self, fixtures, FakeBackend, FakeFault};
    use std::path::Path;

    fn context(dir: &Path) -> StageContext {
        StageContext::new(
            "s",
            fixtures::stage_config(StageId::BackgroundFilter),
            dir.join("01_tiles"),
            dir.join("02_bg_filter"),
            dir.join("reports/bg_stats.json"),
        )
    }

    fn seed_tiles(dir: &Path) {
        let tiles = dir.join("01_tiles/case1");
        fixtures::write_tile(&tiles.join("case1_x0_y0.png"), [250, 10, 10]);
        fixtures::write_tile(&tiles.join("case1_x8_y0.png"), [240, 10, 10]);
        fixtures::write_tile(&tiles.join("case1_x16_y0.png"), [10, 10, 250]);
        fixtures::write_tile(&tiles.join("case1_x24_y0.png"), [128, 0, 0]);
        fixtures::write_tile(&tiles.join("case1_x32_y0.png"), [5, 5, 5]);
    }

    #[tokio::test]
    async fn test_routes_tissue_and_background() {
        let dir = tempfile::tempdir().unwrap();
        seed_tiles(dir.path());
        let backend = FakeBackend::new();
        let ctx = context(dir.path());

        let output = BackgroundFilterStage::new(Arc::new(backend.clone())).execute(&ctx).await;

        let stats = testing::output_stats(&output);
        testing::assert_counts(stats, 5, 3, 2, 0);
        testing::assert_conserved(stats);
        assert_eq!(stats.kept("tissue"), 3);
        assert_eq!(stats.kept("background"), 2);
        assert_eq!(stats.extra["tissue_ratio"], serde_json::json!(0.6));
        assert_eq!(stats.threshold_used, Some(0.5));
        assert_eq!(backend.batch_sizes(), vec![4, 1]);

        let out = ctx.output_dir();
        assert!(out.join("tissue/case1/case1_x0_y0.png").is_file());
        assert!(out.join("background/case1/case1_x16_y0.png").is_file());
        assert!(out.join("_samples/tissue/001_case1_x0_y0.png").is_file());
        assert!(out.join("_samples/tissue/002_case1_x8_y0.png").is_file());
        assert!(!out.join("_samples/tissue/003_case1_x24_y0.png").exists());
        assert_eq!(StageStats::read_json(ctx.stats_path()).unwrap().saved, 3);
    }

    #[tokio::test]
    async fn test_unreadable_tiles_are_counted_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        seed_tiles(dir.path());
        std::fs::write(dir.path().join("01_tiles/case1/broken.png"), b"not a png").unwrap();
        let ctx = context(dir.path());

        let output = BackgroundFilterStage::new(Arc::new(FakeBackend::new())).execute(&ctx).await;

        let stats = testing::output_stats(&output);
        testing::assert_counts(stats, 5, 3, 2, 1);
        assert_eq!(stats.extra["input_total"], serde_json::json!(6));
        assert!(ctx.output_dir().join("failed.json").is_file());
    }

    #[tokio::test]
    async fn test_empty_input_writes_zero_stats() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let backend = FakeBackend::new().with_fault(FakeFault::Load);

        let output = BackgroundFilterStage::new(Arc::new(backend)).execute(&ctx).await;

        let stats = testing::output_stats(&output);
        testing::assert_counts(stats, 0, 0, 0, 0);
        assert_eq!(stats.extra["kept_ratio"], serde_json::json!(0.0));
        assert!(ctx.output_dir().join("tissue").is_dir());
    }

    #[tokio::test]
    async fn test_model_failures_fail_stage() {
        for fault in [FakeFault::Load, FakeFault::Predict, FakeFault::ShortBatch] {
            let dir = tempfile::tempdir().unwrap();
            seed_tiles(dir.path());
            let ctx = context(dir.path());

            let output = BackgroundFilterStage::new(Arc::new(FakeBackend::new().with_fault(fault)))
                .execute(&ctx)
                .await;

            testing::assert_output_status(&output, StageStatus::Fail);
            assert!(output.reason().unwrap().contains("model error"), "{fault:?}");
            assert!(!ctx.stats_path().exists());
        }
    }
}
