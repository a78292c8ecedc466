//! Stage 1: tile every slide of the session input.

use super::{run_blocking, Stage, StageContext, StageError};
use crate::core::{StageId, StageOutput, StageStats};
use crate::tiler::{SlideOpener, Tiler};
use async_trait::async_trait;
use std::sync::Arc;

/// Runs the [`Tiler`] over `input_dir`, writing tiles and the manifest to
/// the stage output.
#[derive(Debug, Clone)]
pub struct TilingStage {
    opener: Arc<dyn SlideOpener>,
}

impl TilingStage {
    /// Creates the stage over a slide backend.
    #[must_use]
    pub fn new(opener: Arc<dyn SlideOpener>) -> Self {
        Self { opener }
    }
}

fn tile(opener: &Arc<dyn SlideOpener>, ctx: &StageContext) -> Result<StageStats, StageError> {
    let params = ctx
        .config()
        .tiling
        .clone()
        .ok_or_else(|| ctx.error("tiling parameters missing"))?;
    let chunk_size = params.chunk_size;
    let tiler = Tiler::new(Arc::clone(opener), params);
    let manifest = tiler.tile_all(ctx.input_dir(), ctx.output_dir(), ctx.cancel_token())?;

    let tiles = manifest.tiles_total() as u64;
    let mut stats = StageStats::new().with_batch_size(chunk_size);
    stats.processed = tiles;
    stats.saved = tiles;
    stats.failed = manifest.tiles_failed() as u64;
    stats.set_extra("slides_count", serde_json::json!(manifest.slides.len()));
    stats.set_extra("tile_size", serde_json::json!(tiler.params().size));
    stats.set_extra("stride", serde_json::json!(tiler.params().stride));
    Ok(stats)
}

#[async_trait]
impl Stage for TilingStage {
    fn id(&self) -> StageId {
        StageId::Tiles
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let opener = Arc::clone(&self.opener);
        run_blocking(ctx, move |ctx| tile(&opener, ctx)).await
    }
}
