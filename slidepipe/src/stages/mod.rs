//! Stage trait and implementations.
//!
//! Stages are the units the orchestrator sequences. Each one reads the
//! previous stage's output tree, writes its own, and persists a
//! [`StageStats`] artifact before returning [`StageOutput::ok`].
//!
//! The built-in stages run their CPU and file work on the blocking thread
//! pool. Any stage can be replaced, for instance by a [`CommandStage`] that
//! shells out to an external script.

mod aptitude;
mod background;
mod cells;
mod command;
mod context;
mod features;
mod routing;
mod tiling;

pub use aptitude::AptitudeStage;
pub use background::BackgroundFilterStage;
pub use cells::{CellStage, PREDICTIONS_FILE};
pub use command::CommandStage;
pub use context::StageContext;
pub use features::{FeatureIndexEntry, FeatureStage, FEATURE_EXTENSION};
pub use routing::{BinaryRouter, ClassLabels, FAILED_FILE, SAMPLES_DIR};
pub use tiling::TilingStage;

use crate::core::{StageId, StageOutput, StageStats};
use crate::errors::{RouterError, StageExecutionError};
use crate::models::ModelBackend;
use crate::tiler::{SlideOpener, TilerError};
use crate::utils::human_time;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};

/// Trait for pipeline stages.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// The pipeline position this stage fills.
    fn id(&self) -> StageId;

    /// Returns the name of the stage.
    fn name(&self) -> &str {
        self.id().key()
    }

    /// Executes the stage.
    ///
    /// Per-item problems are counted in the stats; any other problem is
    /// returned as [`StageOutput::fail`] or [`StageOutput::cancel`].
    async fn execute(&self, ctx: &StageContext) -> StageOutput;
}

/// Errors that end a stage invocation.
#[derive(Debug, Error)]
pub enum StageError {
    /// The stage itself reported failure.
    #[error(transparent)]
    Execution(#[from] StageExecutionError),

    /// The router exhausted its fallback ladder.
    #[error(transparent)]
    Router(#[from] RouterError),

    /// Tiling failed.
    #[error(transparent)]
    Tiler(TilerError),

    /// A file the stage owns could not be written.
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        /// The offending path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A CSV artifact could not be written.
    #[error("CSV error on '{}': {source}", .path.display())]
    Csv {
        /// The offending path.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: csv::Error,
    },

    /// Cancellation was requested.
    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl From<TilerError> for StageError {
    fn from(err: TilerError) -> Self {
        match err {
            TilerError::Cancelled(reason) => Self::Cancelled(reason),
            other => Self::Tiler(other),
        }
    }
}

impl StageError {
    /// Wraps an I/O error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a CSV error with the path it concerns.
    pub fn csv(path: impl Into<PathBuf>, source: csv::Error) -> Self {
        Self::Csv {
            path: path.into(),
            source,
        }
    }
}

/// Creates `dirs` (and parents).
pub(crate) fn ensure_dirs<'a>(dirs: impl IntoIterator<Item = &'a std::path::Path>) -> Result<(), StageError> {
    for dir in dirs {
        std::fs::create_dir_all(dir).map_err(|e| StageError::io(dir, e))?;
    }
    Ok(())
}

/// Runs `work` on the blocking pool, then stamps timing, derives ratios,
/// writes the stats artifact and maps the result to a [`StageOutput`].
pub(crate) async fn run_blocking<F>(ctx: &StageContext, work: F) -> StageOutput
where
    F: FnOnce(&StageContext) -> Result<StageStats, StageError> + Send + 'static,
{
    let started = Instant::now();
    let job = ctx.clone();
    let result = tokio::task::spawn_blocking(move || work(&job))
        .await
        .unwrap_or_else(|e| Err(ctx.error(format!("stage task panicked: {e}")).into()));
    finish(ctx, started, result)
}

pub(crate) fn finish(ctx: &StageContext, started: Instant, result: Result<StageStats, StageError>) -> StageOutput {
    let stage = ctx.stage();
    match result {
        Ok(mut stats) => {
            let seconds = started.elapsed().as_secs_f64();
            stats.seconds = Some((seconds * 1000.0).round() / 1000.0);
            stats.derive_ratios();
            if let Err(e) = ctx.write_stats(&stats) {
                error!(stage = %stage, error = %e, "failed to write stats");
                return StageOutput::fail(e.to_string());
            }
            info!(
                stage = %stage,
                processed = stats.processed,
                saved = stats.saved,
                discarded = stats.discarded,
                failed = stats.failed,
                took = %human_time(seconds),
                "stage completed"
            );
            StageOutput::ok(stats)
        }
        Err(StageError::Cancelled(reason)) => {
            warn!(stage = %stage, reason = %reason, "stage cancelled");
            StageOutput::cancel(reason)
        }
        Err(e) => {
            error!(stage = %stage, error = %e, "stage failed");
            StageOutput::fail(e.to_string())
        }
    }
}

/// The stage implementation chosen for every pipeline position.
#[derive(Debug, Clone)]
pub struct StageSet {
    stages: BTreeMap<StageId, Arc<dyn Stage>>,
}

impl StageSet {
    /// The built-in stages backed by `backend` and `opener`.
    #[must_use]
    pub fn builtin(backend: Arc<dyn ModelBackend>, opener: Arc<dyn SlideOpener>) -> Self {
        let stages: [Arc<dyn Stage>; 5] = [
            Arc::new(TilingStage::new(opener)),
            Arc::new(BackgroundFilterStage::new(Arc::clone(&backend))),
            Arc::new(FeatureStage::new(Arc::clone(&backend))),
            Arc::new(AptitudeStage::new(Arc::clone(&backend))),
            Arc::new(CellStage::new(backend)),
        ];
        Self {
            stages: stages.into_iter().map(|s| (s.id(), s)).collect(),
        }
    }

    /// Replaces the stage at `stage.id()`.
    #[must_use]
    pub fn with_stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.stages.insert(stage.id(), stage);
        self
    }

    /// The stage for a pipeline position.
    #[must_use]
    pub fn get(&self, id: StageId) -> Option<&Arc<dyn Stage>> {
        self.stages.get(&id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeBackend, MockStage, SyntheticSlideOpener};

    #[test]
    fn test_builtin_set_covers_every_stage() {
        let set = StageSet::builtin(
            Arc::new(FakeBackend::new()),
            Arc::new(SyntheticSlideOpener::new(8, 8)),
        );
        for id in StageId::ALL {
            assert_eq!(set.get(id).map(|s| s.id()), Some(id));
        }
        assert_eq!(set.get(StageId::Aptitude).unwrap().name(), "apt");
    }

    #[test]
    fn test_with_stage_replaces() {
        let mock = Arc::new(MockStage::new(StageId::Features));
        let set = StageSet::builtin(
            Arc::new(FakeBackend::new()),
            Arc::new(SyntheticSlideOpener::new(8, 8)),
        )
        .with_stage(mock);
        assert!(format!("{:?}", set.get(StageId::Features).unwrap()).contains("MockStage"));
    }

    #[test]
    fn test_tiler_cancel_maps_to_cancelled() {
        let err = StageError::from(TilerError::Cancelled("stop".into()));
        assert!(matches!(err, StageError::Cancelled(r) if r == "stop"));
    }
}
