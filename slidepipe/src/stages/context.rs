//! Execution context handed to a stage.

use super::StageError;
use crate::cancellation::CancellationToken;
use crate::config::StageConfig;
use crate::core::{StageId, StageStats};
use crate::errors::StageExecutionError;
use crate::router::ArtifactRouter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Everything one stage invocation may read or write.
///
/// The stage exclusively owns `output_dir` for the duration of the call and
/// must write its stats to `stats_path` before reporting success. Directories
/// of earlier stages (`input_dir`, `companion_dir`) are read-only.
#[derive(Debug, Clone)]
pub struct StageContext {
    session_id: String,
    config: StageConfig,
    input_dir: PathBuf,
    output_dir: PathBuf,
    companion_dir: Option<PathBuf>,
    stats_path: PathBuf,
    router: ArtifactRouter,
    cancel: Arc<CancellationToken>,
}

impl StageContext {
    /// Creates a context with the default router and a fresh token.
    pub fn new(
        session_id: impl Into<String>,
        config: StageConfig,
        input_dir: impl Into<PathBuf>,
        output_dir: impl Into<PathBuf>,
        stats_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            config,
            input_dir: input_dir.into(),
            output_dir: output_dir.into(),
            companion_dir: None,
            stats_path: stats_path.into(),
            router: ArtifactRouter::default(),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Sets the directory holding companion images.
    #[must_use]
    pub fn with_companion_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.companion_dir = Some(dir.into());
        self
    }

    /// Sets the artifact router.
    #[must_use]
    pub fn with_router(mut self, router: ArtifactRouter) -> Self {
        self.router = router;
        self
    }

    /// Shares a cancellation token with the run.
    #[must_use]
    pub fn with_cancel(mut self, cancel: Arc<CancellationToken>) -> Self {
        self.cancel = cancel;
        self
    }

    /// The session this invocation belongs to.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The stage being run.
    #[must_use]
    pub fn stage(&self) -> StageId {
        self.config.stage
    }

    /// Resolved parameters.
    #[must_use]
    pub fn config(&self) -> &StageConfig {
        &self.config
    }

    /// Read-only input directory.
    #[must_use]
    pub fn input_dir(&self) -> &Path {
        &self.input_dir
    }

    /// Output directory owned by the stage.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Read-only companion image directory, if the stage has one.
    #[must_use]
    pub fn companion_dir(&self) -> Option<&Path> {
        self.companion_dir.as_deref()
    }

    /// Where the stats artifact goes.
    #[must_use]
    pub fn stats_path(&self) -> &Path {
        &self.stats_path
    }

    /// The router used for every placement.
    #[must_use]
    pub fn router(&self) -> &ArtifactRouter {
        &self.router
    }

    /// The run's cancellation token.
    #[must_use]
    pub fn cancel_token(&self) -> &Arc<CancellationToken> {
        &self.cancel
    }

    /// Fails with [`StageError::Cancelled`] once cancellation was requested.
    pub fn check_cancel(&self) -> Result<(), StageError> {
        self.cancel.check().map_err(StageError::Cancelled)
    }

    /// The configured model, required by classification stages.
    pub fn require_model(&self) -> Result<&Path, StageError> {
        self.config
            .model
            .as_deref()
            .ok_or_else(|| self.error("no model configured").into())
    }

    /// The companion directory, or a stage error when none was wired.
    pub fn require_companion_dir(&self) -> Result<&Path, StageError> {
        self.companion_dir()
            .ok_or_else(|| self.error("no companion directory configured").into())
    }

    /// Builds a [`StageExecutionError`] for this stage.
    #[must_use]
    pub fn error(&self, message: impl Into<String>) -> StageExecutionError {
        StageExecutionError::new(self.stage().key(), message)
    }

    /// Writes `stats` to the stats path.
    pub fn write_stats(&self, stats: &StageStats) -> Result<(), StageError> {
        stats.write_json(&self.stats_path).map_err(|source| StageError::Io {
            path: self.stats_path.clone(),
            source,
        })
    }
}
