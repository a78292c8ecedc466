//! The unified pipeline report.

use crate::config::{CellMode, CellSource, ConfigResolver, StageConfig, TilingParams};
use crate::core::{RunStatus, StageId, StageStats, StageStatus};
use crate::errors::{PipelineError, StageExecutionError};
use crate::pipeline::StageRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// One stage block of the report: what the orchestrator saw, plus the
/// stage's own stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageReport {
    /// Execution record.
    #[serde(flatten)]
    pub record: StageRecord,
    /// Stats read from the stage's artifact, zero-valued when absent.
    pub stats: StageStats,
}

impl StageReport {
    /// Final status of the stage.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        self.record.status
    }
}

/// The resolved configuration echoed into the report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    /// Tiling parameters, when they resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiling: Option<TilingParams>,
    /// Resolved parameters of every stage that got that far.
    #[serde(default)]
    pub stages: BTreeMap<StageId, StageConfig>,
    /// Whether cell classification was enabled.
    pub cells_enabled: bool,
    /// Input selected for cell classification.
    pub cell_source: CellSource,
    /// Classifier or detector.
    #[serde(default)]
    pub cell_mode: CellMode,
}

impl RunSettings {
    /// Captures the run-level choices of a resolver.
    #[must_use]
    pub fn from_resolver(resolver: &ConfigResolver) -> Self {
        Self {
            tiling: resolver.tiling().ok(),
            stages: BTreeMap::new(),
            cells_enabled: resolver.cells_enabled(),
            cell_source: resolver.cell_source(),
            cell_mode: resolver.cell_mode(),
        }
    }

    /// Records the parameters a stage ran with.
    pub fn record(&mut self, config: &StageConfig) {
        self.stages.insert(config.stage, config.clone());
    }
}

/// Pipeline-wide roll-up of every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Session the report belongs to.
    pub session_id: String,
    /// Report timestamp (`%Y-%m-%d_%H-%M-%S`).
    pub ts: String,
    /// Where the run ended.
    pub status: RunStatus,
    /// Wall-clock seconds for the whole run.
    pub total_seconds: f64,
    /// `total_seconds` for humans.
    pub total_time: String,
    /// Slides listed in the tile manifest.
    pub slides_count: usize,
    /// Tile images under `01_tiles`.
    pub tiles_total: usize,
    /// One block per stage, in pipeline order.
    pub stages: BTreeMap<StageId, StageReport>,
    /// Resolved configuration.
    pub settings: RunSettings,
}

impl PipelineReport {
    /// The block of `stage`.
    #[must_use]
    pub fn stage(&self, stage: StageId) -> Option<&StageReport> {
        self.stages.get(&stage)
    }

    /// Stats of `stage`, zero-valued when the stage is missing.
    #[must_use]
    pub fn stats(&self, stage: StageId) -> StageStats {
        self.stage(stage).map(|s| s.stats.clone()).unwrap_or_default()
    }

    /// Returns true if every stage finished or was skipped.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status == RunStatus::Finished
    }

    /// Turns an aborted report into the error that aborted it.
    pub fn into_result(self) -> Result<Self, PipelineError> {
        let (stage, reason) = match &self.status {
            RunStatus::Aborted { stage, reason } => (*stage, reason.clone()),
            _ => return Ok(self),
        };
        if self.stage(stage).is_some_and(|s| s.status() == StageStatus::Cancel) {
            return Err(PipelineError::Cancelled(reason));
        }
        Err(StageExecutionError::new(stage.key(), reason).into())
    }

    /// Writes the report as pretty JSON, creating parent directories.
    pub fn write(&self, path: &Path) -> Result<(), PipelineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Reads a report written by [`PipelineReport::write`].
    pub fn read(path: &Path) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
    }
}
