//! What the orchestrator remembers about each stage of a run.

use crate::core::{StageId, StageStatus};
use crate::utils::{format_iso, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Execution record of one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// The stage.
    pub stage: StageId,
    /// Final status.
    pub status: StageStatus,
    /// The stage was not run and its stats were synthesized.
    #[serde(default)]
    pub skipped: bool,
    /// Skip, failure or cancel reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Input directory handed to the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_dir: Option<PathBuf>,
    /// Output directory owned by the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_dir: Option<PathBuf>,
    /// Wall-clock start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    /// Wall-clock end.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    /// Elapsed seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
}

impl StageRecord {
    /// A record for a stage that has not started.
    #[must_use]
    pub fn new(stage: StageId) -> Self {
        Self {
            stage,
            status: StageStatus::Pending,
            skipped: false,
            reason: None,
            input_dir: None,
            output_dir: None,
            started_at: None,
            ended_at: None,
            seconds: None,
        }
    }

    /// Marks the stage skipped.
    #[must_use]
    pub fn skipped(stage: StageId, reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Skip,
            skipped: true,
            reason: Some(reason.into()),
            ..Self::new(stage)
        }
    }

    /// Marks the stage failed before it started.
    #[must_use]
    pub fn rejected(stage: StageId, status: StageStatus, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: Some(reason.into()),
            ..Self::new(stage)
        }
    }

    /// Sets the directories.
    #[must_use]
    pub fn with_dirs(mut self, input: PathBuf, output: PathBuf) -> Self {
        self.input_dir = Some(input);
        self.output_dir = Some(output);
        self
    }

    /// Stamps the run window.
    pub fn set_window(&mut self, started: &Timestamp, ended: &Timestamp, seconds: f64) {
        self.started_at = Some(format_iso(started));
        self.ended_at = Some(format_iso(ended));
        self.seconds = Some((seconds * 1000.0).round() / 1000.0);
    }

    /// Returns true if the stage ended the run.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    #[test]
    fn test_window_formatting() {
        let start = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let end = start + Duration::milliseconds(1500);
        let mut record = StageRecord::new(StageId::Features);
        record.set_window(&start, &end, 1.50049);

        assert_eq!(record.started_at.as_deref(), Some("2024-01-02T03:04:05.000000+00:00"));
        assert_eq!(record.ended_at.as_deref(), Some("2024-01-02T03:04:06.500000+00:00"));
        assert_eq!(record.seconds, Some(1.5));
    }

    #[test]
    fn test_skipped_record_serializes_flag() {
        let record = StageRecord::skipped(StageId::Cells, "no images");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["skipped"], true);
        assert_eq!(json["status"], "skip");
        assert!(json.get("started_at").is_none());
    }
}
