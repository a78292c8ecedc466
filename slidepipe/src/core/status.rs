//! Stage and run status enums.

use super::StageId;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The execution status of a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage is pending execution.
    Pending,
    /// Stage is currently running.
    Running,
    /// Stage completed successfully.
    Ok,
    /// Stage was skipped.
    Skip,
    /// Stage failed.
    Fail,
    /// Stage was cancelled.
    Cancel,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Ok => write!(f, "ok"),
            Self::Skip => write!(f, "skip"),
            Self::Fail => write!(f, "fail"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status represents a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip | Self::Cancel | Self::Fail)
    }

    /// Returns true if the status indicates success.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Skip)
    }

    /// Returns true if the status indicates failure.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Fail | Self::Cancel)
    }
}

/// Position of a run in the orchestrator state machine.
///
/// `Pending -> Running(i) -> Completed(i) -> Running(i+1) -> ... -> Finished`,
/// or `Running(i) -> Aborted` on the first failing stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RunStatus {
    /// Nothing has run yet.
    Pending,
    /// A stage is executing.
    Running {
        /// The executing stage.
        stage: StageId,
    },
    /// A stage finished and the next has not started.
    Completed {
        /// The last finished stage.
        stage: StageId,
    },
    /// Every stage finished or was skipped.
    Finished,
    /// A stage failed and later stages never started.
    Aborted {
        /// The stage that aborted the run.
        stage: StageId,
        /// Why it aborted.
        reason: String,
    },
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunStatus {
    /// Returns true once the run can no longer change state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Aborted { .. })
    }

    /// Returns the aborting stage, if the run aborted.
    #[must_use]
    pub fn aborted_stage(&self) -> Option<StageId> {
        match self {
            Self::Aborted { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running { stage } => write!(f, "running({stage})"),
            Self::Completed { stage } => write!(f, "completed({stage})"),
            Self::Finished => write!(f, "finished"),
            Self::Aborted { stage, reason } => write!(f, "aborted({stage}): {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_status_display() {
        assert_eq!(StageStatus::Ok.to_string(), "ok");
        assert_eq!(StageStatus::Fail.to_string(), "fail");
        assert_eq!(StageStatus::Skip.to_string(), "skip");
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Ok.is_terminal());
        assert!(StageStatus::Skip.is_terminal());
        assert!(StageStatus::Fail.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_skip_counts_as_success() {
        assert!(StageStatus::Skip.is_success());
        assert!(StageStatus::Cancel.is_failure());
    }

    #[test]
    fn test_run_status_serialize_aborted() {
        let status = RunStatus::Aborted {
            stage: StageId::Features,
            reason: "model crashed".to_string(),
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["state"], "aborted");
        assert_eq!(json["stage"], "features");
        assert_eq!(status.aborted_stage(), Some(StageId::Features));
        assert!(status.is_terminal());
    }

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Running { stage: StageId::Tiles }.to_string(), "running(tiles)");
        assert_eq!(RunStatus::Finished.to_string(), "finished");
    }
}
