//! Stage output type with factory methods.

use super::{StageStats, StageStatus};
use serde::{Deserialize, Serialize};

/// The output of a stage execution.
///
/// `StageOutput` is immutable once created. A successful output carries the
/// stats the stage wrote; the orchestrator still re-reads the stats artifact
/// from disk, which remains the source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutput {
    /// The status of the stage execution.
    pub status: StageStatus,

    /// Stats produced by the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<StageStats>,

    /// Error message (for failed executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Skip reason (for skipped executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,

    /// Cancel reason (for cancelled executions).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,
}

impl StageOutput {
    /// Creates a successful output.
    #[must_use]
    pub fn ok(stats: StageStats) -> Self {
        Self {
            status: StageStatus::Ok,
            stats: Some(stats),
            error: None,
            skip_reason: None,
            cancel_reason: None,
        }
    }

    /// Creates a skip output with a reason and the stats written for it.
    #[must_use]
    pub fn skip(reason: impl Into<String>, stats: StageStats) -> Self {
        Self {
            status: StageStatus::Skip,
            stats: Some(stats),
            error: None,
            skip_reason: Some(reason.into()),
            cancel_reason: None,
        }
    }

    /// Creates a cancel output with a reason.
    #[must_use]
    pub fn cancel(reason: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Cancel,
            stats: None,
            error: None,
            skip_reason: None,
            cancel_reason: Some(reason.into()),
        }
    }

    /// Creates a failure output with an error message.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: StageStatus::Fail,
            stats: None,
            error: Some(error.into()),
            skip_reason: None,
            cancel_reason: None,
        }
    }

    /// Returns true if the output represents a success (ok or skip).
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Returns true if the output represents a failure (fail or cancel).
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.status.is_failure()
    }

    /// Returns the reason the stage did not complete normally, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.error
            .as_deref()
            .or(self.cancel_reason.as_deref())
            .or(self.skip_reason.as_deref())
    }
}

impl<E: std::error::Error> From<Result<StageStats, E>> for StageOutput {
    fn from(result: Result<StageStats, E>) -> Self {
        match result {
            Ok(stats) => Self::ok(stats),
            Err(e) => Self::fail(e.to_string()),
        }
    }
}
