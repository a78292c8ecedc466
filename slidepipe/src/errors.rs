//! Error types for the slidepipe pipeline.
//!
//! Run-level failures (`ConfigError`, `StageExecutionError`, `RouterError`)
//! abort the pipeline at the point they occur. Per-item problems are modelled
//! by [`ItemError`], which is recorded and counted but never propagated.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A required parameter is missing or could not be resolved.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A stage reported failure.
    #[error("{0}")]
    StageExecution(#[from] StageExecutionError),

    /// The artifact router exhausted its fallback ladder.
    #[error("{0}")]
    Router(#[from] RouterError),

    /// The session directory tree could not be prepared.
    #[error("{0}")]
    Session(#[from] SessionError),

    /// Slide tiling failed as a whole.
    #[error("{0}")]
    Tiler(#[from] crate::tiler::TilerError),

    /// The run was cancelled.
    #[error("Pipeline cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error raised when configuration cannot be resolved for a stage.
#[derive(Debug, Clone, Error)]
#[error("Configuration error{}: {message}", .stage.as_ref().map(|s| format!(" in stage '{s}'")).unwrap_or_default())]
pub struct ConfigError {
    /// The stage whose configuration is invalid, if known.
    pub stage: Option<String>,
    /// The offending key.
    pub key: String,
    /// Human-readable description.
    pub message: String,
}

impl ConfigError {
    /// Creates an error for a required key that no layer provided.
    #[must_use]
    pub fn missing(stage: impl Into<String>, key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            stage: Some(stage.into()),
            message: format!("missing required key '{key}'"),
            key,
        }
    }

    /// Creates an error for a key whose value is not acceptable.
    #[must_use]
    pub fn invalid(key: impl Into<String>, value: impl std::fmt::Display, expected: &str) -> Self {
        let key = key.into();
        Self {
            stage: None,
            message: format!("invalid value '{value}' for '{key}', expected {expected}"),
            key,
        }
    }

    /// Attaches the stage name to the error.
    #[must_use]
    pub fn in_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!("ConfigError"));
        map.insert("key".to_string(), serde_json::json!(self.key));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        if let Some(ref stage) = self.stage {
            map.insert("stage".to_string(), serde_json::json!(stage));
        }
        map
    }
}

/// Error raised when a stage reports failure.
#[derive(Debug, Clone, Error)]
#[error("Stage '{stage}' failed: {message}")]
pub struct StageExecutionError {
    /// The failing stage.
    pub stage: String,
    /// Failure description.
    pub message: String,
}

impl StageExecutionError {
    /// Creates a new stage execution error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Error raised when no placement strategy could materialize a destination.
#[derive(Debug, Error)]
#[error("Could not place '{}' at '{}': {source}", .src.display(), .dst.display())]
pub struct RouterError {
    /// The source file.
    pub src: PathBuf,
    /// The requested destination.
    pub dst: PathBuf,
    /// The error of the last attempted strategy.
    #[source]
    pub source: std::io::Error,
}

impl RouterError {
    /// Creates a new router error.
    #[must_use]
    pub fn new(src: &Path, dst: &Path, source: std::io::Error) -> Self {
        Self {
            src: src.to_path_buf(),
            dst: dst.to_path_buf(),
            source,
        }
    }
}

/// Errors related to the session directory tree.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session id cannot be used as a directory name.
    #[error("Invalid session id: '{0}'")]
    InvalidId(String),

    /// The session already holds a workspace from a previous run.
    #[error("Session '{0}' has already been run")]
    AlreadyRun(String),

    /// A directory could not be created.
    #[error("Could not create '{}': {source}", .path.display())]
    CreateDir {
        /// The directory that failed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// The kind of a recoverable per-item failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemErrorKind {
    /// The image could not be opened or decoded.
    UnreadableImage,
    /// The feature file is truncated or malformed.
    CorruptFeature,
    /// No companion image exists for a feature file.
    MissingCompanion,
    /// The tile region could not be read or written.
    TileExtraction,
}

impl std::fmt::Display for ItemErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnreadableImage => write!(f, "unreadable_image"),
            Self::CorruptFeature => write!(f, "corrupt_feature"),
            Self::MissingCompanion => write!(f, "missing_companion"),
            Self::TileExtraction => write!(f, "tile_extraction"),
        }
    }
}

/// A recoverable failure attached to a single item.
///
/// Items that fail are skipped and counted; processing continues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemError {
    /// The item that failed.
    pub path: PathBuf,
    /// What went wrong.
    pub kind: ItemErrorKind,
    /// Underlying error text.
    pub detail: String,
}

impl ItemError {
    /// Creates a new item error.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, kind: ItemErrorKind, detail: impl std::fmt::Display) -> Self {
        Self {
            path: path.into(),
            kind,
            detail: detail.to_string(),
        }
    }
}

impl std::fmt::Display for ItemError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.path.display(), self.kind, self.detail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_missing() {
        let err = ConfigError::missing("bg", "model");
        assert_eq!(err.key, "model");
        assert!(err.to_string().contains("stage 'bg'"));
        assert!(err.to_string().contains("missing required key 'model'"));
    }

    #[test]
    fn test_config_error_invalid_then_stage() {
        let err = ConfigError::invalid("cells.source", "nowhere", "one of apt|tissue").in_stage("cells");
        assert_eq!(err.stage.as_deref(), Some("cells"));
        assert!(err.to_string().contains("nowhere"));
    }

    #[test]
    fn test_config_error_to_dict() {
        let dict = ConfigError::missing("apt", "model").to_dict();
        assert_eq!(dict.get("type").unwrap(), "ConfigError");
        assert_eq!(dict.get("stage").unwrap(), "apt");
    }

    #[test]
    fn test_stage_execution_error_display() {
        let err = StageExecutionError::new("features", "exit status 2");
        assert_eq!(err.to_string(), "Stage 'features' failed: exit status 2");
    }

    #[test]
    fn test_pipeline_error_from_config() {
        let err: PipelineError = ConfigError::missing("bg", "model").into();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_item_error_serialization() {
        let err = ItemError::new("/tmp/a.png", ItemErrorKind::UnreadableImage, "bad header");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "unreadable_image");
        assert!(err.to_string().contains("bad header"));
    }
}
