//! Session directory tree.
//!
//! A session owns `sessions/<id>/` and everything below it:
//!
//! ```text
//! sessions/<id>/
//!   input/
//!   workspace/{01_tiles,02_bg_filter,03_features,04_aptitude,05_cells}/
//!   artifacts/{logs,reports}/
//! ```
//!
//! The tree is created at run start and never deleted by the pipeline.

use crate::core::StageId;
use crate::errors::SessionError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use uuid::Uuid;

/// Paths of one pipeline session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionPaths {
    id: String,
    root: PathBuf,
}

impl SessionPaths {
    /// Builds the paths of session `id` under `sessions_root`.
    ///
    /// The id must be a single, non-empty path component.
    pub fn new(sessions_root: impl AsRef<Path>, id: impl Into<String>) -> Result<Self, SessionError> {
        let id = id.into();
        if !is_valid_id(&id) {
            return Err(SessionError::InvalidId(id));
        }
        Ok(Self {
            root: sessions_root.as_ref().join(&id),
            id,
        })
    }

    /// Builds the paths of a fresh session with a random id.
    pub fn generate(sessions_root: impl AsRef<Path>) -> Self {
        let id = Uuid::new_v4().to_string();
        Self {
            root: sessions_root.as_ref().join(&id),
            id,
        }
    }

    /// The session id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// `sessions/<id>/`.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Raw slides.
    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.root.join("input")
    }

    /// Parent of every stage output.
    #[must_use]
    pub fn workspace_dir(&self) -> PathBuf {
        self.root.join("workspace")
    }

    /// Output subtree owned by `stage`.
    #[must_use]
    pub fn stage_dir(&self, stage: StageId) -> PathBuf {
        self.workspace_dir().join(stage.workspace_dir())
    }

    /// Log directory.
    #[must_use]
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("logs")
    }

    /// Report directory; also holds per-stage stats.
    #[must_use]
    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("artifacts").join("reports")
    }

    /// Stats artifact of `stage`.
    #[must_use]
    pub fn stats_path(&self, stage: StageId) -> PathBuf {
        self.reports_dir().join(stage.stats_file())
    }

    /// The unified report.
    #[must_use]
    pub fn report_path(&self) -> PathBuf {
        self.reports_dir().join("pipeline_report.json")
    }

    /// The JSON-lines event log.
    #[must_use]
    pub fn events_path(&self) -> PathBuf {
        self.logs_dir().join("events.jsonl")
    }

    /// The tile manifest written by the tiling stage.
    #[must_use]
    pub fn tiles_manifest_path(&self) -> PathBuf {
        self.stage_dir(StageId::Tiles).join("tiles_meta.json")
    }

    /// Creates the directory tree.
    ///
    /// Fails with [`SessionError::AlreadyRun`] if the workspace already
    /// exists; `input/` may pre-exist since it is where slides are dropped.
    pub fn prepare(&self) -> Result<(), SessionError> {
        if self.workspace_dir().exists() {
            return Err(SessionError::AlreadyRun(self.id.clone()));
        }

        let mut dirs = vec![self.input_dir(), self.logs_dir(), self.reports_dir()];
        dirs.extend(StageId::ALL.iter().map(|stage| self.stage_dir(*stage)));
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| SessionError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }

        info!(session_id = %self.id, root = %self.root.display(), "session prepared");
        Ok(())
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let paths = SessionPaths::new("/data/sessions", "run-1").unwrap();
        assert_eq!(paths.input_dir(), PathBuf::from("/data/sessions/run-1/input"));
        assert_eq!(
            paths.stage_dir(StageId::Aptitude),
            PathBuf::from("/data/sessions/run-1/workspace/04_aptitude")
        );
        assert_eq!(
            paths.stats_path(StageId::BackgroundFilter),
            PathBuf::from("/data/sessions/run-1/artifacts/reports/bg_stats.json")
        );
        assert_eq!(
            paths.tiles_manifest_path(),
            PathBuf::from("/data/sessions/run-1/workspace/01_tiles/tiles_meta.json")
        );
    }

    #[test]
    fn test_invalid_ids() {
        for id in ["", "..", "a/b", "x y"] {
            assert!(matches!(
                SessionPaths::new("/tmp", id),
                Err(SessionError::InvalidId(_))
            ));
        }
    }

    #[test]
    fn test_generated_id_is_uuid() {
        let paths = SessionPaths::generate("/tmp");
        assert!(Uuid::parse_str(paths.id()).is_ok());
    }

    #[test]
    fn test_prepare_creates_tree_and_refuses_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let paths = SessionPaths::new(dir.path(), "s1").unwrap();
        fs::create_dir_all(paths.input_dir()).unwrap();

        paths.prepare().unwrap();
        for stage in StageId::ALL {
            assert!(paths.stage_dir(stage).is_dir());
        }
        assert!(paths.logs_dir().is_dir());

        assert!(matches!(paths.prepare(), Err(SessionError::AlreadyRun(_))));
    }
}
