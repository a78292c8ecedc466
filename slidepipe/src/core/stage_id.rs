//! Identity of the five pipeline stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the fixed, ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageId {
    /// Whole-slide tiling.
    Tiles,
    /// Tissue / background classification of tiles.
    BackgroundFilter,
    /// Feature-vector extraction for tissue tiles.
    Features,
    /// Aptitude classification over feature vectors.
    Aptitude,
    /// Optional cell classification.
    Cells,
}

impl StageId {
    /// All stages in execution order.
    pub const ALL: [Self; 5] = [
        Self::Tiles,
        Self::BackgroundFilter,
        Self::Features,
        Self::Aptitude,
        Self::Cells,
    ];

    /// 1-based position in the pipeline.
    #[must_use]
    pub fn ordinal(self) -> usize {
        match self {
            Self::Tiles => 1,
            Self::BackgroundFilter => 2,
            Self::Features => 3,
            Self::Aptitude => 4,
            Self::Cells => 5,
        }
    }

    /// Short key used in reports, logs and config sections.
    #[must_use]
    pub fn key(self) -> &'static str {
        match self {
            Self::Tiles => "tiles",
            Self::BackgroundFilter => "bg",
            Self::Features => "feat",
            Self::Aptitude => "apt",
            Self::Cells => "cells",
        }
    }

    /// Name of the stage's exclusive output directory under `workspace/`.
    #[must_use]
    pub fn workspace_dir(self) -> &'static str {
        match self {
            Self::Tiles => "01_tiles",
            Self::BackgroundFilter => "02_bg_filter",
            Self::Features => "03_features",
            Self::Aptitude => "04_aptitude",
            Self::Cells => "05_cells",
        }
    }

    /// File name of the stage's stats artifact under `artifacts/reports/`.
    #[must_use]
    pub fn stats_file(self) -> String {
        format!("{}_stats.json", self.key())
    }

    /// Stage that runs after this one, if any.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.ordinal()).copied()
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let ordinals: Vec<_> = StageId::ALL.iter().map(|s| s.ordinal()).collect();
        assert_eq!(ordinals, vec![1, 2, 3, 4, 5]);
        assert_eq!(StageId::Features.next(), Some(StageId::Aptitude));
        assert_eq!(StageId::Cells.next(), None);
    }

    #[test]
    fn test_stage_paths() {
        assert_eq!(StageId::BackgroundFilter.workspace_dir(), "02_bg_filter");
        assert_eq!(StageId::Aptitude.stats_file(), "apt_stats.json");
        assert_eq!(StageId::Cells.to_string(), "cells");
    }

    #[test]
    fn test_stage_id_serialize() {
        let json = serde_json::to_string(&StageId::BackgroundFilter).unwrap();
        assert_eq!(json, r#""background_filter""#);
    }
}
