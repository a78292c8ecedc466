//! Pipeline configuration.
//!
//! Three layers feed every stage: built-in defaults, the run's config file,
//! and per-run overrides. [`ConfigResolver`] merges them in that fixed order
//! and produces one immutable [`StageConfig`] per stage.

mod resolver;
mod settings;

pub use resolver::{
    resolve_threshold, ConfigResolver, DetectionParams, StageConfig, StageDefaults, TilingParams,
};
pub use settings::{
    CellMode, CellSettings, CellSource, ExtractionConfig, PipelineConfig, RouterConfig, RunOverrides,
    StageSettings, TileFormat,
};
