//! # Slidepipe
//!
//! Tiling and staged classification of whole-slide images.
//!
//! A run takes the slides dropped into a session's `input/` directory through
//! five sequential stages:
//!
//! - **Tiling**: cut every slide into a regular grid of tiles
//! - **Background filter**: route tiles to `tissue/` or `background/`
//! - **Feature extraction**: one feature vector per tissue tile
//! - **Aptitude filter**: route tissue tiles to `apt/` or `not_apt/` by their features
//! - **Cell classification**: optional, over a configurable upstream source
//!
//! Each stage owns one workspace directory, writes a stats artifact, and a
//! unified report rolls them up at the end. Models are supplied through the
//! [`models::ModelBackend`] trait.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use slidepipe::prelude::*;
//!
//! let resolver = ConfigResolver::new(PipelineConfig::from_json_file(path)?, RunOverrides::new());
//! let stages = StageSet::builtin(backend, Arc::new(ImageSlideOpener::new()));
//! let session = SessionPaths::new("sessions", "run-1")?;
//!
//! let report = Pipeline::new(resolver, stages).run(&session).await?.into_result()?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_possible_truncation
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod metrics;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod router;
pub mod sampler;
pub mod session;
pub mod stages;
pub mod testing;
pub mod tiler;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancellationToken;
    pub use crate::config::{
        CellSettings, CellSource, ConfigResolver, PipelineConfig, RunOverrides, StageConfig,
        StageSettings,
    };
    pub use crate::core::{LinkStrategy, RunStatus, StageId, StageOutput, StageStats, StageStatus};
    pub use crate::errors::{
        ConfigError, ItemError, PipelineError, RouterError, SessionError, StageExecutionError,
    };
    pub use crate::events::{EventSink, JsonlEventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::metrics::{aggregate, PipelineReport};
    pub use crate::models::ModelBackend;
    pub use crate::observability::{init_tracing, LoggingConfig};
    pub use crate::pipeline::Pipeline;
    pub use crate::router::ArtifactRouter;
    pub use crate::session::SessionPaths;
    pub use crate::stages::{CommandStage, Stage, StageContext, StageSet};
    pub use crate::tiler::{ImageSlideOpener, SlideOpener};
    pub use crate::utils::{human_time, iso_timestamp, Timestamp};
}
