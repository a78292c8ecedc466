//! Core domain model types for slidepipe.
//!
//! This module contains the fundamental types shared by every stage:
//! - Stage identity and status enums
//! - Link strategy requested from / reported by the artifact router
//! - Stage statistics and the stage output type

mod link;
mod output;
mod stage_id;
mod stats;
mod status;

pub use link::{LinkStrategy, LinkTally};
pub use output::StageOutput;
pub use stage_id::StageId;
pub use stats::{ratio, StageStats};
pub use status::{RunStatus, StageStatus};
