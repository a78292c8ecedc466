//! Pipeline orchestration.
//!
//! This module provides:
//! - [`Pipeline`], which runs tile -> background filter -> features ->
//!   aptitude -> cells over one session, strictly in sequence
//! - [`StagePlan`], the wiring of each stage's input to an earlier output
//! - [`StageRecord`], what the run remembers about each stage

mod orchestrator;
mod records;


pub use orchestrator::{Pipeline, StagePlan};
pub use records::StageRecord;
