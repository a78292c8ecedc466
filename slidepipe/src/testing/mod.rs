//! Testing utilities for slidepipe stages and pipelines.
//!
//! This module provides:
//! - Mock stages, a deterministic model backend and synthetic slides
//! - On-disk fixtures (slides, tiles, feature files, sessions)
//! - Assertions for stage outputs and stats

mod assertions;
pub mod fixtures;
mod mocks;

pub use assertions::{
    assert_conserved, assert_counts, assert_output_failed, assert_output_status,
    assert_output_succeeded, output_stats,
};
pub use fixtures::PipelineFixture;
pub use mocks::{CountingOpener, FakeBackend, FakeFault, MockStage, SyntheticSlideOpener};
