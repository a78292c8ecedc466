//! Cooperative cancellation.
//!
//! A single [`CancellationToken`] is shared by the orchestrator, every stage
//! and the tile worker pool of a run.

mod token;

pub use token::CancellationToken;
