//! Test assertions for stage outputs and stats.

use crate::core::{StageOutput, StageStats, StageStatus};

/// Asserts that the output indicates success.
pub fn assert_output_succeeded(output: &StageOutput) {
    assert!(
        output.is_success(),
        "Expected success, got {:?} ({:?})",
        output.status,
        output.reason()
    );
}

/// Asserts that the output indicates failure.
pub fn assert_output_failed(output: &StageOutput) {
    assert!(
        output.is_failure(),
        "Expected failure, got status: {:?}",
        output.status
    );
}

/// Asserts that the output has the expected status.
pub fn assert_output_status(output: &StageOutput, expected: StageStatus) {
    assert_eq!(
        output.status, expected,
        "Expected status {:?}, got {:?}",
        expected, output.status
    );
}

/// Asserts `processed == saved + discarded`.
pub fn assert_conserved(stats: &StageStats) {
    assert!(
        stats.is_conserved(),
        "processed {} != saved {} + discarded {}",
        stats.processed,
        stats.saved,
        stats.discarded
    );
}

/// Asserts `(processed, saved, discarded, failed)`.
pub fn assert_counts(stats: &StageStats, processed: u64, saved: u64, discarded: u64, failed: u64) {
    assert_eq!(
        (stats.processed, stats.saved, stats.discarded, stats.failed),
        (processed, saved, discarded, failed),
        "(processed, saved, discarded, failed) mismatch"
    );
}

/// Returns the stats of a successful output.
pub fn output_stats(output: &StageOutput) -> &StageStats {
    assert_output_succeeded(output);
    match &output.stats {
        Some(stats) => stats,
        None => panic!("successful output carries no stats"),
    }
}
