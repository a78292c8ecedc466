//! Metrics aggregation.
//!
//! After the last stage (or the aborting one), the orchestrator hands the
//! session to a [`MetricsAggregator`], which reads every stage's stats
//! artifact and writes `artifacts/reports/pipeline_report.json`.

mod aggregator;
mod report;

pub use aggregator::{aggregate, MetricsAggregator};
pub use report::{PipelineReport, RunSettings, StageReport};
