//! Rolls per-stage stats artifacts into a [`PipelineReport`].

use super::report::{PipelineReport, RunSettings, StageReport};
use crate::core::{RunStatus, StageId, StageStats, StageStatus};
use crate::pipeline::StageRecord;
use crate::session::SessionPaths;
use crate::tiler::TileManifest;
use crate::utils::{count_images, human_time, now_ts};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Reads a session's stats artifacts and builds its report.
///
/// Missing or unreadable artifacts degrade to zero-valued stats, so an
/// aborted or partial run still yields a well-formed report.
#[derive(Debug, Clone)]
pub struct MetricsAggregator<'a> {
    session: &'a SessionPaths,
    records: BTreeMap<StageId, StageRecord>,
    status: Option<RunStatus>,
    settings: RunSettings,
    total_seconds: f64,
}

impl<'a> MetricsAggregator<'a> {
    /// Creates an aggregator over `session`.
    #[must_use]
    pub fn new(session: &'a SessionPaths) -> Self {
        Self {
            session,
            records: BTreeMap::new(),
            status: None,
            settings: RunSettings::default(),
            total_seconds: 0.0,
        }
    }

    /// Uses the orchestrator's stage records.
    #[must_use]
    pub fn with_records(mut self, records: impl IntoIterator<Item = StageRecord>) -> Self {
        self.records.extend(records.into_iter().map(|r| (r.stage, r)));
        self
    }

    /// Uses the orchestrator's final status.
    #[must_use]
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Echoes the resolved configuration.
    #[must_use]
    pub fn with_settings(mut self, settings: RunSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Sets the run's wall-clock duration.
    #[must_use]
    pub fn with_total_seconds(mut self, seconds: f64) -> Self {
        self.total_seconds = (seconds * 1000.0).round() / 1000.0;
        self
    }

    fn read_stats(&self, stage: StageId, record: &StageRecord) -> StageStats {
        let path = self.session.stats_path(stage);
        let mut stats = match StageStats::read_json(&path) {
            Ok(stats) => stats,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if record.status.is_success() && !record.skipped {
                    warn!(stage = %stage, path = %path.display(), "stage succeeded without a stats artifact");
                } else {
                    debug!(stage = %stage, "no stats artifact");
                }
                StageStats::new()
            }
            Err(e) => {
                warn!(stage = %stage, path = %path.display(), error = %e, "unreadable stats artifact");
                StageStats::new()
            }
        };
        stats.derive_ratios();
        if !stats.is_conserved() {
            warn!(
                stage = %stage,
                processed = stats.processed,
                saved = stats.saved,
                discarded = stats.discarded,
                "processed != saved + discarded"
            );
        }
        stats
    }

    /// Without orchestrator records, a stage with a stats artifact counts as
    /// finished.
    fn inferred_record(&self, stage: StageId) -> StageRecord {
        let mut record = StageRecord::new(stage);
        if self.session.stats_path(stage).is_file() {
            record.status = StageStatus::Ok;
        }
        record
    }

    fn slides_count(&self) -> usize {
        match TileManifest::read(&self.session.tiles_manifest_path()) {
            Ok(manifest) => manifest.slides.len(),
            Err(e) => {
                debug!(error = %e, "no tile manifest");
                0
            }
        }
    }

    /// Builds the report.
    #[must_use]
    pub fn aggregate(&self) -> PipelineReport {
        let mut stages = BTreeMap::new();
        for stage in StageId::ALL {
            let record = self
                .records
                .get(&stage)
                .cloned()
                .unwrap_or_else(|| self.inferred_record(stage));
            let stats = self.read_stats(stage, &record);
            stages.insert(stage, StageReport { record, stats });
        }

        let status = self.status.clone().unwrap_or_else(|| {
            if stages.values().all(|s| s.status().is_success()) {
                RunStatus::Finished
            } else {
                RunStatus::Pending
            }
        });

        PipelineReport {
            session_id: self.session.id().to_string(),
            ts: now_ts(),
            status,
            total_seconds: self.total_seconds,
            total_time: human_time(self.total_seconds),
            slides_count: self.slides_count(),
            tiles_total: count_images(&self.session.stage_dir(StageId::Tiles)),
            stages,
            settings: self.settings.clone(),
        }
    }
}

/// Builds the report of `session` from its artifacts alone.
#[must_use]
pub fn aggregate(session: &SessionPaths) -> PipelineReport {
    MetricsAggregator::new(session).aggregate()
}
