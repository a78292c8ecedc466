//! Sequential stage orchestration.

use super::StageRecord;
use crate::cancellation::CancellationToken;
use crate::config::{CellSource, ConfigResolver};
use crate::core::{RunStatus, StageId, StageOutput, StageStats, StageStatus};
use crate::errors::PipelineError;
use crate::events::{get_event_sink, CompositeEventSink, EventSink, JsonlEventSink};
use crate::metrics::{MetricsAggregator, PipelineReport, RunSettings};
use crate::router::ArtifactRouter;
use crate::session::SessionPaths;
use crate::stages::{ClassLabels, StageContext, StageSet};
use crate::utils::{has_images, human_time};
use chrono::Utc;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Directories wired into one stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagePlan {
    /// What the stage reads.
    pub input: PathBuf,
    /// What the stage exclusively owns.
    pub output: PathBuf,
    /// Companion images, for the aptitude stage.
    pub companion: Option<PathBuf>,
}

impl StagePlan {
    /// Wires `stage` to the output of the stage before it.
    ///
    /// The cell stage reads whichever upstream tree `source` selects and
    /// writes under `05_cells/<source>/`.
    #[must_use]
    pub fn for_stage(stage: StageId, session: &SessionPaths, source: CellSource) -> Self {
        let bg = session.stage_dir(StageId::BackgroundFilter);
        let tissue = bg.join(ClassLabels::BACKGROUND.kept);
        let (input, companion) = match stage {
            StageId::Tiles => (session.input_dir(), None),
            StageId::BackgroundFilter => (session.stage_dir(StageId::Tiles), None),
            StageId::Features => (tissue, None),
            StageId::Aptitude => (session.stage_dir(StageId::Features), Some(tissue)),
            StageId::Cells => {
                let input = match source {
                    CellSource::Apt => session.stage_dir(StageId::Aptitude).join(ClassLabels::APTITUDE.kept),
                    CellSource::Tissue => tissue,
                    CellSource::Background => bg.join(ClassLabels::BACKGROUND.other),
                    CellSource::BgAll => bg,
                };
                (input, None)
            }
        };
        let mut output = session.stage_dir(stage);
        if stage == StageId::Cells {
            output.push(source.as_str());
        }
        Self {
            input,
            output,
            companion,
        }
    }
}

/// Runs the five stages of a session in order.
///
/// `Pending -> Running(i) -> Completed(i) -> ... -> Finished`, or
/// `Aborted` at the first stage that fails, is cancelled, or reports
/// success without writing its stats artifact. Later stages never start,
/// and the report is written either way.
pub struct Pipeline {
    resolver: ConfigResolver,
    stages: StageSet,
    sink: Arc<dyn EventSink>,
    cancel: Arc<CancellationToken>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("resolver", &self.resolver)
            .field("stages", &self.stages)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Where a stage left the run.
enum Step {
    Done(StageRecord),
    Abort(StageRecord),
}

impl Pipeline {
    /// Creates a pipeline emitting to the process-wide event sink.
    #[must_use]
    pub fn new(resolver: ConfigResolver, stages: StageSet) -> Self {
        Self {
            resolver,
            stages,
            sink: get_event_sink(),
            cancel: Arc::new(CancellationToken::new()),
        }
    }

    /// Emits events to `sink` (in addition to the session event log).
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Shares `token` with every stage.
    #[must_use]
    pub fn with_cancel_token(mut self, token: Arc<CancellationToken>) -> Self {
        self.cancel = token;
        self
    }

    /// The token that cancels a running pipeline.
    #[must_use]
    pub fn cancel_token(&self) -> Arc<CancellationToken> {
        Arc::clone(&self.cancel)
    }

    /// The configuration the pipeline resolves stages from.
    #[must_use]
    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    fn session_sink(&self, session: &SessionPaths) -> Arc<dyn EventSink> {
        let composite = CompositeEventSink::new().with(Arc::clone(&self.sink));
        match JsonlEventSink::create(&session.events_path()) {
            Ok(jsonl) => Arc::new(composite.with(Arc::new(jsonl))),
            Err(e) => {
                warn!(path = %session.events_path().display(), error = %e, "event log unavailable");
                Arc::new(composite)
            }
        }
    }

    /// Runs every stage of `session` and writes its report.
    ///
    /// Stage failures do not make this return `Err`: they end the run with
    /// [`RunStatus::Aborted`] in the returned report. Use
    /// [`PipelineReport::into_result`] to turn that into an error. `Err` is
    /// reserved for a session that cannot be prepared or a report that
    /// cannot be written.
    pub async fn run(&self, session: &SessionPaths) -> Result<PipelineReport, PipelineError> {
        let started = Instant::now();
        session.prepare()?;
        let sink = self.session_sink(session);
        info!(session_id = %session.id(), "pipeline started");
        sink.try_emit("pipeline.started", Some(json!({ "session_id": session.id() })));

        let mut settings = RunSettings::from_resolver(&self.resolver);
        let mut records = Vec::with_capacity(StageId::ALL.len());
        let mut status = RunStatus::Pending;

        for stage in StageId::ALL {
            status = RunStatus::Running { stage };
            debug!(session_id = %session.id(), %status, "run state");
            match self.run_stage(stage, session, sink.as_ref(), &mut settings).await {
                Step::Done(record) => {
                    records.push(record);
                    status = RunStatus::Completed { stage };
                }
                Step::Abort(record) => {
                    let reason = record.reason.clone().unwrap_or_else(|| record.status.to_string());
                    records.push(record);
                    status = RunStatus::Aborted { stage, reason };
                    break;
                }
            }
        }
        if !matches!(status, RunStatus::Aborted { .. }) {
            status = RunStatus::Finished;
        }

        let seconds = started.elapsed().as_secs_f64();
        let report = MetricsAggregator::new(session)
            .with_records(records)
            .with_status(status.clone())
            .with_settings(settings)
            .with_total_seconds(seconds)
            .aggregate();
        report.write(&session.report_path())?;

        match &status {
            RunStatus::Aborted { stage, reason } => {
                error!(session_id = %session.id(), stage = %stage, reason = %reason, took = %human_time(seconds), "pipeline aborted");
                sink.try_emit(
                    "pipeline.aborted",
                    Some(json!({ "session_id": session.id(), "stage": stage, "reason": reason })),
                );
            }
            _ => {
                info!(session_id = %session.id(), took = %human_time(seconds), "pipeline finished");
                sink.try_emit(
                    "pipeline.finished",
                    Some(json!({ "session_id": session.id(), "total_seconds": report.total_seconds })),
                );
            }
        }
        Ok(report)
    }

    fn abort(sink: &dyn EventSink, record: StageRecord) -> Step {
        let event = if record.status == StageStatus::Cancel {
            "stage.cancelled"
        } else {
            "stage.failed"
        };
        warn!(stage = %record.stage, reason = ?record.reason, "{event}");
        sink.try_emit(
            event,
            Some(json!({
                "stage": record.stage,
                "error": record.reason,
                "seconds": record.seconds,
            })),
        );
        Step::Abort(record)
    }

    fn skip(session: &SessionPaths, sink: &dyn EventSink, record: StageRecord) -> Step {
        let stage = record.stage;
        let mut stats = StageStats::new();
        stats.set_kept(ClassLabels::CELLS.kept, 0);
        stats.set_kept(ClassLabels::CELLS.other, 0);
        stats.set_extra("skipped", json!(true));
        stats.derive_ratios();
        if let Err(e) = stats.write_json(&session.stats_path(stage)) {
            let reason = format!("cannot write stats for skipped stage: {e}");
            return Self::abort(sink, StageRecord::rejected(stage, StageStatus::Fail, reason));
        }
        info!(stage = %stage, reason = ?record.reason, "stage skipped");
        sink.try_emit("stage.skipped", Some(json!({ "stage": stage, "reason": record.reason })));
        Step::Done(record)
    }

    async fn run_stage(
        &self,
        stage: StageId,
        session: &SessionPaths,
        sink: &dyn EventSink,
        settings: &mut RunSettings,
    ) -> Step {
        if let Err(reason) = self.cancel.check() {
            return Self::abort(sink, StageRecord::rejected(stage, StageStatus::Cancel, reason));
        }

        let plan = StagePlan::for_stage(stage, session, self.resolver.cell_source());
        if stage == StageId::Cells {
            if !self.resolver.cells_enabled() {
                return Self::skip(session, sink, StageRecord::skipped(stage, "disabled"));
            }
            if !has_images(&plan.input) {
                let reason = format!("no images in {}", plan.input.display());
                return Self::skip(session, sink, StageRecord::skipped(stage, reason));
            }
        }

        let config = match self.resolver.resolve(stage) {
            Ok(config) => config,
            Err(e) => return Self::abort(sink, StageRecord::rejected(stage, StageStatus::Fail, e.to_string())),
        };
        settings.record(&config);
        let Some(runner) = self.stages.get(stage) else {
            let reason = format!("no stage registered for '{stage}'");
            return Self::abort(sink, StageRecord::rejected(stage, StageStatus::Fail, reason));
        };

        let router = ArtifactRouter::from_config(&self.resolver.base().router);
        let mut ctx = StageContext::new(
            session.id(),
            config,
            &plan.input,
            &plan.output,
            session.stats_path(stage),
        )
        .with_router(router)
        .with_cancel(Arc::clone(&self.cancel));
        if let Some(companion) = &plan.companion {
            ctx = ctx.with_companion_dir(companion);
        }

        let mut record = StageRecord::new(stage).with_dirs(plan.input.clone(), plan.output.clone());
        info!(stage = %stage, runner = runner.name(), input = %plan.input.display(), "stage started");
        sink.try_emit(
            "stage.started",
            Some(json!({ "stage": stage, "input": plan.input, "output": plan.output })),
        );

        let started_at = Utc::now();
        let clock = Instant::now();
        let output = runner.execute(&ctx).await;
        record.set_window(&started_at, &Utc::now(), clock.elapsed().as_secs_f64());

        Self::settle(session, sink, record, &output)
    }

    fn settle(session: &SessionPaths, sink: &dyn EventSink, mut record: StageRecord, output: &StageOutput) -> Step {
        let stage = record.stage;
        record.status = output.status;
        record.reason = output.reason().map(str::to_string);
        match output.status {
            StageStatus::Ok | StageStatus::Skip => {
                let stats_path = session.stats_path(stage);
                if !stats_path.is_file() {
                    record.status = StageStatus::Fail;
                    record.reason = Some(format!(
                        "reported success but wrote no stats to {}",
                        stats_path.display()
                    ));
                    return Self::abort(sink, record);
                }
                if output.status == StageStatus::Skip {
                    record.skipped = true;
                    sink.try_emit("stage.skipped", Some(json!({ "stage": stage, "reason": record.reason })));
                } else {
                    let counts = output.stats.as_ref().map(|s| {
                        json!({ "processed": s.processed, "saved": s.saved, "discarded": s.discarded, "failed": s.failed })
                    });
                    sink.try_emit(
                        "stage.completed",
                        Some(json!({ "stage": stage, "seconds": record.seconds, "stats": counts })),
                    );
                }
                Step::Done(record)
            }
            StageStatus::Fail | StageStatus::Cancel => Self::abort(sink, record),
            StageStatus::Pending | StageStatus::Running => {
                record.status = StageStatus::Fail;
                record.reason = Some(format!("stage returned non-terminal status '{}'", output.status));
                Self::abort(sink, record)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_plan_wires_previous_outputs() {
        let session = SessionPaths::new("/s", "r").unwrap();
        let ws = PathBuf::from("/s/r/workspace");

        let bg = StagePlan::for_stage(StageId::BackgroundFilter, &session, CellSource::Apt);
        assert_eq!(bg.input, ws.join("01_tiles"));
        assert_eq!(bg.output, ws.join("02_bg_filter"));

        let feat = StagePlan::for_stage(StageId::Features, &session, CellSource::Apt);
        assert_eq!(feat.input, ws.join("02_bg_filter/tissue"));

        let apt = StagePlan::for_stage(StageId::Aptitude, &session, CellSource::Apt);
        assert_eq!(apt.input, ws.join("03_features"));
        assert_eq!(apt.companion, Some(ws.join("02_bg_filter/tissue")));

        let tiles = StagePlan::for_stage(StageId::Tiles, &session, CellSource::Apt);
        assert_eq!(tiles.input, PathBuf::from("/s/r/input"));
    }

    #[test]
    fn test_plan_cell_sources() {
        let session = SessionPaths::new("/s", "r").unwrap();
        let ws = PathBuf::from("/s/r/workspace");
        let cases = [
            (CellSource::Apt, "04_aptitude/apt", "05_cells/apt"),
            (CellSource::Tissue, "02_bg_filter/tissue", "05_cells/tissue"),
            (CellSource::Background, "02_bg_filter/background", "05_cells/background"),
            (CellSource::BgAll, "02_bg_filter", "05_cells/bg_all"),
        ];
        for (source, input, output) in cases {
            let plan = StagePlan::for_stage(StageId::Cells, &session, source);
            assert_eq!(plan.input, ws.join(input));
            assert_eq!(plan.output, ws.join(output));
        }
    }
}
