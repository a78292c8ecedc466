//! Stage 5: optional cell classification of accepted tiles.
//!
//! Two modes share one output layout. The classifier mode scores each tile
//! against the threshold; the detector mode runs an object detector and
//! calls a tile positive when at least one box survives the confidence cut
//! and the class filter.

use super::routing::{load_batch, model_error, score_images, write_failures};
use super::{ensure_dirs, run_blocking, BinaryRouter, ClassLabels, Stage, StageContext, StageError};
use crate::config::DetectionParams;
use crate::core::{StageId, StageOutput, StageStats};
use crate::errors::ItemError;
use crate::models::{ensure_batch_len, Detection, Detector, ModelBackend};
use crate::utils::list_images;
use async_trait::async_trait;
use csv::WriterBuilder;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Raw predictions, relative to the stage output.
pub const PREDICTIONS_FILE: &str = "raw_preds/preds.csv";

/// Per-box detections (detector mode), relative to the stage output.
pub const DETECTIONS_FILE: &str = "raw_preds/detections.csv";

/// Per-class placement of detector positives, relative to the stage output.
pub const BY_CLASS_DIR: &str = "by_class";

const CLASSIFIER_HEADER: [&str; 4] = ["rel_path", "prob_pos", "label_pred", "threshold_used"];

const DETECTOR_HEADER: [&str; 11] = [
    "rel_path",
    "n_det",
    "top_conf",
    "top_cls_id",
    "top_cls_name",
    "label_pred",
    "conf_used",
    "iou_used",
    "imgsz",
    "classes",
    "counts_json",
];

const BOX_HEADER: [&str; 8] = ["rel_path", "x1", "y1", "x2", "y2", "conf", "cls_id", "cls_name"];

/// Classifies every image of the selected source and routes it to
/// `positive/` or `negative/`, keeping its path relative to the source
/// directory. Every prediction is also written to [`PREDICTIONS_FILE`].
#[derive(Debug, Clone)]
pub struct CellStage {
    backend: Arc<dyn ModelBackend>,
}

impl CellStage {
    /// Creates the stage over a model backend.
    #[must_use]
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self { backend }
    }
}

/// A CSV artifact with a fixed header, written even when it gets no rows.
struct CsvTable {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl CsvTable {
    fn create(path: PathBuf, header: &[&str]) -> Result<Self, StageError> {
        if let Some(parent) = path.parent() {
            ensure_dirs([parent])?;
        }
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .map_err(|e| StageError::csv(&path, e))?;
        writer.write_record(header).map_err(|e| StageError::csv(&path, e))?;
        Ok(Self { path, writer })
    }

    fn row(&mut self, row: &impl Serialize) -> Result<(), StageError> {
        self.writer.serialize(row).map_err(|e| StageError::csv(&self.path, e))
    }

    fn close(mut self) -> Result<(), StageError> {
        self.writer.flush().map_err(|e| StageError::io(&self.path, e))
    }
}

#[derive(Serialize)]
struct ScoreRow<'a> {
    rel_path: &'a str,
    prob_pos: String,
    label_pred: u8,
    threshold_used: f64,
}

#[derive(Serialize)]
struct DetectionRow<'a> {
    rel_path: &'a str,
    n_det: usize,
    top_conf: String,
    top_cls_id: Option<u32>,
    top_cls_name: &'a str,
    label_pred: u8,
    conf_used: f64,
    iou_used: f64,
    imgsz: u32,
    classes: &'a str,
    counts_json: String,
}

#[derive(Serialize)]
struct BoxRow<'a> {
    rel_path: &'a str,
    x1: String,
    y1: String,
    x2: String,
    y2: String,
    conf: String,
    cls_id: u32,
    cls_name: &'a str,
}

fn classify(backend: &dyn ModelBackend, ctx: &StageContext) -> Result<StageStats, StageError> {
    let input = ctx.input_dir();
    let mut router = BinaryRouter::new(ctx, ctx.output_dir(), ClassLabels::CELLS)?;
    let threshold = router.threshold();
    let mut preds = CsvTable::create(ctx.output_dir().join(PREDICTIONS_FILE), &CLASSIFIER_HEADER)?;
    let images = list_images(input);
    let mut failures = Vec::new();

    if images.is_empty() {
        warn!(input = %input.display(), "no images to classify");
    } else {
        info!(images = images.len(), source = %input.display(), threshold, "classifying cells");
        let model = backend
            .image_classifier(ctx.require_model()?, ctx.config().image_size)
            .map_err(|e| model_error(ctx, &e))?;
        score_images(ctx, model.as_ref(), &images, &mut failures, |path, score| {
            let rel = path.strip_prefix(input).unwrap_or(path);
            let rel_path = rel.to_string_lossy();
            let positive = router.route(path, rel, score)?;
            preds.row(&ScoreRow {
                rel_path: &rel_path,
                prob_pos: format!("{score:.6}"),
                label_pred: u8::from(positive),
                threshold_used: threshold,
            })
        })?;
    }

    preds.close()?;
    write_failures(ctx.output_dir(), &failures)?;
    router.finish(failures.len() as u64)
}

/// Detector output for one tile after the confidence cut and class filter.
#[derive(Debug, Default)]
struct TileDetections {
    boxes: Vec<Detection>,
    counts: BTreeMap<u32, usize>,
    top: Option<Detection>,
}

impl TileDetections {
    fn new(raw: Vec<Detection>, threshold: f64, params: &DetectionParams) -> Self {
        let mut tile = Self::default();
        for det in raw {
            if f64::from(det.confidence) < threshold || !params.accepts(det.class_id) {
                continue;
            }
            *tile.counts.entry(det.class_id).or_default() += 1;
            if tile.top.map_or(true, |top| det.confidence > top.confidence) {
                tile.top = Some(det);
            }
            tile.boxes.push(det);
        }
        tile
    }

    fn is_positive(&self) -> bool {
        !self.boxes.is_empty()
    }

    fn top_confidence(&self) -> f32 {
        self.top.map_or(0.0, |top| top.confidence)
    }
}

/// Writes the detector artifacts and places tiles, one tile at a time.
struct DetectionSink<'a, 'c> {
    ctx: &'c StageContext,
    input: &'c Path,
    router: BinaryRouter<'c>,
    detector: &'a dyn Detector,
    params: &'a DetectionParams,
    classes: String,
    preds: CsvTable,
    boxes: CsvTable,
    by_class: BTreeMap<String, u64>,
    detections_total: u64,
}

impl DetectionSink<'_, '_> {
    fn class_name(&self, class_id: u32) -> String {
        self.detector
            .class_name(class_id)
            .unwrap_or_else(|| class_id.to_string())
    }

    fn record(&mut self, path: &Path, tile: &TileDetections) -> Result<(), StageError> {
        let rel = path.strip_prefix(self.input).unwrap_or(path);
        let rel_str = rel.to_string_lossy();
        let positive = tile.is_positive();

        for det in &tile.boxes {
            let name = self.class_name(det.class_id);
            self.boxes.row(&BoxRow {
                rel_path: &rel_str,
                x1: format!("{:.2}", det.x1),
                y1: format!("{:.2}", det.y1),
                x2: format!("{:.2}", det.x2),
                y2: format!("{:.2}", det.y2),
                conf: format!("{:.6}", det.confidence),
                cls_id: det.class_id,
                cls_name: &name,
            })?;
        }

        let counts: serde_json::Map<String, serde_json::Value> = tile
            .counts
            .iter()
            .map(|(id, n)| (self.class_name(*id), serde_json::json!(n)))
            .collect();
        let top_name = tile.top.map(|top| self.class_name(top.class_id)).unwrap_or_default();
        self.preds.row(&DetectionRow {
            rel_path: &rel_str,
            n_det: tile.boxes.len(),
            top_conf: format!("{:.6}", tile.top_confidence()),
            top_cls_id: tile.top.map(|top| top.class_id),
            top_cls_name: &top_name,
            label_pred: u8::from(positive),
            conf_used: self.router.threshold(),
            iou_used: self.params.iou,
            imgsz: self.params.image_size,
            classes: &self.classes,
            counts_json: serde_json::Value::Object(counts).to_string(),
        })?;

        let confidence = if positive { tile.top_confidence() } else { 1.0 };
        self.router.route_decided(path, rel, positive, confidence)?;
        self.detections_total += tile.boxes.len() as u64;

        if positive && self.params.by_class_links {
            for class_id in tile.counts.keys() {
                let name = self.class_name(*class_id).replace('/', "_");
                let dst = self.ctx.output_dir().join(BY_CLASS_DIR).join(&name).join(rel);
                self.ctx.router().place(path, &dst, self.router.strategy())?;
                *self.by_class.entry(name).or_default() += 1;
            }
        }
        Ok(())
    }

    fn finish(self, failures: &[ItemError]) -> Result<StageStats, StageError> {
        self.preds.close()?;
        self.boxes.close()?;
        write_failures(self.ctx.output_dir(), failures)?;
        let mut stats = self.router.finish(failures.len() as u64)?;
        stats.set_extra("mode", serde_json::json!("detector"));
        stats.set_extra("iou_used", serde_json::json!(self.params.iou));
        stats.set_extra("imgsz", serde_json::json!(self.params.image_size));
        stats.set_extra("classes", serde_json::json!(self.params.classes));
        stats.set_extra("detections_total", serde_json::json!(self.detections_total));
        if self.params.by_class_links {
            stats.set_extra("by_class_counts", serde_json::json!(self.by_class));
        }
        Ok(stats)
    }
}

fn detect(backend: &dyn ModelBackend, ctx: &StageContext, params: &DetectionParams) -> Result<StageStats, StageError> {
    let input = ctx.input_dir();
    let config = ctx.config();
    let router = BinaryRouter::new(ctx, ctx.output_dir(), ClassLabels::CELLS)?;
    let threshold = router.threshold();
    let images = list_images(input);
    let mut failures = Vec::new();

    if images.is_empty() {
        warn!(input = %input.display(), "no images to run the detector on");
        CsvTable::create(ctx.output_dir().join(PREDICTIONS_FILE), &DETECTOR_HEADER)?.close()?;
        CsvTable::create(ctx.output_dir().join(DETECTIONS_FILE), &BOX_HEADER)?.close()?;
        let mut stats = router.finish(0)?;
        stats.set_extra("mode", serde_json::json!("detector"));
        return Ok(stats);
    }
    let model = backend
        .detector(ctx.require_model()?, params.image_size, params.iou)
        .map_err(|e| model_error(ctx, &e))?;

    info!(images = images.len(), source = %input.display(), conf = threshold, iou = params.iou, "detecting cells");
    let mut sink = DetectionSink {
        ctx,
        input,
        router,
        detector: model.as_ref(),
        params,
        classes: params
            .classes
            .as_ref()
            .map(|ids| ids.iter().map(u32::to_string).collect::<Vec<_>>().join("|"))
            .unwrap_or_default(),
        preds: CsvTable::create(ctx.output_dir().join(PREDICTIONS_FILE), &DETECTOR_HEADER)?,
        boxes: CsvTable::create(ctx.output_dir().join(DETECTIONS_FILE), &BOX_HEADER)?,
        by_class: BTreeMap::new(),
        detections_total: 0,
    };

    for batch in images.chunks(config.batch_size.max(1)) {
        ctx.check_cancel()?;
        let (loaded, decoded) = load_batch(batch, config.image_size, &mut failures);
        if decoded.is_empty() {
            continue;
        }
        let results = model.detect(&decoded).map_err(|e| model_error(ctx, &e))?;
        ensure_batch_len(decoded.len(), results.len()).map_err(|e| model_error(ctx, &e))?;
        drop(decoded);
        for (path, raw) in loaded.iter().zip(results) {
            let tile = TileDetections::new(raw, threshold, params);
            debug!(path = %path.display(), boxes = tile.boxes.len(), "tile detections");
            sink.record(path, &tile)?;
        }
    }

    sink.finish(&failures)
}

#[async_trait]
impl Stage for CellStage {
    fn id(&self) -> StageId {
        StageId::Cells
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        let backend = Arc::clone(&self.backend);
        run_blocking(ctx, move |ctx| match ctx.config().detection.clone() {
            Some(params) => detect(backend.as_ref(), ctx, &params),
            None => classify(backend.as_ref(), ctx),
        })
        .await
    }
}
