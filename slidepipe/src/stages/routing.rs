//! Shared plumbing of the classification stages.
//!
//! Every thresholding stage does the same thing with a score: pick a class,
//! place the item under that class directory through the artifact router,
//! offer it to the per-class sampler and count it. [`BinaryRouter`] owns that
//! bookkeeping so each stage only decides what the item and its score are.

use super::{ensure_dirs, StageContext, StageError};
use crate::core::{LinkStrategy, LinkTally, StageStats};
use crate::errors::{ItemError, ItemErrorKind};
use crate::models::{ensure_batch_len, load_rgb, ImageClassifier};
use crate::sampler::ClassSamples;
use image::RgbImage;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory (under a stage output) holding diagnostic samples.
pub const SAMPLES_DIR: &str = "_samples";

/// Per-item failures recorded by a stage.
pub const FAILED_FILE: &str = "failed.json";

/// Labels of a binary split: the kept class first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassLabels {
    /// Class of items scoring at or above the threshold.
    pub kept: &'static str,
    /// Class of every other item.
    pub other: &'static str,
}

impl ClassLabels {
    /// Tissue vs. background.
    pub const BACKGROUND: Self = Self {
        kept: "tissue",
        other: "background",
    };
    /// Apt vs. not apt.
    pub const APTITUDE: Self = Self {
        kept: "apt",
        other: "not_apt",
    };
    /// Positive vs. negative cells.
    pub const CELLS: Self = Self {
        kept: "positive",
        other: "negative",
    };
}

/// Routes scored items into `<root>/<class>/<relative path>`.
#[derive(Debug)]
pub struct BinaryRouter<'a> {
    ctx: &'a StageContext,
    root: PathBuf,
    labels: ClassLabels,
    threshold: f64,
    strategy: LinkStrategy,
    tally: LinkTally,
    samples: ClassSamples,
    kept: u64,
    other: u64,
}

impl<'a> BinaryRouter<'a> {
    /// Creates both class directories under `root`.
    pub fn new(ctx: &'a StageContext, root: impl Into<PathBuf>, labels: ClassLabels) -> Result<Self, StageError> {
        let root = root.into();
        ensure_dirs([root.join(labels.kept).as_path(), root.join(labels.other).as_path()])?;
        let config = ctx.config();
        Ok(Self {
            ctx,
            root,
            labels,
            threshold: config.threshold_or_default(),
            strategy: config.link_strategy,
            tally: LinkTally::new(),
            samples: ClassSamples::new(config.samples_per_class),
            kept: 0,
            other: 0,
        })
    }

    /// The threshold in force.
    #[must_use]
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether `score` falls in the kept class.
    #[must_use]
    pub fn is_kept(&self, score: f32) -> bool {
        f64::from(score) >= self.threshold
    }

    /// Places `src` at `<root>/<class>/<rel>` and returns whether it was kept.
    pub fn route(&mut self, src: &Path, rel: &Path, score: f32) -> Result<bool, StageError> {
        let kept = self.is_kept(score);
        let confidence = if kept { score } else { 1.0 - score };
        self.route_decided(src, rel, kept, confidence)?;
        Ok(kept)
    }

    /// Places `src` in the class chosen by the caller; `confidence` ranks it
    /// among that class's samples.
    pub fn route_decided(&mut self, src: &Path, rel: &Path, kept: bool, confidence: f32) -> Result<(), StageError> {
        let class = if kept {
            self.kept += 1;
            self.labels.kept
        } else {
            self.other += 1;
            self.labels.other
        };
        let dst = self.root.join(class).join(rel);
        let effective = self.ctx.router().place(src, &dst, self.strategy)?;
        self.tally.record(effective);
        self.samples.offer(class, confidence, src);
        Ok(())
    }

    /// The requested link strategy.
    #[must_use]
    pub fn strategy(&self) -> LinkStrategy {
        self.strategy
    }

    /// Materializes samples under `<root>/_samples` and builds the stats.
    pub fn finish(self, failed: u64) -> Result<StageStats, StageError> {
        let samples_dir = self.root.join(SAMPLES_DIR);
        let sample_links = self
            .samples
            .materialize(self.ctx.router(), &samples_dir, self.strategy)?;
        debug!(placed = sample_links.total(), dir = %samples_dir.display(), "samples written");

        let config = self.ctx.config();
        let mut stats = StageStats::new()
            .with_threshold(self.threshold)
            .with_links(self.strategy, &self.tally)
            .with_batch_size(config.batch_size);
        stats.samples_per_class = Some(config.samples_per_class);
        stats.processed = self.kept + self.other;
        stats.saved = self.kept;
        stats.discarded = self.other;
        stats.failed = failed;
        stats.set_kept(self.labels.kept, self.kept);
        stats.set_kept(self.labels.other, self.other);
        stats.set_extra("input_total", serde_json::json!(stats.input_total()));
        Ok(stats)
    }
}

/// Persists per-item failures as `<dir>/failed.json` when there are any.
pub(crate) fn write_failures(dir: &Path, failures: &[ItemError]) -> Result<(), StageError> {
    if failures.is_empty() {
        return Ok(());
    }
    let path = dir.join(FAILED_FILE);
    let body = serde_json::to_string_pretty(failures).map_err(|e| StageError::io(&path, std::io::Error::other(e)))?;
    fs::write(&path, body).map_err(|e| StageError::io(&path, e))
}

/// Wraps a model failure as a stage error.
pub(crate) fn model_error(ctx: &StageContext, err: &anyhow::Error) -> StageError {
    ctx.error(format!("model error: {err:#}")).into()
}

/// Decodes a batch, recording unreadable files instead of failing.
pub(crate) fn load_batch(
    paths: &[PathBuf],
    image_size: Option<u32>,
    failures: &mut Vec<ItemError>,
) -> (Vec<PathBuf>, Vec<RgbImage>) {
    let mut loaded = Vec::with_capacity(paths.len());
    let mut images = Vec::with_capacity(paths.len());
    for path in paths {
        match load_rgb(path, image_size) {
            Ok(image) => {
                loaded.push(path.clone());
                images.push(image);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable image");
                failures.push(ItemError::new(path, ItemErrorKind::UnreadableImage, format!("{e:#}")));
            }
        }
    }
    (loaded, images)
}

/// Scores `paths` in sequential batches of the configured size, calling
/// `on_score` for every readable image.
///
/// Cancellation is checked before each batch.
pub(crate) fn score_images<F>(
    ctx: &StageContext,
    classifier: &dyn ImageClassifier,
    paths: &[PathBuf],
    failures: &mut Vec<ItemError>,
    mut on_score: F,
) -> Result<(), StageError>
where
    F: FnMut(&Path, f32) -> Result<(), StageError>,
{
    let config = ctx.config();
    for batch in paths.chunks(config.batch_size.max(1)) {
        ctx.check_cancel()?;
        let (loaded, images) = load_batch(batch, config.image_size, failures);
        if images.is_empty() {
            continue;
        }
        let scores = classifier.predict(&images).map_err(|e| model_error(ctx, &e))?;
        ensure_batch_len(images.len(), scores.len()).map_err(|e| model_error(ctx, &e))?;
        drop(images);
        for (path, score) in loaded.iter().zip(scores) {
            on_score(path, score)?;
        }
    }
    Ok(())
}

/// `<parent dir name>/<file name>` of a tile path.
pub(crate) fn slide_relative(path: &Path) -> PathBuf {
    let file = path.file_name().map(PathBuf::from).unwrap_or_default();
    match path.parent().and_then(Path::file_name) {
        Some(parent) => Path::new(parent).join(file),
        None => file,
    }
}
