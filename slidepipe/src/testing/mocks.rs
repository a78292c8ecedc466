//! Fakes for stages, models and slides.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use image::{Rgb, RgbImage};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::{StageId, StageOutput, StageStats};
use crate::models::{Detection, Detector, FeatureClassifier, FeatureExtractor, ImageClassifier, ModelBackend};
use crate::stages::{Stage, StageContext};
use crate::tiler::{SlideOpener, SlideSource};

/// A mock stage that records calls and returns a configurable output.
///
/// On a successful output it writes the output's stats to the context's
/// stats path, like a real stage, unless told not to.
#[derive(Debug)]
pub struct MockStage {
    id: StageId,
    output: Mutex<StageOutput>,
    write_stats: bool,
    cancel_with: Option<String>,
    call_count: AtomicUsize,
    inputs: Mutex<Vec<PathBuf>>,
}

impl MockStage {
    /// Creates a mock that succeeds with zero stats.
    #[must_use]
    pub fn new(id: StageId) -> Self {
        Self {
            id,
            output: Mutex::new(StageOutput::ok(StageStats::new())),
            write_stats: true,
            cancel_with: None,
            call_count: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    /// Creates a mock that fails with `error`.
    #[must_use]
    pub fn failing(id: StageId, error: impl Into<String>) -> Self {
        Self::new(id).with_output(StageOutput::fail(error))
    }

    /// Sets the output to return.
    #[must_use]
    pub fn with_output(self, output: StageOutput) -> Self {
        *self.output.lock() = output;
        self
    }

    /// Reports success without writing a stats artifact.
    #[must_use]
    pub fn without_stats_file(mut self) -> Self {
        self.write_stats = false;
        self
    }

    /// Cancels the run's token while executing, then reports success.
    #[must_use]
    pub fn cancelling_run(mut self, reason: impl Into<String>) -> Self {
        self.cancel_with = Some(reason.into());
        self
    }

    /// Returns the number of times the stage was called.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }

    /// Input directories of every call.
    #[must_use]
    pub fn recorded_inputs(&self) -> Vec<PathBuf> {
        self.inputs.lock().clone()
    }
}

#[async_trait]
impl Stage for MockStage {
    fn id(&self) -> StageId {
        self.id
    }

    async fn execute(&self, ctx: &StageContext) -> StageOutput {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        self.inputs.lock().push(ctx.input_dir().to_path_buf());
        if let Some(reason) = &self.cancel_with {
            ctx.cancel_token().cancel(reason.clone());
        }
        let output = self.output.lock().clone();
        if self.write_stats && output.is_success() {
            let stats = output.stats.clone().unwrap_or_default();
            if let Err(e) = ctx.write_stats(&stats) {
                return StageOutput::fail(e.to_string());
            }
        }
        output
    }
}

/// Failure modes a [`FakeBackend`] can inject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FakeFault {
    /// Models load and answer normally.
    #[default]
    None,
    /// Loading any model fails.
    Load,
    /// Every prediction call fails.
    Predict,
    /// Every prediction call returns one output too few.
    ShortBatch,
}

/// Deterministic models over pixel statistics.
///
/// - image classifier: mean red channel / 255;
/// - feature extractor: mean red, green and blue / 255;
/// - feature classifier: the first vector component;
/// - detector: one full-tile box per image whose confidence is the mean red
///   channel, class 0 (`lymphocyte`) when that is at least 0.5 and class 1
///   (`tumor`) otherwise, plus a second class-1 box when mean green is at
///   least 0.5.
///
/// Red tiles therefore score high everywhere and blue tiles low.
#[derive(Debug, Clone, Default)]
pub struct FakeBackend {
    fault: FakeFault,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl FakeBackend {
    /// Creates a well-behaved backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Injects a failure mode.
    #[must_use]
    pub fn with_fault(mut self, fault: FakeFault) -> Self {
        self.fault = fault;
        self
    }

    /// Sizes of every batch any loaded model received, in call order.
    #[must_use]
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    fn check_load(&self, what: &str, path: Option<&Path>) -> anyhow::Result<()> {
        if self.fault == FakeFault::Load {
            bail!("cannot load {what} from {:?}", path);
        }
        Ok(())
    }

    fn model(&self) -> FakeModel {
        FakeModel {
            fault: self.fault,
            batches: Arc::clone(&self.batches),
        }
    }
}

impl ModelBackend for FakeBackend {
    fn image_classifier(&self, model: &Path, _image_size: Option<u32>) -> anyhow::Result<Box<dyn ImageClassifier>> {
        self.check_load("image classifier", Some(model))?;
        Ok(Box::new(self.model()))
    }

    fn feature_extractor(&self, backbone: Option<&Path>) -> anyhow::Result<Box<dyn FeatureExtractor>> {
        self.check_load("feature extractor", backbone)?;
        Ok(Box::new(self.model()))
    }

    fn feature_classifier(&self, model: &Path) -> anyhow::Result<Box<dyn FeatureClassifier>> {
        self.check_load("feature classifier", Some(model))?;
        Ok(Box::new(self.model()))
    }

    fn detector(&self, model: &Path, _image_size: u32, _iou: f64) -> anyhow::Result<Box<dyn Detector>> {
        self.check_load("detector", Some(model))?;
        Ok(Box::new(self.model()))
    }
}

#[derive(Debug)]
struct FakeModel {
    fault: FakeFault,
    batches: Arc<Mutex<Vec<usize>>>,
}

impl FakeModel {
    fn answer<T>(&self, outputs: Vec<T>) -> anyhow::Result<Vec<T>> {
        self.batches.lock().push(outputs.len());
        match self.fault {
            FakeFault::Predict => Err(anyhow!("model crashed")),
            FakeFault::ShortBatch => Ok(outputs.into_iter().skip(1).collect()),
            FakeFault::None | FakeFault::Load => Ok(outputs),
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn channel_means(image: &RgbImage) -> [f32; 3] {
    let count = (u64::from(image.width()) * u64::from(image.height())).max(1) as f32;
    let mut sums = [0u64; 3];
    for pixel in image.pixels() {
        for (sum, value) in sums.iter_mut().zip(pixel.0) {
            *sum += u64::from(value);
        }
    }
    sums.map(|s| s as f32 / count / 255.0)
}

impl ImageClassifier for FakeModel {
    fn predict(&self, batch: &[RgbImage]) -> anyhow::Result<Vec<f32>> {
        self.answer(batch.iter().map(|img| channel_means(img)[0]).collect())
    }
}

impl FeatureExtractor for FakeModel {
    fn extract(&self, batch: &[RgbImage]) -> anyhow::Result<Vec<Vec<f32>>> {
        self.answer(batch.iter().map(|img| channel_means(img).to_vec()).collect())
    }
}

#[allow(clippy::cast_precision_loss)]
fn full_box(image: &RgbImage, confidence: f32, class_id: u32) -> Detection {
    Detection {
        x1: 0.0,
        y1: 0.0,
        x2: image.width() as f32,
        y2: image.height() as f32,
        confidence,
        class_id,
    }
}

impl Detector for FakeModel {
    fn detect(&self, batch: &[RgbImage]) -> anyhow::Result<Vec<Vec<Detection>>> {
        self.answer(
            batch
                .iter()
                .map(|img| {
                    let [red, green, _] = channel_means(img);
                    let mut boxes = vec![full_box(img, red, u32::from(red < 0.5))];
                    if green >= 0.5 {
                        boxes.push(full_box(img, green, 1));
                    }
                    boxes
                })
                .collect(),
        )
    }

    fn class_name(&self, class_id: u32) -> Option<String> {
        match class_id {
            0 => Some("lymphocyte".to_string()),
            1 => Some("tumor".to_string()),
            _ => None,
        }
    }
}

impl FeatureClassifier for FakeModel {
    fn predict(&self, batch: &[Vec<f32>]) -> anyhow::Result<Vec<f32>> {
        self.answer(batch.iter().map(|v| v.first().copied().unwrap_or(0.0)).collect())
    }
}

/// A slide whose pixels are a deterministic gradient, never touching disk.
#[derive(Debug, Clone)]
pub struct SyntheticSlideOpener {
    width: u32,
    height: u32,
    bad_regions: Vec<(u32, u32)>,
    panic_regions: Vec<(u32, u32)>,
    fail_open: bool,
}

impl SyntheticSlideOpener {
    /// A `width` x `height` slide.
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bad_regions: Vec::new(),
            panic_regions: Vec::new(),
            fail_open: false,
        }
    }

    /// Reading the region whose top-left corner is `(x, y)` fails.
    #[must_use]
    pub fn with_bad_region(mut self, x: u32, y: u32) -> Self {
        self.bad_regions.push((x, y));
        self
    }

    /// Reading the region whose top-left corner is `(x, y)` panics.
    #[must_use]
    pub fn with_panicking_region(mut self, x: u32, y: u32) -> Self {
        self.panic_regions.push((x, y));
        self
    }

    /// Opening the slide fails.
    #[must_use]
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl SlideOpener for SyntheticSlideOpener {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn SlideSource>> {
        if self.fail_open {
            bail!("cannot open synthetic slide {}", path.display());
        }
        Ok(Box::new(SyntheticSlide(self.clone())))
    }
}

#[derive(Debug)]
struct SyntheticSlide(SyntheticSlideOpener);

impl SlideSource for SyntheticSlide {
    fn dimensions(&self) -> (u32, u32) {
        (self.0.width, self.0.height)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read_region(&mut self, x: u32, y: u32, size: u32) -> anyhow::Result<RgbImage> {
        if self.0.bad_regions.contains(&(x, y)) {
            bail!("corrupt region at ({x}, {y})");
        }
        assert!(!self.0.panic_regions.contains(&(x, y)), "decoder crashed at ({x}, {y})");
        if x + size > self.0.width || y + size > self.0.height {
            bail!("region ({x}, {y}) size {size} outside slide");
        }
        Ok(RgbImage::from_fn(size, size, |dx, dy| {
            let (px, py) = (x + dx, y + dy);
            Rgb([(px % 256) as u8, (py % 256) as u8, ((px + py) % 256) as u8])
        }))
    }
}

/// Wraps an opener and counts how often a slide was opened.
#[derive(Debug)]
pub struct CountingOpener {
    inner: Box<dyn SlideOpener>,
    opens: AtomicUsize,
}

impl CountingOpener {
    /// Wraps `inner`.
    pub fn new(inner: impl SlideOpener + 'static) -> Self {
        Self {
            inner: Box::new(inner),
            opens: AtomicUsize::new(0),
        }
    }

    /// Number of `open` calls so far.
    #[must_use]
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

impl SlideOpener for CountingOpener {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn SlideSource>> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.inner.open(path)
    }

    fn release(&self, path: &Path) {
        self.inner.release(path);
    }
}
