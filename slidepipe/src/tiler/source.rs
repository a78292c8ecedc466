//! Slide backends.
//!
//! The tiler only needs two things from a slide: its level-0 dimensions and
//! the ability to read a square region as RGB. Pyramidal formats plug in by
//! implementing [`SlideOpener`] and [`SlideSource`]; [`ImageSlideOpener`]
//! covers every raster format the `image` crate decodes.

use anyhow::{bail, Context};
use image::{imageops, ImageReader, RgbImage};
use parking_lot::Mutex;
use std::fmt::{self, Debug};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// An open slide, owned by exactly one worker.
pub trait SlideSource: Send {
    /// Level-0 `(width, height)` in pixels.
    fn dimensions(&self) -> (u32, u32);

    /// Reads the `size` x `size` region whose top-left corner is `(x, y)`.
    fn read_region(&mut self, x: u32, y: u32, size: u32) -> anyhow::Result<RgbImage>;
}

/// Opens slides; shared by every worker of a pool.
pub trait SlideOpener: Send + Sync + Debug {
    /// Opens the slide at `path`.
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn SlideSource>>;

    /// Called once the tiler is done with `path`.
    fn release(&self, _path: &Path) {}
}

/// Opens any raster the `image` crate can decode, fully into memory.
///
/// A slide is decoded once and the buffer is shared by every worker that
/// opens the same path, so peak memory is one decoded slide rather than one
/// per worker. The buffer is dropped on [`SlideOpener::release`] or when the
/// next slide is opened.
#[derive(Default)]
pub struct ImageSlideOpener {
    decoded: Mutex<Option<(PathBuf, Arc<RgbImage>)>>,
}

impl ImageSlideOpener {
    /// Creates an opener with an empty decode cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn decode(path: &Path) -> anyhow::Result<RgbImage> {
        let mut reader = ImageReader::open(path)
            .with_context(|| format!("failed to open slide {}", path.display()))?
            .with_guessed_format()
            .with_context(|| format!("failed to sniff slide format {}", path.display()))?;
        reader.no_limits();
        Ok(reader
            .decode()
            .with_context(|| format!("failed to decode slide {}", path.display()))?
            .into_rgb8())
    }
}

impl Debug for ImageSlideOpener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cached = self.decoded.lock().as_ref().map(|(path, _)| path.clone());
        f.debug_struct("ImageSlideOpener").field("cached", &cached).finish()
    }
}

impl SlideOpener for ImageSlideOpener {
    fn open(&self, path: &Path) -> anyhow::Result<Box<dyn SlideSource>> {
        // Held across the decode so concurrent openers of one slide wait for it.
        let mut decoded = self.decoded.lock();
        if let Some((cached, image)) = decoded.as_ref() {
            if cached == path {
                return Ok(Box::new(InMemorySlide::shared(Arc::clone(image))));
            }
        }
        *decoded = None;
        let image = Arc::new(Self::decode(path)?);
        debug!(slide = %path.display(), "slide decoded");
        *decoded = Some((path.to_path_buf(), Arc::clone(&image)));
        Ok(Box::new(InMemorySlide::shared(image)))
    }

    fn release(&self, path: &Path) {
        let mut decoded = self.decoded.lock();
        if decoded.as_ref().is_some_and(|(cached, _)| cached == path) {
            *decoded = None;
        }
    }
}

/// A slide held as one decoded RGB buffer.
#[derive(Debug, Clone)]
pub struct InMemorySlide {
    image: Arc<RgbImage>,
}

impl InMemorySlide {
    /// Wraps a decoded image.
    #[must_use]
    pub fn new(image: RgbImage) -> Self {
        Self::shared(Arc::new(image))
    }

    /// Wraps a buffer shared with other handles.
    #[must_use]
    pub fn shared(image: Arc<RgbImage>) -> Self {
        Self { image }
    }
}

impl SlideSource for InMemorySlide {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn read_region(&mut self, x: u32, y: u32, size: u32) -> anyhow::Result<RgbImage> {
        let (w, h) = self.image.dimensions();
        let fits_x = x.checked_add(size).is_some_and(|end| end <= w);
        let fits_y = y.checked_add(size).is_some_and(|end| end <= h);
        if !(fits_x && fits_y) {
            bail!("region ({x}, {y}) size {size} outside {w}x{h}");
        }
        Ok(imageops::crop_imm(self.image.as_ref(), x, y, size, size).to_image())
    }
}
