//! External model collaborators.
//!
//! The pipeline never implements a classifier. Each classification stage
//! loads its model through a [`ModelBackend`] and then only relies on the
//! batch-in, scores-out contracts below. Backends report failures with
//! [`anyhow::Error`]; a failing model call fails the stage.

use anyhow::{bail, ensure, Context};
use image::imageops::{self, FilterType};
use image::{ImageReader, RgbImage};
use std::fmt::Debug;
use std::path::Path;

/// Binary image classifier: one probability of the positive class per image.
pub trait ImageClassifier: Send + Sync {
    /// Scores a batch of images.
    fn predict(&self, batch: &[RgbImage]) -> anyhow::Result<Vec<f32>>;
}

/// Feature extractor (backbone): one vector per image.
pub trait FeatureExtractor: Send + Sync {
    /// Embeds a batch of images.
    fn extract(&self, batch: &[RgbImage]) -> anyhow::Result<Vec<Vec<f32>>>;
}

/// Binary classifier over feature vectors.
pub trait FeatureClassifier: Send + Sync {
    /// Scores a batch of feature vectors.
    fn predict(&self, batch: &[Vec<f32>]) -> anyhow::Result<Vec<f32>>;
}

/// One detected object, in input-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    /// Left edge.
    pub x1: f32,
    /// Top edge.
    pub y1: f32,
    /// Right edge.
    pub x2: f32,
    /// Bottom edge.
    pub y2: f32,
    /// Detection confidence.
    pub confidence: f32,
    /// Class id.
    pub class_id: u32,
}

/// Object detector: zero or more boxes per image.
pub trait Detector: Send + Sync {
    /// Detects objects in a batch of images, after the detector's own NMS.
    fn detect(&self, batch: &[RgbImage]) -> anyhow::Result<Vec<Vec<Detection>>>;

    /// Human-readable name of a class id.
    fn class_name(&self, class_id: u32) -> Option<String>;
}

/// Loads models by file reference.
pub trait ModelBackend: Send + Sync + Debug {
    /// Loads an image classifier expecting `image_size` square inputs.
    fn image_classifier(
        &self,
        model: &Path,
        image_size: Option<u32>,
    ) -> anyhow::Result<Box<dyn ImageClassifier>>;

    /// Loads a feature extractor; `None` selects the backend's built-in
    /// backbone.
    fn feature_extractor(&self, backbone: Option<&Path>) -> anyhow::Result<Box<dyn FeatureExtractor>>;

    /// Loads a feature-vector classifier.
    fn feature_classifier(&self, model: &Path) -> anyhow::Result<Box<dyn FeatureClassifier>>;

    /// Loads an object detector running at `image_size` with NMS IoU `iou`.
    fn detector(&self, model: &Path, _image_size: u32, _iou: f64) -> anyhow::Result<Box<dyn Detector>> {
        bail!("backend cannot load object detectors ({})", model.display())
    }
}

/// Decodes an image as RGB, resizing it to `size` x `size` (nearest
/// neighbour) when a model input size is configured.
pub fn load_rgb(path: &Path, size: Option<u32>) -> anyhow::Result<RgbImage> {
    let image = ImageReader::open(path)
        .with_context(|| format!("cannot open {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("cannot decode {}", path.display()))?
        .into_rgb8();
    Ok(match size {
        Some(s) if image.dimensions() != (s, s) => imageops::resize(&image, s, s, FilterType::Nearest),
        _ => image,
    })
}

/// Checks that a model returned one output per input.
pub fn ensure_batch_len(expected: usize, got: usize) -> anyhow::Result<()> {
    ensure!(
        expected == got,
        "model returned {got} outputs for a batch of {expected}"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_load_rgb_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.png");
        RgbImage::from_pixel(20, 10, Rgb([1, 2, 3])).save(&path).unwrap();

        assert_eq!(load_rgb(&path, None).unwrap().dimensions(), (20, 10));
        let resized = load_rgb(&path, Some(8)).unwrap();
        assert_eq!(resized.dimensions(), (8, 8));
        assert_eq!(resized.get_pixel(0, 0), &Rgb([1, 2, 3]));
    }

    #[test]
    fn test_load_rgb_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.jpg");
        std::fs::write(&path, b"\xff\xd8garbage").unwrap();
        assert!(load_rgb(&path, None).is_err());
    }

    #[test]
    fn test_ensure_batch_len() {
        assert!(ensure_batch_len(3, 3).is_ok());
        let err = ensure_batch_len(3, 2).unwrap_err();
        assert!(err.to_string().contains("2 outputs for a batch of 3"));
    }
}
