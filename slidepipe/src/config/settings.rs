//! Typed configuration layers.

use crate::core::{LinkStrategy, StageId};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Encoding used for extracted tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TileFormat {
    /// Baseline JPEG.
    Jpg,
    /// Lossless PNG.
    Png,
}

impl Default for TileFormat {
    fn default() -> Self {
        Self::Jpg
    }
}

impl TileFormat {
    /// File extension without the leading dot.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpg => "jpg",
            Self::Png => "png",
        }
    }
}

impl fmt::Display for TileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for TileFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(Self::Jpg),
            "png" => Ok(Self::Png),
            _ => Err(ConfigError::invalid("extraction.format", s, "jpg|png")),
        }
    }
}

/// Upstream directory feeding the cell classification stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellSource {
    /// Tiles accepted by the aptitude filter.
    Apt,
    /// Tiles the background filter classified as tissue.
    Tissue,
    /// Tiles the background filter classified as background.
    Background,
    /// The whole background-filter output tree.
    BgAll,
}

impl Default for CellSource {
    fn default() -> Self {
        Self::Apt
    }
}

impl CellSource {
    /// Wire name, also used as the output subdirectory.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apt => "apt",
            Self::Tissue => "tissue",
            Self::Background => "background",
            Self::BgAll => "bg_all",
        }
    }
}

impl fmt::Display for CellSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellSource {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "apt" => Ok(Self::Apt),
            "tissue" => Ok(Self::Tissue),
            "background" => Ok(Self::Background),
            "bg_all" => Ok(Self::BgAll),
            _ => Err(ConfigError::invalid(
                "cells.source",
                s,
                "one of apt|tissue|background|bg_all",
            )
            .in_stage(StageId::Cells.key())),
        }
    }
}

/// How the cell stage decides that a tile is positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellMode {
    /// A binary image classifier scored against the threshold.
    #[default]
    Classifier,
    /// An object detector; a tile is positive when anything is detected.
    Detector,
}

impl CellMode {
    /// Wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Classifier => "classifier",
            Self::Detector => "detector",
        }
    }
}

impl fmt::Display for CellMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CellMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "classifier" | "cls" => Ok(Self::Classifier),
            "detector" | "detection" => Ok(Self::Detector),
            _ => Err(ConfigError::invalid("cells.mode", s, "classifier|detector").in_stage(StageId::Cells.key())),
        }
    }
}

/// Tiling parameters for stage 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Tile edge length in pixels.
    #[serde(default = "default_tile_size")]
    pub size: u32,
    /// Step between tile origins; defaults to `size` (no overlap).
    #[serde(default)]
    pub stride: Option<u32>,
    /// Tile encoding.
    #[serde(default)]
    pub format: TileFormat,
    /// JPEG quality (1-100).
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    /// PNG compression level (0-9).
    #[serde(default = "default_png_compress_level")]
    pub png_compress_level: u8,
    /// Coordinates per worker task.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Worker threads; defaults to the CPU count.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Extensions recognised as slides in the session input directory.
    #[serde(default = "default_slide_extensions")]
    pub slide_extensions: Vec<String>,
    /// Upper bound on slides tiled per run.
    #[serde(default)]
    pub max_slides: Option<usize>,
}

fn default_tile_size() -> u32 {
    1024
}

fn default_jpeg_quality() -> u8 {
    95
}

fn default_png_compress_level() -> u8 {
    1
}

fn default_chunk_size() -> usize {
    64
}

fn default_slide_extensions() -> Vec<String> {
    ["svs", "tif", "tiff", "ndpi", "png", "jpg", "jpeg"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            size: default_tile_size(),
            stride: None,
            format: TileFormat::default(),
            jpeg_quality: default_jpeg_quality(),
            png_compress_level: default_png_compress_level(),
            chunk_size: default_chunk_size(),
            workers: None,
            slide_extensions: default_slide_extensions(),
            max_slides: None,
        }
    }
}

impl ExtractionConfig {
    /// Sets tile size and stride.
    #[must_use]
    pub fn with_grid(mut self, size: u32, stride: u32) -> Self {
        self.size = size;
        self.stride = Some(stride);
        self
    }

    /// Sets the tile format.
    #[must_use]
    pub fn with_format(mut self, format: TileFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }
}

/// Per-stage parameters; every field is optional so the same shape serves
/// as file layer and override layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Model (or backbone) file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<PathBuf>,
    /// Explicit decision threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
    /// File holding a single threshold value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold_path: Option<PathBuf>,
    /// Items per model call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
    /// Diagnostic samples kept per class.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub samples_per_class: Option<usize>,
    /// How outcomes are materialized.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_strategy: Option<LinkStrategy>,
    /// Model input edge length.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_size: Option<u32>,
}

impl StageSettings {
    /// Creates empty settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shallow overlay: every field set in `higher` replaces the field here;
    /// unset fields are inherited unchanged.
    #[must_use]
    pub fn overlay(&self, higher: &Self) -> Self {
        Self {
            model: higher.model.clone().or_else(|| self.model.clone()),
            threshold: higher.threshold.or(self.threshold),
            threshold_path: higher
                .threshold_path
                .clone()
                .or_else(|| self.threshold_path.clone()),
            batch_size: higher.batch_size.or(self.batch_size),
            samples_per_class: higher.samples_per_class.or(self.samples_per_class),
            link_strategy: higher.link_strategy.or(self.link_strategy),
            image_size: higher.image_size.or(self.image_size),
        }
    }

    /// Sets the model path.
    #[must_use]
    pub fn with_model(mut self, model: impl Into<PathBuf>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the explicit threshold.
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    /// Sets the threshold file.
    #[must_use]
    pub fn with_threshold_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.threshold_path = Some(path.into());
        self
    }

    /// Sets the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Sets the sample count per class.
    #[must_use]
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples_per_class = Some(samples);
        self
    }

    /// Sets the link strategy.
    #[must_use]
    pub fn with_link(mut self, strategy: LinkStrategy) -> Self {
        self.link_strategy = Some(strategy);
        self
    }
}

/// Cell-stage settings: the common stage fields plus the stage gate and the
/// upstream source selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellSettings {
    /// Whether the stage runs at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    /// Which upstream output feeds the stage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<CellSource>,
    /// Classifier or detector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<CellMode>,
    /// Detector NMS IoU threshold.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iou: Option<f64>,
    /// Detector inference size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detector_size: Option<u32>,
    /// Detector class ids that count; every class when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classes: Option<Vec<u32>>,
    /// Also place positive tiles under `by_class/<class name>/`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub by_class_links: Option<bool>,
    /// Common stage parameters.
    #[serde(flatten)]
    pub stage: StageSettings,
}

impl CellSettings {
    /// Shallow overlay, see [`StageSettings::overlay`].
    #[must_use]
    pub fn overlay(&self, higher: &Self) -> Self {
        Self {
            enabled: higher.enabled.or(self.enabled),
            source: higher.source.or(self.source),
            mode: higher.mode.or(self.mode),
            iou: higher.iou.or(self.iou),
            detector_size: higher.detector_size.or(self.detector_size),
            classes: higher.classes.clone().or_else(|| self.classes.clone()),
            by_class_links: higher.by_class_links.or(self.by_class_links),
            stage: self.stage.overlay(&higher.stage),
        }
    }

    /// Enables or disables the stage.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Selects the upstream source.
    #[must_use]
    pub fn with_source(mut self, source: CellSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Selects classifier or detector mode.
    #[must_use]
    pub fn with_mode(mut self, mode: CellMode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Restricts the detector to `classes`.
    #[must_use]
    pub fn with_classes(mut self, classes: impl IntoIterator<Item = u32>) -> Self {
        self.classes = Some(classes.into_iter().collect());
        self
    }

    /// Enables per-class placement of detector positives.
    #[must_use]
    pub fn with_by_class_links(mut self, enabled: bool) -> Self {
        self.by_class_links = Some(enabled);
        self
    }

    /// Replaces the common stage parameters.
    #[must_use]
    pub fn with_stage(mut self, stage: StageSettings) -> Self {
        self.stage = stage;
        self
    }
}

/// Artifact router settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Path prefixes treated as cross-device mounts; a failed symlink from a
    /// source under one of them is retried as a hardlink before copying.
    #[serde(default = "default_cross_device_prefixes")]
    pub cross_device_prefixes: Vec<PathBuf>,
}

fn default_cross_device_prefixes() -> Vec<PathBuf> {
    vec![PathBuf::from("/mnt/")]
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            cross_device_prefixes: default_cross_device_prefixes(),
        }
    }
}

/// The file-supplied configuration for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Tiling parameters.
    #[serde(default)]
    pub extraction: ExtractionConfig,
    /// Background filter.
    #[serde(default)]
    pub background: StageSettings,
    /// Feature extraction.
    #[serde(default)]
    pub features: StageSettings,
    /// Aptitude filter.
    #[serde(default)]
    pub aptitude: StageSettings,
    /// Cell classification.
    #[serde(default)]
    pub cells: CellSettings,
    /// Artifact router.
    #[serde(default)]
    pub router: RouterConfig,
}

impl PipelineConfig {
    /// Creates a configuration with every default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document.
    pub fn from_json_str(body: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(body)
            .map_err(|e| ConfigError::invalid("config", "<document>", &format!("valid JSON ({e})")))
    }

    /// Loads a JSON config file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let body = std::fs::read_to_string(path).map_err(|e| ConfigError {
            stage: None,
            key: "config".to_string(),
            message: format!("cannot read '{}': {e}", path.display()),
        })?;
        Self::from_json_str(&body)
    }

    /// File-layer settings for a classification stage.
    #[must_use]
    pub fn stage_settings(&self, stage: StageId) -> StageSettings {
        match stage {
            StageId::Tiles => StageSettings::default(),
            StageId::BackgroundFilter => self.background.clone(),
            StageId::Features => self.features.clone(),
            StageId::Aptitude => self.aptitude.clone(),
            StageId::Cells => self.cells.stage.clone(),
        }
    }
}

/// Per-run overrides; highest precedence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOverrides {
    /// Background filter overrides.
    #[serde(default)]
    pub background: StageSettings,
    /// Feature extraction overrides.
    #[serde(default)]
    pub features: StageSettings,
    /// Aptitude filter overrides.
    #[serde(default)]
    pub aptitude: StageSettings,
    /// Cell classification overrides.
    #[serde(default)]
    pub cells: CellSettings,
}

impl RunOverrides {
    /// Creates empty overrides.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override-layer settings for a classification stage.
    #[must_use]
    pub fn stage_settings(&self, stage: StageId) -> StageSettings {
        match stage {
            StageId::Tiles => StageSettings::default(),
            StageId::BackgroundFilter => self.background.clone(),
            StageId::Features => self.features.clone(),
            StageId::Aptitude => self.aptitude.clone(),
            StageId::Cells => self.cells.stage.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_prefers_higher_layer() {
        let file = StageSettings::new()
            .with_model("/models/bg.keras")
            .with_batch_size(32)
            .with_threshold(0.4);
        let cli = StageSettings::new().with_threshold(0.7);

        let merged = file.overlay(&cli);
        assert_eq!(merged.threshold, Some(0.7));
        assert_eq!(merged.batch_size, Some(32));
        assert_eq!(merged.model, Some(PathBuf::from("/models/bg.keras")));
    }

    #[test]
    fn test_cell_settings_overlay() {
        let file = CellSettings::default()
            .with_enabled(true)
            .with_source(CellSource::Tissue);
        let cli = CellSettings::default().with_enabled(false);

        let merged = file.overlay(&cli);
        assert_eq!(merged.enabled, Some(false));
        assert_eq!(merged.source, Some(CellSource::Tissue));
    }

    #[test]
    fn test_cell_source_parse() {
        assert_eq!("APT".parse::<CellSource>().unwrap(), CellSource::Apt);
        assert_eq!("bg_all".parse::<CellSource>().unwrap(), CellSource::BgAll);
        let err = "everything".parse::<CellSource>().unwrap_err();
        assert_eq!(err.stage.as_deref(), Some("cells"));
    }

    #[test]
    fn test_cell_mode_parse() {
        assert_eq!("Detector".parse::<CellMode>().unwrap(), CellMode::Detector);
        assert_eq!("cls".parse::<CellMode>().unwrap(), CellMode::Classifier);
        let err = "segmenter".parse::<CellMode>().unwrap_err();
        assert_eq!(err.stage.as_deref(), Some("cells"));
    }

    #[test]
    fn test_detector_settings_overlay() {
        let file = CellSettings::default().with_mode(CellMode::Detector).with_classes([0, 2]);
        let cli = CellSettings::default().with_classes([1]);

        let merged = file.overlay(&cli);
        assert_eq!(merged.mode, Some(CellMode::Detector));
        assert_eq!(merged.classes, Some(vec![1]));
        assert_eq!(merged.by_class_links, None);
    }

    #[test]
    fn test_tile_format_parse() {
        assert_eq!("jpeg".parse::<TileFormat>().unwrap(), TileFormat::Jpg);
        assert!("gif".parse::<TileFormat>().is_err());
    }

    #[test]
    fn test_config_from_json_defaults() {
        let config = PipelineConfig::from_json_str(
            r#"{
                "extraction": {"size": 512},
                "background": {"model": "/m/bg.keras", "link_strategy": "copy"},
                "cells": {"enabled": false, "source": "tissue", "batch_size": 8}
            }"#,
        )
        .unwrap();

        assert_eq!(config.extraction.size, 512);
        assert_eq!(config.extraction.stride, None);
        assert_eq!(config.extraction.chunk_size, 64);
        assert_eq!(config.background.link_strategy, Some(LinkStrategy::Copy));
        assert_eq!(config.cells.source, Some(CellSource::Tissue));
        assert_eq!(config.cells.stage.batch_size, Some(8));
        assert_eq!(config.router.cross_device_prefixes, vec![PathBuf::from("/mnt/")]);
    }

    #[test]
    fn test_config_rejects_invalid_source() {
        let err = PipelineConfig::from_json_str(r#"{"cells": {"source": "nowhere"}}"#).unwrap_err();
        assert_eq!(err.key, "config");
    }
}
