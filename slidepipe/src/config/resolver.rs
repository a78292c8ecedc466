//! Resolution of per-stage configuration.

use super::settings::{CellMode, CellSettings, CellSource, PipelineConfig, RunOverrides, StageSettings, TileFormat};
use crate::core::{LinkStrategy, StageId};
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Resolves a threshold from, in priority order, an explicit value, a
/// threshold file, and a default.
///
/// The file must hold a single floating point number (surrounding
/// whitespace is ignored). A missing or unparsable file falls through to
/// `default` rather than failing.
#[must_use]
pub fn resolve_threshold(explicit: Option<f64>, threshold_file: Option<&Path>, default: f64) -> f64 {
    if let Some(value) = explicit {
        return value;
    }
    if let Some(path) = threshold_file {
        match std::fs::read_to_string(path) {
            Ok(body) => match body.trim().parse::<f64>() {
                Ok(value) if value.is_finite() => return value,
                _ => debug!(path = %path.display(), "threshold file unparsable, using default"),
            },
            Err(e) => debug!(path = %path.display(), error = %e, "threshold file unreadable, using default"),
        }
    }
    default
}

/// Built-in defaults for one stage; lowest precedence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageDefaults {
    /// Default threshold, `None` for stages that do not threshold.
    pub threshold: Option<f64>,
    /// Default batch size.
    pub batch_size: usize,
    /// Default samples per class.
    pub samples_per_class: usize,
    /// Default link strategy.
    pub link_strategy: LinkStrategy,
    /// Whether the stage cannot run without a model path.
    pub requires_model: bool,
}

impl StageDefaults {
    /// Returns the defaults for a stage.
    #[must_use]
    pub fn for_stage(stage: StageId) -> Self {
        match stage {
            StageId::Tiles => Self {
                threshold: None,
                batch_size: 64,
                samples_per_class: 0,
                link_strategy: LinkStrategy::None,
                requires_model: false,
            },
            StageId::BackgroundFilter => Self {
                threshold: Some(0.5),
                batch_size: 64,
                samples_per_class: 12,
                link_strategy: LinkStrategy::Symlink,
                requires_model: true,
            },
            StageId::Features => Self {
                threshold: None,
                batch_size: 64,
                samples_per_class: 0,
                link_strategy: LinkStrategy::None,
                requires_model: false,
            },
            StageId::Aptitude => Self {
                threshold: Some(0.5),
                batch_size: 256,
                samples_per_class: 12,
                link_strategy: LinkStrategy::Symlink,
                requires_model: true,
            },
            StageId::Cells => Self {
                threshold: Some(0.25),
                batch_size: 16,
                samples_per_class: 12,
                link_strategy: LinkStrategy::Symlink,
                requires_model: true,
            },
        }
    }
}

/// Tiling parameters after defaults are applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilingParams {
    /// Tile edge length.
    pub size: u32,
    /// Step between tile origins.
    pub stride: u32,
    /// Tile encoding.
    pub format: TileFormat,
    /// JPEG quality.
    pub jpeg_quality: u8,
    /// PNG compression level.
    pub png_compress_level: u8,
    /// Coordinates per worker task.
    pub chunk_size: usize,
    /// Worker threads.
    pub workers: usize,
    /// Slide file extensions.
    pub slide_extensions: Vec<String>,
    /// Upper bound on slides.
    pub max_slides: Option<usize>,
}

/// Detector parameters of the cell stage in [`CellMode::Detector`].
///
/// The confidence cut is the stage threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionParams {
    /// NMS IoU threshold handed to the detector.
    pub iou: f64,
    /// Inference size handed to the detector.
    pub image_size: u32,
    /// Class ids that count; every class when `None`.
    pub classes: Option<Vec<u32>>,
    /// Whether positives are also placed under `by_class/<name>/`.
    pub by_class_links: bool,
}

impl DetectionParams {
    /// Whether detections of `class_id` count.
    #[must_use]
    pub fn accepts(&self, class_id: u32) -> bool {
        self.classes.as_ref().map_or(true, |classes| classes.contains(&class_id))
    }
}

/// The resolved, immutable parameters handed to one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// The stage these parameters belong to.
    pub stage: StageId,
    /// Model (or backbone) file.
    pub model: Option<PathBuf>,
    /// Decision threshold, for thresholding stages.
    pub threshold: Option<f64>,
    /// Items per model call.
    pub batch_size: usize,
    /// Diagnostic samples kept per class.
    pub samples_per_class: usize,
    /// Requested link strategy.
    pub link_strategy: LinkStrategy,
    /// Model input edge length.
    pub image_size: Option<u32>,
    /// Tiling parameters, for the tiling stage only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tiling: Option<TilingParams>,
    /// Detector parameters, for the cell stage in detector mode only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection: Option<DetectionParams>,
}

impl StageConfig {
    /// Returns the threshold, or the stage default when none applies.
    #[must_use]
    pub fn threshold_or_default(&self) -> f64 {
        self.threshold
            .or(StageDefaults::for_stage(self.stage).threshold)
            .unwrap_or(0.5)
    }
}

/// Merges defaults, file config and overrides into stage configs.
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    base: PipelineConfig,
    overrides: RunOverrides,
}

impl ConfigResolver {
    /// Creates a resolver over a base config and per-run overrides.
    #[must_use]
    pub fn new(base: PipelineConfig, overrides: RunOverrides) -> Self {
        Self { base, overrides }
    }

    /// The file layer.
    #[must_use]
    pub fn base(&self) -> &PipelineConfig {
        &self.base
    }

    /// The override layer.
    #[must_use]
    pub fn overrides(&self) -> &RunOverrides {
        &self.overrides
    }

    /// Merged settings for a stage (file overlaid by overrides).
    #[must_use]
    pub fn merged_settings(&self, stage: StageId) -> StageSettings {
        self.base
            .stage_settings(stage)
            .overlay(&self.overrides.stage_settings(stage))
    }

    /// Whether the cell classification stage is enabled (default: yes).
    #[must_use]
    pub fn cells_enabled(&self) -> bool {
        self.cell_settings().enabled.unwrap_or(true)
    }

    fn cell_settings(&self) -> CellSettings {
        self.base.cells.overlay(&self.overrides.cells)
    }

    /// Classifier or detector mode of the cell stage (default: classifier).
    #[must_use]
    pub fn cell_mode(&self) -> CellMode {
        self.cell_settings().mode.unwrap_or_default()
    }

    /// Detector parameters, when the cell stage runs a detector.
    pub fn detection(&self) -> Result<Option<DetectionParams>, ConfigError> {
        let cells = self.cell_settings();
        if cells.mode.unwrap_or_default() != CellMode::Detector {
            return Ok(None);
        }
        let stage = StageId::Cells.key();
        let iou = cells.iou.unwrap_or(0.45);
        if !(0.0..=1.0).contains(&iou) {
            return Err(ConfigError::invalid("cells.iou", iou, "a number in [0, 1]").in_stage(stage));
        }
        let image_size = cells.detector_size.unwrap_or(640);
        if image_size == 0 {
            return Err(ConfigError::invalid("cells.detector_size", 0, "a positive integer").in_stage(stage));
        }
        Ok(Some(DetectionParams {
            iou,
            image_size,
            classes: cells.classes,
            by_class_links: cells.by_class_links.unwrap_or(false),
        }))
    }

    /// Upstream source for the cell classification stage (default: apt).
    #[must_use]
    pub fn cell_source(&self) -> CellSource {
        self.cell_settings().source.unwrap_or_default()
    }

    /// Cross-device mount prefixes for the artifact router.
    #[must_use]
    pub fn cross_device_prefixes(&self) -> &[PathBuf] {
        &self.base.router.cross_device_prefixes
    }

    /// Resolves tiling parameters.
    pub fn tiling(&self) -> Result<TilingParams, ConfigError> {
        let ext = &self.base.extraction;
        let stage = StageId::Tiles.key();
        if ext.size == 0 {
            return Err(ConfigError::invalid("extraction.size", ext.size, "a positive integer").in_stage(stage));
        }
        let stride = ext.stride.unwrap_or(ext.size);
        if stride == 0 {
            return Err(ConfigError::invalid("extraction.stride", stride, "a positive integer").in_stage(stage));
        }
        if ext.chunk_size == 0 {
            return Err(
                ConfigError::invalid("extraction.chunk_size", ext.chunk_size, "a positive integer")
                    .in_stage(stage),
            );
        }
        let workers = match ext.workers {
            Some(0) => {
                return Err(ConfigError::invalid("extraction.workers", 0, "a positive integer").in_stage(stage))
            }
            Some(n) => n,
            None => num_cpus::get().max(1),
        };
        Ok(TilingParams {
            size: ext.size,
            stride,
            format: ext.format,
            jpeg_quality: ext.jpeg_quality.clamp(1, 100),
            png_compress_level: ext.png_compress_level.min(9),
            chunk_size: ext.chunk_size,
            workers,
            slide_extensions: ext.slide_extensions.clone(),
            max_slides: ext.max_slides,
        })
    }

    /// Resolves the parameters of one stage.
    ///
    /// Precedence is override > file > built-in default for every field;
    /// the threshold additionally consults the threshold file between the
    /// explicit value and the default.
    pub fn resolve(&self, stage: StageId) -> Result<StageConfig, ConfigError> {
        let defaults = StageDefaults::for_stage(stage);

        if stage == StageId::Tiles {
            let tiling = self.tiling()?;
            return Ok(StageConfig {
                stage,
                model: None,
                threshold: None,
                batch_size: tiling.chunk_size,
                samples_per_class: 0,
                link_strategy: LinkStrategy::None,
                image_size: None,
                tiling: Some(tiling),
                detection: None,
            });
        }

        let merged = self.merged_settings(stage);

        if defaults.requires_model && merged.model.is_none() {
            return Err(ConfigError::missing(stage.key(), "model"));
        }

        let batch_size = merged.batch_size.unwrap_or(defaults.batch_size);
        if batch_size == 0 {
            return Err(ConfigError::invalid("batch_size", batch_size, "a positive integer").in_stage(stage.key()));
        }

        let threshold = defaults.threshold.map(|default| {
            resolve_threshold(merged.threshold, merged.threshold_path.as_deref(), default)
        });

        let detection = if stage == StageId::Cells {
            self.detection()?
        } else {
            None
        };

        let config = StageConfig {
            stage,
            model: merged.model,
            threshold,
            batch_size,
            samples_per_class: merged.samples_per_class.unwrap_or(defaults.samples_per_class),
            link_strategy: merged.link_strategy.unwrap_or(defaults.link_strategy),
            image_size: merged.image_size,
            tiling: None,
            detection,
        };
        debug!(stage = %stage, ?config, "resolved stage config");
        Ok(config)
    }
}
