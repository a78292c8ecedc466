//! On-disk fixtures for stage and pipeline tests.
//!
//! Helpers panic on I/O errors: they only ever run inside tests.

use image::{Rgb, RgbImage};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{
    CellSettings, ConfigResolver, ExtractionConfig, PipelineConfig, RunOverrides, StageConfig,
    StageSettings, TileFormat,
};
use crate::core::{LinkStrategy, StageId};
use crate::session::SessionPaths;

fn create_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap_or_else(|e| panic!("cannot create {}: {e}", parent.display()));
    }
}

/// Writes a `width` x `height` PNG "slide": the left half red, the right half
/// blue. Tiles cut from the left half score high with
/// [`FakeBackend`](super::FakeBackend), tiles from the right half low.
pub fn write_slide_png(path: &Path, width: u32, height: u32) -> PathBuf {
    create_parent(path);
    let image = RgbImage::from_fn(width, height, |x, _| {
        if x < width / 2 {
            Rgb([230, 40, 40])
        } else {
            Rgb([20, 40, 230])
        }
    });
    image
        .save(path)
        .unwrap_or_else(|e| panic!("cannot write slide {}: {e}", path.display()));
    path.to_path_buf()
}

/// Writes a small solid-colour tile.
pub fn write_tile(path: &Path, rgb: [u8; 3]) -> PathBuf {
    create_parent(path);
    RgbImage::from_pixel(8, 8, Rgb(rgb))
        .save(path)
        .unwrap_or_else(|e| panic!("cannot write tile {}: {e}", path.display()));
    path.to_path_buf()
}

/// Writes a raw little-endian `f32` feature file.
pub fn write_feature(path: &Path, values: &[f32]) -> PathBuf {
    create_parent(path);
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes).unwrap_or_else(|e| panic!("cannot write feature {}: {e}", path.display()));
    path.to_path_buf()
}

/// A resolved config for `stage` with placeholder models, copy placement
/// and two samples per class.
pub fn stage_config(stage: StageId) -> StageConfig {
    let settings = StageSettings::new()
        .with_model(format!("/models/{}.bin", stage.key()))
        .with_link(LinkStrategy::Copy)
        .with_samples(2)
        .with_batch_size(4);
    let overrides = RunOverrides {
        background: settings.clone(),
        features: settings.clone(),
        aptitude: settings.clone(),
        cells: CellSettings::default().with_stage(settings),
    };
    ConfigResolver::new(small_tiles_config(), overrides)
        .resolve(stage)
        .unwrap_or_else(|e| panic!("fixture config does not resolve: {e}"))
}

/// A pipeline config with 32 px PNG tiles, two workers and placeholder
/// models for every stage.
pub fn small_tiles_config() -> PipelineConfig {
    let model = |name: &str| StageSettings::new().with_model(format!("/models/{name}.bin"));
    PipelineConfig {
        extraction: ExtractionConfig::default()
            .with_grid(32, 32)
            .with_format(TileFormat::Png)
            .with_workers(2),
        background: model("bg"),
        features: StageSettings::new(),
        aptitude: model("apt"),
        cells: CellSettings::default().with_stage(model("cells")),
        ..PipelineConfig::default()
    }
}

/// A prepared session under a caller-owned root.
#[derive(Debug, Clone)]
pub struct PipelineFixture {
    /// Paths of the session.
    pub session: SessionPaths,
}

impl PipelineFixture {
    /// Creates session `test-session` under `root`, with an input directory.
    pub fn new(root: &Path) -> Self {
        let session = SessionPaths::new(root.join("sessions"), "test-session")
            .unwrap_or_else(|e| panic!("fixture session: {e}"));
        fs::create_dir_all(session.input_dir()).unwrap_or_else(|e| panic!("fixture input dir: {e}"));
        Self { session }
    }

    /// Adds a slide to the session input.
    pub fn add_slide(&self, name: &str, width: u32, height: u32) -> PathBuf {
        write_slide_png(&self.session.input_dir().join(name), width, height)
    }

    /// Reads and parses a JSON file.
    pub fn read_json(&self, path: &Path) -> serde_json::Value {
        let body = fs::read_to_string(path).unwrap_or_else(|e| panic!("cannot read {}: {e}", path.display()));
        serde_json::from_str(&body).unwrap_or_else(|e| panic!("invalid JSON in {}: {e}", path.display()))
    }
}
