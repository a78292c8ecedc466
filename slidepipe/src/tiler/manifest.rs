//! The tiling manifest (`01_tiles/tiles_meta.json`).

use super::TilerError;
use crate::config::{TileFormat, TilingParams};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// One extracted tile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileRecord {
    /// Column offset.
    pub x: u32,
    /// Row offset.
    pub y: u32,
    /// File name inside the slide's tile directory.
    pub file: String,
}

/// Slide dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width.
    pub w: u32,
    /// Height.
    pub h: u32,
}

/// Result of tiling one slide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSetSummary {
    /// Slide name (file stem).
    pub slide: String,
    /// Source slide path.
    pub svs_path: String,
    /// Level-0 dimensions.
    pub dimensions: Dimensions,
    /// Tile edge length.
    pub tile_size: u32,
    /// Step between tile origins.
    pub stride: u32,
    /// Tile encoding.
    pub format: TileFormat,
    /// Number of tiles written.
    pub tiles_total: usize,
    /// Tiles lost to extraction errors.
    #[serde(default)]
    pub tiles_failed: usize,
    /// Written tiles in `(y, x)` order.
    pub tiles: Vec<TileRecord>,
}

/// Echo of the tiling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestParams {
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
    /// Worker threads.
    pub workers: usize,
    /// Coordinates per worker task.
    pub chunk_size: usize,
}

impl From<&TilingParams> for ManifestParams {
    fn from(p: &TilingParams) -> Self {
        Self {
            size: p.size,
            stride: p.stride,
            format: p.format,
            jpeg_quality: p.jpeg_quality,
            png_compress_level: p.png_compress_level,
            workers: p.workers,
            chunk_size: p.chunk_size,
        }
    }
}

/// Manifest covering every slide of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileManifest {
    /// Run timestamp (`%Y-%m-%d_%H-%M-%S`).
    pub run_ts: String,
    /// Tiling parameters.
    pub params: ManifestParams,
    /// Per-slide results, in slide name order.
    pub slides: Vec<TileSetSummary>,
}

impl TileManifest {
    /// Tiles written across all slides.
    #[must_use]
    pub fn tiles_total(&self) -> usize {
        self.slides.iter().map(|s| s.tiles_total).sum()
    }

    /// Tiles lost across all slides.
    #[must_use]
    pub fn tiles_failed(&self) -> usize {
        self.slides.iter().map(|s| s.tiles_failed).sum()
    }

    /// Writes the manifest as pretty JSON.
    pub fn write(&self, path: &Path) -> Result<(), TilerError> {
        let body = serde_json::to_string_pretty(self)?;
        fs::write(path, body).map_err(|source| TilerError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Reads a manifest.
    pub fn read(path: &Path) -> Result<Self, TilerError> {
        let body = fs::read_to_string(path).map_err(|source| TilerError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&body)?)
    }
}
