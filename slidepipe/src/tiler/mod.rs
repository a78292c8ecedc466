//! Whole-slide tiling.
//!
//! A slide is cut into a regular grid of full-size square tiles
//! ([`tile_grid`]); the tiles are extracted by a pool of worker threads
//! ([`extract_parallel`]) and summarized in a deterministic, `(y, x)`-ordered
//! [`TileSetSummary`]. [`Tiler::tile_all`] does this for every slide of a
//! session and writes the [`TileManifest`].

mod grid;
mod manifest;
mod source;
mod worker;

pub use grid::{tile_grid, TileCoordinate};
pub use manifest::{Dimensions, ManifestParams, TileManifest, TileRecord, TileSetSummary};
pub use source::{ImageSlideOpener, InMemorySlide, SlideOpener, SlideSource};
pub use worker::{extract_parallel, ChunkOutcome, TileEncoding, TileJob, WorkerContext};

use crate::cancellation::CancellationToken;
use crate::config::TilingParams;
use crate::utils::now_ts;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// File name of the manifest inside the tiling output directory.
pub const MANIFEST_FILE: &str = "tiles_meta.json";

/// Errors that fail tiling as a whole.
#[derive(Debug, Error)]
pub enum TilerError {
    /// The slide could not be opened.
    #[error("Cannot open slide '{}': {detail}", .path.display())]
    Open {
        /// Slide path.
        path: PathBuf,
        /// Backend error text.
        detail: String,
    },

    /// A directory or manifest could not be read or written.
    #[error("Tiling I/O error at '{}': {source}", .path.display())]
    Io {
        /// Offending path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked.
    #[error("Tile worker {0} panicked")]
    WorkerPanicked(usize),

    /// The chunk queue closed before every chunk was queued.
    #[error("Tile chunk queue closed")]
    QueueClosed,

    /// The worker pool could not be started.
    #[error("Cannot start tile worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    /// Cancellation was requested while tiling.
    #[error("Tiling cancelled: {0}")]
    Cancelled(String),

    /// The manifest could not be (de)serialized.
    #[error("Manifest serialization error: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Tiles slides with a fixed set of parameters.
#[derive(Debug, Clone)]
pub struct Tiler {
    opener: Arc<dyn SlideOpener>,
    params: TilingParams,
}

impl Tiler {
    /// Creates a tiler over a slide backend.
    #[must_use]
    pub fn new(opener: Arc<dyn SlideOpener>, params: TilingParams) -> Self {
        Self { opener, params }
    }

    /// The tiling parameters.
    #[must_use]
    pub fn params(&self) -> &TilingParams {
        &self.params
    }

    fn encoding(&self) -> TileEncoding {
        TileEncoding {
            format: self.params.format,
            jpeg_quality: self.params.jpeg_quality,
            png_compress_level: self.params.png_compress_level,
        }
    }

    /// Slides in `input_dir` with an accepted extension, sorted by name and
    /// truncated to `max_slides`.
    pub fn list_slides(&self, input_dir: &Path) -> Result<Vec<PathBuf>, TilerError> {
        let entries = fs::read_dir(input_dir).map_err(|source| TilerError::Io {
            path: input_dir.to_path_buf(),
            source,
        })?;
        let mut slides: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && self.is_slide(path))
            .collect();
        slides.sort();
        if let Some(max) = self.params.max_slides {
            slides.truncate(max);
        }
        Ok(slides)
    }

    fn is_slide(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.params
                    .slide_extensions
                    .iter()
                    .any(|accepted| accepted.eq_ignore_ascii_case(ext))
            })
    }

    /// Tiles one slide into `out_root/<slide name>/`.
    ///
    /// The slide is opened once here for its dimensions and once per worker
    /// that receives work.
    pub fn tile_slide(
        &self,
        slide_path: &Path,
        out_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<TileSetSummary, TilerError> {
        let slide_name = slide_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let out_dir = out_root.join(&slide_name);
        fs::create_dir_all(&out_dir).map_err(|source| TilerError::Io {
            path: out_dir.clone(),
            source,
        })?;

        let (w, h) = {
            let slide = self.opener.open(slide_path).map_err(|e| TilerError::Open {
                path: slide_path.to_path_buf(),
                detail: format!("{e:#}"),
            })?;
            slide.dimensions()
        };

        let coords = tile_grid(w, h, self.params.size, self.params.stride);
        let job = TileJob {
            opener: self.opener.as_ref(),
            slide_path,
            slide_name: &slide_name,
            out_dir: &out_dir,
            size: self.params.size,
            encoding: self.encoding(),
        };
        let outcome = extract_parallel(&job, &coords, self.params.workers, self.params.chunk_size, cancel);
        self.opener.release(slide_path);
        let outcome = outcome?;

        let mut tiles = outcome.tiles;
        tiles.sort_by_key(|t| TileCoordinate::new(t.x, t.y));
        if outcome.failed > 0 {
            warn!(slide = %slide_name, failed = outcome.failed, "tiles dropped during extraction");
        }
        info!(slide = %slide_name, w, h, tiles = tiles.len(), candidates = coords.len(), "slide tiled");

        Ok(TileSetSummary {
            slide: slide_name,
            svs_path: slide_path.display().to_string(),
            dimensions: Dimensions { w, h },
            tile_size: self.params.size,
            stride: self.params.stride,
            format: self.params.format,
            tiles_total: tiles.len(),
            tiles_failed: outcome.failed,
            tiles,
        })
    }

    /// Tiles every slide in `input_dir` and writes `out_root/tiles_meta.json`.
    pub fn tile_all(
        &self,
        input_dir: &Path,
        out_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<TileManifest, TilerError> {
        let slides = self.list_slides(input_dir)?;
        if slides.is_empty() {
            warn!(input = %input_dir.display(), "no slides found");
        }

        let mut summaries = Vec::with_capacity(slides.len());
        for slide in &slides {
            if let Err(reason) = cancel.check() {
                return Err(TilerError::Cancelled(reason));
            }
            summaries.push(self.tile_slide(slide, out_root, cancel)?);
        }

        let manifest = TileManifest {
            run_ts: now_ts(),
            params: ManifestParams::from(&self.params),
            slides: summaries,
        };
        fs::create_dir_all(out_root).map_err(|source| TilerError::Io {
            path: out_root.to_path_buf(),
            source,
        })?;
        manifest.write(&out_root.join(MANIFEST_FILE))?;
        Ok(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TileFormat;
    use crate::testing::{fixtures, CountingOpener, SyntheticSlideOpener};
    use pretty_assertions::assert_eq;

    fn params(size: u32, stride: u32, workers: usize, chunk_size: usize) -> TilingParams {
        TilingParams {
            size,
            stride,
            format: TileFormat::Png,
            jpeg_quality: 95,
            png_compress_level: 1,
            chunk_size,
            workers,
            slide_extensions: vec!["svs".to_string(), "png".to_string()],
            max_slides: None,
        }
    }

    #[test]
    fn test_single_tile_slide() {
        let dir = tempfile::tempdir().unwrap();
        let tiler = Tiler::new(
            Arc::new(SyntheticSlideOpener::new(2000, 1500)),
            params(1024, 1024, 4, 64),
        );

        let summary = tiler
            .tile_slide(Path::new("/in/case7.svs"), dir.path(), &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.tiles_total, 1);
        assert_eq!(
            summary.tiles,
            vec![TileRecord {
                x: 0,
                y: 0,
                file: "case7_x0_y0.png".to_string()
            }]
        );
        assert_eq!(summary.dimensions, Dimensions { w: 2000, h: 1500 });
        assert!(dir.path().join("case7").join("case7_x0_y0.png").is_file());
    }

    #[test]
    fn test_order_independent_of_worker_count() {
        let mut reference = None;
        for workers in [1, 2, 5] {
            let dir = tempfile::tempdir().unwrap();
            let tiler = Tiler::new(
                Arc::new(SyntheticSlideOpener::new(96, 80)),
                params(16, 12, workers, 3),
            );
            let summary = tiler
                .tile_slide(Path::new("s.svs"), dir.path(), &CancellationToken::new())
                .unwrap();

            let coords: Vec<_> = summary.tiles.iter().map(|t| TileCoordinate::new(t.x, t.y)).collect();
            let mut sorted = coords.clone();
            sorted.sort();
            assert_eq!(coords, sorted);
            assert_eq!(coords, tile_grid(96, 80, 16, 12));

            match &reference {
                None => reference = Some(summary.tiles),
                Some(r) => assert_eq!(r, &summary.tiles),
            }
        }
    }

    #[test]
    fn test_opens_bounded_by_workers() {
        let dir = tempfile::tempdir().unwrap();
        let opener = Arc::new(CountingOpener::new(SyntheticSlideOpener::new(128, 128)));
        let tiler = Tiler::new(opener.clone(), params(16, 16, 3, 4));

        let summary = tiler
            .tile_slide(Path::new("s.svs"), dir.path(), &CancellationToken::new())
            .unwrap();

        assert_eq!(summary.tiles_total, 64);
        assert!(opener.opens() <= 3 + 1, "opened {} times", opener.opens());
    }

    #[test]
    fn test_tile_all_writes_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("input");
        fixtures::write_slide_png(&input.join("b.png"), 64, 32);
        fixtures::write_slide_png(&input.join("a.png"), 32, 32);
        std::fs::write(input.join("notes.txt"), "x").unwrap();
        let out = dir.path().join("01_tiles");

        let tiler = Tiler::new(Arc::new(ImageSlideOpener::new()), params(32, 32, 2, 1));
        let manifest = tiler.tile_all(&input, &out, &CancellationToken::new()).unwrap();

        let names: Vec<_> = manifest.slides.iter().map(|s| s.slide.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(manifest.tiles_total(), 3);
        assert_eq!(TileManifest::read(&out.join(MANIFEST_FILE)).unwrap(), manifest);
    }

    #[test]
    fn test_max_slides() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["c.svs", "a.SVS", "b.svs"] {
            std::fs::write(dir.path().join(name), "x").unwrap();
        }
        let mut p = params(16, 16, 1, 1);
        p.max_slides = Some(2);
        let tiler = Tiler::new(Arc::new(ImageSlideOpener::new()), p);

        let slides = tiler.list_slides(dir.path()).unwrap();
        assert_eq!(slides, vec![dir.path().join("a.SVS"), dir.path().join("b.svs")]);
    }
}
