//! Tile extraction worker pool.
//!
//! Coordinates are split into fixed-size chunks and queued on one
//! `crossbeam_channel`. A dedicated rayon pool runs one loop per worker; each
//! loop pulls chunks until the queue drains. The first chunk a loop receives
//! opens the slide into its own [`WorkerContext`], which is reused for every
//! later chunk. Loops that never receive a chunk never open the slide.

use super::grid::TileCoordinate;
use super::manifest::TileRecord;
use super::source::{SlideOpener, SlideSource};
use super::TilerError;
use crate::cancellation::CancellationToken;
use crate::config::TileFormat;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use crossbeam_channel::Receiver;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::fs::File;
use std::io::BufWriter;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// How tiles are named and encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileEncoding {
    /// Output format.
    pub format: TileFormat,
    /// JPEG quality (1-100).
    pub jpeg_quality: u8,
    /// PNG compression level (0-9).
    pub png_compress_level: u8,
}

impl TileEncoding {
    fn png_compression(&self) -> CompressionType {
        match self.png_compress_level {
            0 | 1 => CompressionType::Fast,
            7.. => CompressionType::Best,
            _ => CompressionType::Default,
        }
    }

    /// Encodes `tile` to `path`.
    pub fn write(&self, tile: &RgbImage, path: &Path) -> anyhow::Result<()> {
        let writer = BufWriter::new(File::create(path)?);
        let (w, h) = tile.dimensions();
        match self.format {
            TileFormat::Jpg => {
                JpegEncoder::new_with_quality(writer, self.jpeg_quality).write_image(
                    tile.as_raw(),
                    w,
                    h,
                    ExtendedColorType::Rgb8,
                )?;
            }
            TileFormat::Png => {
                PngEncoder::new_with_quality(writer, self.png_compression(), FilterType::Adaptive)
                    .write_image(tile.as_raw(), w, h, ExtendedColorType::Rgb8)?;
            }
        }
        Ok(())
    }
}

/// Everything a worker needs for one slide: created on the worker's first
/// chunk and owned by that worker alone.
pub struct WorkerContext {
    slide: Box<dyn SlideSource>,
    slide_name: String,
    out_dir: PathBuf,
    size: u32,
    encoding: TileEncoding,
}

impl WorkerContext {
    /// Opens the slide for this worker.
    pub fn open(job: &TileJob<'_>) -> Result<Self, TilerError> {
        let slide = job.opener.open(job.slide_path).map_err(|e| TilerError::Open {
            path: job.slide_path.to_path_buf(),
            detail: format!("{e:#}"),
        })?;
        Ok(Self {
            slide,
            slide_name: job.slide_name.to_string(),
            out_dir: job.out_dir.to_path_buf(),
            size: job.size,
            encoding: job.encoding.clone(),
        })
    }

    /// Output file name of a tile.
    #[must_use]
    pub fn tile_name(&self, coord: TileCoordinate) -> String {
        format!(
            "{}_x{}_y{}.{}",
            self.slide_name,
            coord.x,
            coord.y,
            self.encoding.format.extension()
        )
    }

    fn extract_one(&mut self, coord: TileCoordinate) -> anyhow::Result<TileRecord> {
        let tile = self.slide.read_region(coord.x, coord.y, self.size)?;
        let file = self.tile_name(coord);
        self.encoding.write(&tile, &self.out_dir.join(&file))?;
        Ok(TileRecord {
            x: coord.x,
            y: coord.y,
            file,
        })
    }

    /// Extracts a chunk; tiles that fail are omitted and counted.
    pub fn extract_chunk(&mut self, coords: &[TileCoordinate], out: &mut ChunkOutcome) {
        for &coord in coords {
            match self.extract_one(coord) {
                Ok(record) => out.tiles.push(record),
                Err(e) => {
                    debug!(slide = %self.slide_name, x = coord.x, y = coord.y, error = %e, "tile dropped");
                    out.failed += 1;
                }
            }
        }
    }
}

/// Parameters shared by every worker tiling one slide.
#[derive(Debug, Clone)]
pub struct TileJob<'a> {
    /// Slide backend.
    pub opener: &'a dyn SlideOpener,
    /// Slide file.
    pub slide_path: &'a Path,
    /// Slide name used in tile file names.
    pub slide_name: &'a str,
    /// Directory receiving the tiles.
    pub out_dir: &'a Path,
    /// Tile edge length.
    pub size: u32,
    /// Encoding.
    pub encoding: TileEncoding,
}

/// Tiles produced (and lost) by one or more workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOutcome {
    /// Written tiles, in completion order.
    pub tiles: Vec<TileRecord>,
    /// Tiles dropped on error.
    pub failed: usize,
}

impl ChunkOutcome {
    fn merge(&mut self, other: Self) {
        self.tiles.extend(other.tiles);
        self.failed += other.failed;
    }
}

fn worker_loop(
    worker: usize,
    job: &TileJob<'_>,
    queue: &Receiver<Vec<TileCoordinate>>,
    cancel: &CancellationToken,
) -> Result<ChunkOutcome, TilerError> {
    let mut context: Option<WorkerContext> = None;
    let mut outcome = ChunkOutcome::default();
    while !cancel.is_cancelled() {
        let Ok(chunk) = queue.try_recv() else { break };
        if context.is_none() {
            debug!(worker, slide = %job.slide_name, "worker opening slide");
            context = Some(WorkerContext::open(job)?);
        }
        if let Some(ctx) = context.as_mut() {
            ctx.extract_chunk(&chunk, &mut outcome);
        }
    }
    Ok(outcome)
}

/// Extracts `coords` with up to `workers` threads, `chunk_size`
/// coordinates per task.
///
/// The returned tiles are in completion order. A worker that cannot open
/// the slide or panics fails the whole call; individual tile failures do
/// not.
pub fn extract_parallel(
    job: &TileJob<'_>,
    coords: &[TileCoordinate],
    workers: usize,
    chunk_size: usize,
    cancel: &CancellationToken,
) -> Result<ChunkOutcome, TilerError> {
    if coords.is_empty() {
        return Ok(ChunkOutcome::default());
    }

    let chunks: Vec<Vec<TileCoordinate>> = coords
        .chunks(chunk_size.max(1))
        .map(<[TileCoordinate]>::to_vec)
        .collect();
    let workers = workers.clamp(1, chunks.len());
    let (tx, queue) = crossbeam_channel::unbounded();
    for chunk in chunks {
        tx.send(chunk).map_err(|_| TilerError::QueueClosed)?;
    }
    drop(tx);

    let pool = ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("tile-worker-{i}"))
        .build()?;
    let results: Vec<Result<ChunkOutcome, TilerError>> = pool.install(|| {
        (0..workers)
            .into_par_iter()
            .map(|worker| {
                panic::catch_unwind(AssertUnwindSafe(|| worker_loop(worker, job, &queue, cancel)))
                    .unwrap_or_else(|_| Err(TilerError::WorkerPanicked(worker)))
            })
            .collect()
    });

    let mut merged = ChunkOutcome::default();
    for result in results {
        merged.merge(result?);
    }
    if let Err(reason) = cancel.check() {
        warn!(slide = %job.slide_name, "tiling interrupted");
        return Err(TilerError::Cancelled(reason));
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingOpener, SyntheticSlideOpener};
    use crate::tiler::tile_grid;

    fn encoding(format: TileFormat) -> TileEncoding {
        TileEncoding {
            format,
            jpeg_quality: 90,
            png_compress_level: 1,
        }
    }

    #[test]
    fn test_png_level_mapping() {
        let mut enc = encoding(TileFormat::Png);
        assert!(matches!(enc.png_compression(), CompressionType::Fast));
        enc.png_compress_level = 5;
        assert!(matches!(enc.png_compression(), CompressionType::Default));
        enc.png_compress_level = 9;
        assert!(matches!(enc.png_compression(), CompressionType::Best));
    }

    #[test]
    fn test_parallel_extraction_writes_every_tile() {
        let dir = tempfile::tempdir().unwrap();
        let opener = CountingOpener::new(SyntheticSlideOpener::new(64, 48));
        let coords = tile_grid(64, 48, 16, 16);
        let job = TileJob {
            opener: &opener,
            slide_path: Path::new("synthetic.svs"),
            slide_name: "synthetic",
            out_dir: dir.path(),
            size: 16,
            encoding: encoding(TileFormat::Png),
        };

        let outcome = extract_parallel(&job, &coords, 3, 2, &CancellationToken::new()).unwrap();

        assert_eq!(outcome.tiles.len(), 12);
        assert_eq!(outcome.failed, 0);
        assert!(dir.path().join("synthetic_x48_y32.png").is_file());
        assert!(opener.opens() <= 3);
    }

    #[test]
    fn test_failing_tiles_are_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let opener = SyntheticSlideOpener::new(64, 32).with_bad_region(16, 0);
        let coords = tile_grid(64, 32, 16, 16);
        let job = TileJob {
            opener: &opener,
            slide_path: Path::new("s.svs"),
            slide_name: "s",
            out_dir: dir.path(),
            size: 16,
            encoding: encoding(TileFormat::Jpg),
        };

        let outcome = extract_parallel(&job, &coords, 2, 3, &CancellationToken::new()).unwrap();

        assert_eq!(outcome.tiles.len(), coords.len() - 1);
        assert_eq!(outcome.failed, 1);
        assert!(!dir.path().join("s_x16_y0.jpg").exists());
    }

    #[test]
    fn test_unopenable_slide_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let opener = SyntheticSlideOpener::new(32, 32).failing_open();
        let job = TileJob {
            opener: &opener,
            slide_path: Path::new("broken.svs"),
            slide_name: "broken",
            out_dir: dir.path(),
            size: 16,
            encoding: encoding(TileFormat::Jpg),
        };

        let err = extract_parallel(&job, &tile_grid(32, 32, 16, 16), 2, 1, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TilerError::Open { .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let opener = CountingOpener::new(SyntheticSlideOpener::new(32, 32));
        let job = TileJob {
            opener: &opener,
            slide_path: Path::new("s.svs"),
            slide_name: "s",
            out_dir: dir.path(),
            size: 16,
            encoding: encoding(TileFormat::Jpg),
        };
        let cancel = CancellationToken::new();
        cancel.cancel("stop");

        let err = extract_parallel(&job, &tile_grid(32, 32, 16, 16), 2, 1, &cancel).unwrap_err();
        assert!(matches!(err, TilerError::Cancelled(reason) if reason == "stop"));
        assert_eq!(opener.opens(), 0);
    }

    #[test]
    fn test_worker_panic_becomes_error() {
        let dir = tempfile::tempdir().unwrap();
        let opener = SyntheticSlideOpener::new(32, 32).with_panicking_region(16, 16);
        let job = TileJob {
            opener: &opener,
            slide_path: Path::new("s.svs"),
            slide_name: "s",
            out_dir: dir.path(),
            size: 16,
            encoding: encoding(TileFormat::Png),
        };

        let err = extract_parallel(&job, &tile_grid(32, 32, 16, 16), 2, 1, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, TilerError::WorkerPanicked(_)));
    }
}
