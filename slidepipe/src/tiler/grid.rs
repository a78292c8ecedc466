//! Tile coordinate generation.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Top-left pixel offset of a square tile inside a slide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileCoordinate {
    /// Column offset.
    pub x: u32,
    /// Row offset.
    pub y: u32,
}

impl TileCoordinate {
    /// Creates a coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Row-major: ordered by `y`, then `x`.
impl Ord for TileCoordinate {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.y, self.x).cmp(&(other.y, other.x))
    }
}

impl PartialOrd for TileCoordinate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Origins along one axis of length `extent`.
///
/// Candidates are `i * stride` for `i` in `0..max(1, ceil((extent - size) / stride) + 1)`;
/// a candidate is kept only if the full tile fits, so ragged edge strips
/// are dropped and an axis shorter than `size` yields nothing.
fn axis_origins(extent: u32, size: u32, stride: u32) -> Vec<u32> {
    if size == 0 || stride == 0 || extent < size {
        return Vec::new();
    }
    let (extent, size, stride) = (u64::from(extent), u64::from(size), u64::from(stride));
    let steps = (extent - size).div_ceil(stride) + 1;
    (0..steps)
        .map(|i| i * stride)
        .filter(|origin| origin + size <= extent)
        .filter_map(|origin| u32::try_from(origin).ok())
        .collect()
}

/// Every full tile of a `width` x `height` slide, in `(y, x)` order.
///
/// Every returned coordinate satisfies `x + size <= width` and
/// `y + size <= height`, and no coordinate appears twice.
#[must_use]
pub fn tile_grid(width: u32, height: u32, size: u32, stride: u32) -> Vec<TileCoordinate> {
    let xs = axis_origins(width, size, stride);
    let ys = axis_origins(height, size, stride);
    ys.iter()
        .flat_map(|&y| xs.iter().map(move |&x| TileCoordinate::new(x, y)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashSet;

    #[test]
    fn test_single_tile_for_2000_by_1500() {
        assert_eq!(tile_grid(2000, 1500, 1024, 1024), vec![TileCoordinate::new(0, 0)]);
    }

    #[test]
    fn test_exact_fit() {
        let grid = tile_grid(2048, 1024, 1024, 1024);
        assert_eq!(grid, vec![TileCoordinate::new(0, 0), TileCoordinate::new(1024, 0)]);
    }

    #[test]
    fn test_overlapping_stride() {
        let grid = tile_grid(300, 200, 100, 50);
        let xs: Vec<u32> = grid.iter().filter(|c| c.y == 0).map(|c| c.x).collect();
        assert_eq!(xs, vec![0, 50, 100, 150, 200]);
        assert_eq!(grid.len(), 5 * 3);
    }

    #[test]
    fn test_slide_smaller_than_tile() {
        assert!(tile_grid(500, 2000, 1024, 1024).is_empty());
        assert!(tile_grid(0, 0, 16, 16).is_empty());
    }

    #[test]
    fn test_grid_invariant_over_many_shapes() {
        for w in [1_u32, 15, 16, 17, 63, 64, 100, 257] {
            for h in [1_u32, 16, 33, 90] {
                for size in [1_u32, 7, 16, 32] {
                    for stride in [1_u32, 5, 16, 40] {
                        let grid = tile_grid(w, h, size, stride);
                        let unique: HashSet<_> = grid.iter().collect();
                        assert_eq!(unique.len(), grid.len());
                        for c in &grid {
                            assert!(c.x + size <= w && c.y + size <= h, "{c:?} {w}x{h} {size}/{stride}");
                        }
                        let mut sorted = grid.clone();
                        sorted.sort();
                        assert_eq!(sorted, grid);
                    }
                }
            }
        }
    }

    #[test]
    fn test_coordinate_order_is_row_major() {
        let mut coords = vec![
            TileCoordinate::new(5, 1),
            TileCoordinate::new(0, 2),
            TileCoordinate::new(9, 0),
            TileCoordinate::new(0, 1),
        ];
        coords.sort();
        assert_eq!(
            coords,
            vec![
                TileCoordinate::new(9, 0),
                TileCoordinate::new(0, 1),
                TileCoordinate::new(5, 1),
                TileCoordinate::new(0, 2),
            ]
        );
    }
}
