use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use ndarray::s;

use crate::errors::{OrthoSegError, Result};
use crate::georef::{GeoTransform, Sidecar};
use crate::manifest::{TileIndex, TileRecord};
use crate::naming::{sidecar_path, TileNameKey};
use crate::raster::{write_geotiff, SourceRaster};

/// A rectangular window of the source raster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileWindow {
    /// 1-based grid row.
    pub row: u32,
    /// 1-based grid column.
    pub col: u32,
    pub row_off: usize,
    pub col_off: usize,
    pub width: usize,
    pub height: usize,
}

impl TileWindow {
    pub fn row_end(&self) -> usize {
        self.row_off + self.height
    }

    pub fn col_end(&self) -> usize {
        self.col_off + self.width
    }

    pub fn geotransform(&self, source: &GeoTransform) -> GeoTransform {
        source.offset(self.col_off, self.row_off)
    }
}

/// Overlapping tile layout over a `width` x `height` raster.
///
/// Tiles advance by `tile_size - overlap` along each axis. The last tile on an axis is
/// clipped to the raster edge rather than padded, and every axis gets at least one tile.
#[derive(Debug, Clone)]
pub struct TileGrid {
    raster_width: usize,
    raster_height: usize,
    pub tile_size: usize,
    pub overlap: usize,
    pub tiles_x: usize,
    pub tiles_y: usize,
}

impl TileGrid {
    pub fn new(
        raster_width: usize,
        raster_height: usize,
        tile_size: usize,
        overlap: usize,
    ) -> Result<Self> {
        if tile_size == 0 {
            return Err(OrthoSegError::Validation {
                field: "tile size".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if overlap >= tile_size {
            return Err(OrthoSegError::Validation {
                field: "overlap".to_string(),
                reason: format!("{overlap} must be smaller than the tile size {tile_size}"),
            });
        }
        if raster_width == 0 || raster_height == 0 {
            return Err(OrthoSegError::Validation {
                field: "raster dimensions".to_string(),
                reason: format!("{raster_width}x{raster_height} is empty"),
            });
        }

        let stride = tile_size - overlap;
        let count = |len: usize| len.saturating_sub(overlap).div_ceil(stride).max(1);
        let tiles_x = count(raster_width);
        let tiles_y = count(raster_height);

        debug!(
            "TileGrid: {}x{} raster, tile_size={}, overlap={} -> {}x{} tiles",
            raster_width, raster_height, tile_size, overlap, tiles_x, tiles_y
        );

        Ok(Self {
            raster_width,
            raster_height,
            tile_size,
            overlap,
            tiles_x,
            tiles_y,
        })
    }

    /// Grid with the default overlap of half a tile.
    pub fn with_half_overlap(raster_width: usize, raster_height: usize, tile_size: usize) -> Result<Self> {
        Self::new(raster_width, raster_height, tile_size, tile_size / 2)
    }

    pub fn stride(&self) -> usize {
        self.tile_size - self.overlap
    }

    pub fn len(&self) -> usize {
        self.tiles_x * self.tiles_y
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn window(&self, index: usize) -> TileWindow {
        let gy = index / self.tiles_x;
        let gx = index % self.tiles_x;
        let col_off = gx * self.stride();
        let row_off = gy * self.stride();
        TileWindow {
            row: gy as u32 + 1,
            col: gx as u32 + 1,
            row_off,
            col_off,
            width: (col_off + self.tile_size).min(self.raster_width) - col_off,
            height: (row_off + self.tile_size).min(self.raster_height) - row_off,
        }
    }

    /// Windows in row-major order.
    pub fn iter(&self) -> impl Iterator<Item = TileWindow> + '_ {
        (0..self.len()).map(|i| self.window(i))
    }
}

/// Creates `dir`, treating "already exists" as success.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(e) => Err(OrthoSegError::filesystem(dir, "create directory", e)),
    }
}

/// Cuts `source` into the tiles of `grid`, writing `{key}.tif` plus a
/// `{key}.tif.aux.xml` sidecar per tile and a `tiles.json` index.
///
/// Any write failure aborts: later stages treat this directory as ground truth.
pub fn split_raster(
    source: &SourceRaster,
    source_path: &Path,
    tiles_dir: &Path,
    grid: &TileGrid,
) -> Result<TileIndex> {
    ensure_dir(tiles_dir)?;
    if fs::read_dir(tiles_dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
    {
        info!("Tile directory {} is not empty; existing files may be overwritten", tiles_dir.display());
    }

    let prefix = source_path
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("tile");

    info!(
        "Splitting {}x{} raster into {} tiles of {} px ({} px overlap)",
        source.width(),
        source.height(),
        grid.len(),
        grid.tile_size,
        grid.overlap
    );

    let pb = ProgressBar::new(grid.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tiles ({eta})",
        )
        .map_err(|e| OrthoSegError::config(e.to_string()))?
        .progress_chars("#>-"),
    );

    let mut tiles = Vec::with_capacity(grid.len());
    for window in grid.iter() {
        let key = TileNameKey::new(prefix, window.row, window.col);
        let geotransform = window.geotransform(&source.geotransform);
        let pixels = source.data.slice(s![
            window.row_off..window.row_end(),
            window.col_off..window.col_end(),
            ..
        ]);

        let path = tiles_dir.join(key.tile_file_name("tif"));
        let georef = Sidecar::new(geotransform, source.crs.clone());
        write_geotiff(&path, pixels, &georef)?;
        georef.write(&sidecar_path(&path))?;

        tiles.push(TileRecord {
            key,
            row_off: window.row_off,
            col_off: window.col_off,
            width: window.width,
            height: window.height,
            geotransform,
        });
        pb.inc(1);
    }
    pb.finish_and_clear();

    let index = TileIndex {
        source: source_path.to_path_buf(),
        width: source.width(),
        height: source.height(),
        bands: source.bands(),
        geotransform: source.geotransform,
        crs: source.crs.clone(),
        tile_size: grid.tile_size,
        overlap: grid.overlap,
        tiles,
    };
    let index_path = index.save(tiles_dir)?;
    info!("Wrote {} tiles and {}", index.tiles.len(), index_path.display());
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tempfile::TempDir;

    fn covers_every_pixel(grid: &TileGrid, width: usize, height: usize) -> bool {
        let mut covered = vec![false; width * height];
        for w in grid.iter() {
            for r in w.row_off..w.row_end() {
                for c in w.col_off..w.col_end() {
                    covered[r * width + c] = true;
                }
            }
        }
        covered.into_iter().all(|c| c)
    }

    #[test]
    fn test_reference_grid_is_three_by_three() -> Result<()> {
        let grid = TileGrid::with_half_overlap(1536, 1536, 768)?;
        assert_eq!((grid.tiles_x, grid.tiles_y), (3, 3));
        let last = grid.window(8);
        assert_eq!((last.row_off, last.col_off), (768, 768));
        assert_eq!((last.width, last.height), (768, 768));
        Ok(())
    }

    #[test]
    fn test_edge_tiles_are_clipped() -> Result<()> {
        let grid = TileGrid::with_half_overlap(1000, 700, 768)?;
        assert_eq!((grid.tiles_x, grid.tiles_y), (2, 1));
        let right = grid.window(1);
        assert_eq!(right.col_off, 384);
        assert_eq!(right.width, 616);
        assert_eq!(right.height, 700);
        assert_eq!(grid.window(0).col_end() - right.col_off, 384);

        let grid = TileGrid::new(1000, 1000, 300, 100)?;
        assert_eq!((grid.tiles_x, grid.tiles_y), (5, 5));
        let corner = grid.window(grid.len() - 1);
        let above = grid.window(grid.len() - 1 - grid.tiles_x);
        assert_eq!((corner.row_off, corner.col_off), (800, 800));
        assert_eq!((corner.width, corner.height), (200, 200));
        assert_eq!(above.row_end() - corner.row_off, 100);
        Ok(())
    }

    #[test]
    fn test_small_raster_yields_one_tile() -> Result<()> {
        let grid = TileGrid::with_half_overlap(100, 50, 768)?;
        assert_eq!(grid.len(), 1);
        let only = grid.window(0);
        assert_eq!((only.width, only.height), (100, 50));
        Ok(())
    }

    #[test]
    fn test_coverage_and_stride_over_many_shapes() -> Result<()> {
        for (width, height) in [(1, 1), (17, 3), (255, 256), (257, 511), (700, 1300)] {
            for (size, overlap) in [(64, 32), (100, 0), (128, 96), (256, 128)] {
                let grid = TileGrid::new(width, height, size, overlap)?;
                assert!(covers_every_pixel(&grid, width, height), "{width}x{height} {size}/{overlap}");

                let windows: Vec<_> = grid.iter().collect();
                for pair in windows.windows(2) {
                    if pair[0].row == pair[1].row {
                        assert_eq!(pair[1].col_off - pair[0].col_off, size - overlap);
                        // Holds for the clipped last column too.
                        assert_eq!(pair[0].col_end() - pair[1].col_off, overlap);
                    }
                }
                for (above, below) in windows.iter().zip(&windows[grid.tiles_x..]) {
                    assert_eq!(below.col, above.col);
                    assert_eq!(below.row, above.row + 1);
                    assert_eq!(below.row_off - above.row_off, size - overlap);
                    assert_eq!(above.row_end() - below.row_off, overlap);
                }
                assert!(windows.iter().all(|w| w.col_end() <= width && w.row_end() <= height));
            }
        }
        Ok(())
    }

    #[test]
    fn test_invalid_overlap_rejected() {
        assert!(TileGrid::new(100, 100, 64, 64).is_err());
        assert!(TileGrid::new(100, 100, 0, 0).is_err());
    }

    #[test]
    fn test_tile_geotransform_matches_source() -> Result<()> {
        let source_gt = GeoTransform([600_000.0, 0.1, 0.0, 5_000_000.0, 0.0, -0.1]);
        let grid = TileGrid::with_half_overlap(900, 900, 256)?;
        for w in grid.iter() {
            let tile_gt = w.geotransform(&source_gt);
            let (x, y) = tile_gt.apply(0.0, 0.0);
            let (ex, ey) = source_gt.apply(w.col_off as f64, w.row_off as f64);
            assert!((x - ex).abs() < 1e-6 && (y - ey).abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn test_split_raster_writes_tiles_and_index() -> Result<()> {
        let dir = TempDir::new()?;
        let tiles_dir = dir.path().join("tiles");
        let data = Array3::from_shape_fn((40, 50, 3), |(r, c, _)| ((r + c) % 256) as u8);
        let source = SourceRaster::new(data, GeoTransform([10.0, 1.0, 0.0, 90.0, 0.0, -1.0]), None);
        let grid = TileGrid::with_half_overlap(50, 40, 32)?;

        let index = split_raster(&source, &dir.path().join("site.tif"), &tiles_dir, &grid)?;
        assert_eq!(index.tiles.len(), grid.len());
        assert_eq!(TileIndex::load(&tiles_dir)?, Some(index.clone()));

        let first = &index.tiles[0];
        let tile_path = tiles_dir.join(first.key.tile_file_name("tif"));
        assert!(tile_path.is_file());
        assert!(sidecar_path(&tile_path).is_file());

        let reread = SourceRaster::open(&tiles_dir.join(index.tiles[3].key.tile_file_name("tif")))?;
        let t = &index.tiles[3];
        assert_eq!(reread.geotransform, t.geotransform);
        assert_eq!(reread.data[[0, 0, 0]], ((t.row_off + t.col_off) % 256) as u8);

        // Re-splitting into the same directory is not an error.
        split_raster(&source, &dir.path().join("site.tif"), &tiles_dir, &grid)?;
        Ok(())
    }
}
