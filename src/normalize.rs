use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GrayImage, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info};
use ndarray::s;
use walkdir::WalkDir;

use crate::errors::{OrthoSegError, Result, Stage, TileFailure, TileFailureKind};
use crate::manifest::TileIndex;
use crate::naming::{sidecar_path, TileNameKey};
use crate::raster::SourceRaster;

pub const DEFAULT_JPEG_QUALITY: u8 = 75;

/// Outcome of one normalizer pass.
#[derive(Debug, Default)]
pub struct NormalizeReport {
    pub converted: Vec<PathBuf>,
    pub failures: Vec<TileFailure>,
}

/// Transcodes every `{key}.tif` tile in `tiles_dir` into `{key}.jpg` with a
/// `{key}.jpg.aux.xml` sidecar, removing the lossless copy once the JPEG is in place.
///
/// A tile that fails keeps its `.tif`, so running this again retries exactly the
/// tiles that are left.
pub fn normalize_tiles(tiles_dir: &Path, quality: u8) -> Result<NormalizeReport> {
    let tiles = lossless_tiles(tiles_dir)?;
    info!("Transcoding {} tile(s) to JPEG (quality {})", tiles.len(), quality);

    let pb = ProgressBar::new(tiles.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")
            .map_err(|e| OrthoSegError::config(e.to_string()))?
            .progress_chars("#>-"),
    );

    let mut report = NormalizeReport::default();
    for tile in tiles {
        match transcode_tile(&tile, quality) {
            Ok(jpeg) => report.converted.push(jpeg),
            Err(e) => {
                error!("Failed to transcode {}: {}", tile.display(), e);
                report.failures.push(TileFailure::new(
                    &tile,
                    Stage::Normalize,
                    TileFailureKind::Transcode,
                    e.to_string(),
                ));
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    info!(
        "Transcoded {} tile(s), {} failure(s)",
        report.converted.len(),
        report.failures.len()
    );
    Ok(report)
}

fn lossless_tiles(tiles_dir: &Path) -> Result<Vec<PathBuf>> {
    tiles_with_extension(tiles_dir, &["tif"])
}

/// Tile files in `tiles_dir` with one of `extensions`, sorted by name.
///
/// When `tiles.json` is present only the keys it lists are returned, so tiles left
/// by another input or an earlier grid are not picked up.
fn tiles_with_extension(tiles_dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    if !tiles_dir.is_dir() {
        return Err(OrthoSegError::NoInput(format!(
            "tile directory {} does not exist",
            tiles_dir.display()
        )));
    }
    let index = TileIndex::load(tiles_dir)?;
    let mut tiles: Vec<PathBuf> = WalkDir::new(tiles_dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            let extension = p.extension().and_then(|e| e.to_str()).map(str::to_lowercase);
            if !extension.is_some_and(|e| extensions.contains(&e.as_str())) {
                return false;
            }
            let Some(key) = p.file_stem().and_then(|s| s.to_str()).and_then(TileNameKey::parse) else {
                return false;
            };
            match &index {
                Some(index) if index.find(&key).is_none() => {
                    debug!("{} is not in the tile index; skipping", p.display());
                    false
                }
                _ => true,
            }
        })
        .collect();
    tiles.sort();
    Ok(tiles)
}

/// Pixel grid and geotransform are unchanged; only the encoding differs.
pub fn transcode_tile(tile: &Path, quality: u8) -> Result<PathBuf> {
    let raster = SourceRaster::open(tile)?;
    let (height, width, bands) = raster.data.dim();
    let image = match bands {
        1 => {
            let band = raster.data.slice(s![.., .., 0]).iter().copied().collect();
            GrayImage::from_raw(width as u32, height as u32, band).map(DynamicImage::ImageLuma8)
        }
        _ => {
            // JPEG has no alpha channel; the fourth band is dropped.
            let rgb = raster.data.slice(s![.., .., 0..3]).iter().copied().collect();
            RgbImage::from_raw(width as u32, height as u32, rgb).map(DynamicImage::ImageRgb8)
        }
    }
    .ok_or_else(|| OrthoSegError::raster(tile.display(), "assemble image", "buffer size mismatch"))?;

    let jpeg = tile.with_extension("jpg");
    let partial = tile.with_extension("jpg.part");
    if let Err(e) = write_jpeg(&image, &partial, quality) {
        fs::remove_file(&partial).ok();
        return Err(e);
    }
    fs::rename(&partial, &jpeg).map_err(|e| OrthoSegError::filesystem(&jpeg, "finalise JPEG", e))?;
    raster.georef().write(&sidecar_path(&jpeg))?;

    fs::remove_file(tile).map_err(|e| OrthoSegError::filesystem(tile, "remove lossless tile", e))?;
    let tif_sidecar = sidecar_path(tile);
    if tif_sidecar.exists() {
        fs::remove_file(&tif_sidecar)
            .map_err(|e| OrthoSegError::filesystem(&tif_sidecar, "remove tile sidecar", e))?;
    }
    debug!("{} -> {}", tile.display(), jpeg.display());
    Ok(jpeg)
}

fn write_jpeg(image: &DynamicImage, path: &Path, quality: u8) -> Result<()> {
    let file = File::create(path).map_err(|e| OrthoSegError::filesystem(path, "create JPEG", e))?;
    let mut writer = BufWriter::new(file);
    let encoder = JpegEncoder::new_with_quality(&mut writer, quality);
    image
        .write_with_encoder(encoder)
        .map_err(|e| OrthoSegError::raster(path.display(), "encode JPEG", e))?;
    writer
        .flush()
        .map_err(|e| OrthoSegError::filesystem(path, "flush JPEG", e))
}

/// JPEG tiles ready for the predictor, sorted by name.
pub fn predictor_tiles(tiles_dir: &Path) -> Result<Vec<PathBuf>> {
    tiles_with_extension(tiles_dir, &["jpg", "jpeg", "png"])
}
