//! Ensemble runner: turns tiles into label rasters with one or more models.

use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, ImageBuffer, Luma, Rgb, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, error, info, warn};
use ndarray::prelude::*;
use serde::Serialize;

use crate::errors::{OrthoSegError, Result, Stage, TileFailure, TileFailureKind};
use crate::model_config::{ensure_compatible, ModelConfig};
use crate::naming::{PredictionKind, TileNameKey};
use crate::normalize::predictor_tiles;
use crate::tiling::ensure_dir;
use crate::traits::{SegmentationModel, TilePredictor};

/// Which outputs are written next to the label raster.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputProfile {
    /// Labels, metadata, probability and overlay images.
    Full,
    /// Labels and metadata.
    #[default]
    Meta,
    /// Labels only.
    Minimal,
}

/// Prediction switches, resolved once from the model configuration and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PredictionSettings {
    pub test_time_augmentation: bool,
    pub otsu_threshold: bool,
    pub write_metadata: bool,
    pub profile: OutputProfile,
}

impl PredictionSettings {
    /// Flags come from the first (best) configuration; the profile can only add
    /// metadata, never remove what the configuration asks for.
    pub fn from_config(config: &ModelConfig, profile: OutputProfile) -> Self {
        Self {
            test_time_augmentation: config.test_time_augmentation,
            otsu_threshold: config.otsu_threshold,
            write_metadata: config.write_model_metadata || profile != OutputProfile::Minimal,
            profile,
        }
    }
}

/// Per-tile result of running the ensemble.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Fused class probabilities `(class, row, col)` at tile resolution.
    pub probabilities: Array3<f32>,
    /// Per-member probabilities, kept for byproduct images.
    pub members: Vec<Array3<f32>>,
    pub labels: Array2<u8>,
    pub otsu_level: Option<f32>,
}

#[derive(Debug, Serialize)]
struct PredictionMetadata<'a> {
    tile: String,
    models: Vec<&'a str>,
    nclasses: usize,
    test_time_augmentation: bool,
    otsu_level: Option<f32>,
    class_pixel_counts: Vec<u64>,
}

/// Outcome of running the predictor over a tile directory.
#[derive(Debug, Default)]
pub struct PredictReport {
    pub outputs: Vec<PathBuf>,
    pub predicted: usize,
    pub failures: Vec<TileFailure>,
}

pub struct EnsembleRunner<M: SegmentationModel> {
    models: Vec<M>,
    settings: PredictionSettings,
}

impl<M: SegmentationModel> EnsembleRunner<M> {
    pub fn new(models: Vec<M>, settings: PredictionSettings) -> Result<Self> {
        if models.is_empty() {
            return Err(OrthoSegError::config("at least one model is required"));
        }
        let configs: Vec<ModelConfig> = models.iter().map(|m| m.config().clone()).collect();
        ensure_compatible(&configs)?;
        info!(
            "Ensemble of {} model(s): TESTTIMEAUG={}, OTSU_THRESHOLD={}, metadata={}, profile={:?}",
            models.len(),
            settings.test_time_augmentation,
            settings.otsu_threshold,
            settings.write_metadata,
            settings.profile
        );
        Ok(Self { models, settings })
    }

    pub fn nclasses(&self) -> usize {
        self.models[0].config().nclasses
    }

    pub fn settings(&self) -> &PredictionSettings {
        &self.settings
    }

    /// Member prediction, averaged over flips when test-time augmentation is on.
    fn member_probabilities(&self, model: &M, image: &DynamicImage) -> Result<Array3<f32>> {
        let base = model.predict_probabilities(image)?;
        if !self.settings.test_time_augmentation {
            return Ok(base);
        }

        let lr = model.predict_probabilities(&image.fliph())?;
        let ud = model.predict_probabilities(&image.flipv())?;
        let both = model.predict_probabilities(&image.fliph().flipv())?;

        let mut sum = base;
        sum += &lr.slice(s![.., .., ..;-1]);
        sum += &ud.slice(s![.., ..;-1, ..]);
        sum += &both.slice(s![.., ..;-1, ..;-1]);
        sum.mapv_inplace(|v| v / 4.0);
        Ok(sum)
    }

    pub fn segment(&self, image: &DynamicImage) -> Result<Segmentation> {
        let (width, height) = (image.width(), image.height());
        let nclasses = self.nclasses();

        let mut members = Vec::with_capacity(self.models.len());
        for model in &self.models {
            let probs = self.member_probabilities(model, image)?;
            if probs.dim().0 != nclasses {
                return Err(OrthoSegError::Model {
                    operation: format!("predict with {}", model.name()),
                    source: format!("expected {nclasses} classes, got {}", probs.dim().0).into(),
                });
            }
            members.push(resize_probabilities(&probs, width, height));
        }

        let mut probabilities = Array3::<f32>::zeros((nclasses, height as usize, width as usize));
        for member in &members {
            probabilities += member;
        }
        probabilities.mapv_inplace(|v| v / members.len() as f32);

        let (labels, otsu_level) = if self.settings.otsu_threshold && nclasses == 2 {
            let foreground = probabilities.index_axis(Axis(0), 1);
            let level = otsu_level(foreground);
            debug!("Otsu level {level:.4}");
            (foreground.mapv(|p| u8::from(p > level)), Some(level))
        } else {
            (argmax(&probabilities), None)
        };

        Ok(Segmentation {
            probabilities,
            members,
            labels,
            otsu_level,
        })
    }

    /// Runs the ensemble on one tile and writes its outputs into `output_dir`.
    pub fn predict_tile(&self, tile: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let key = tile
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(TileNameKey::parse)
            .ok_or_else(|| {
                OrthoSegError::raster(tile.display(), "name prediction", "tile name does not follow the naming schema")
            })?;
        let image =
            image::open(tile).map_err(|e| OrthoSegError::raster(tile.display(), "decode tile", e))?;
        let segmentation = self.segment(&image)?;

        let mut written = Vec::new();
        let labels = DynamicImage::ImageLuma8(to_gray(&segmentation.labels));
        written.push(save_image(labels, output_dir, &key, PredictionKind::Label, None)?);

        if self.settings.profile == OutputProfile::Full {
            let prob = DynamicImage::ImageLuma8(max_probability_image(&segmentation.probabilities));
            written.push(save_image(prob, output_dir, &key, PredictionKind::Probability, None)?);
            let overlay = DynamicImage::ImageRgb8(overlay_image(&image, &segmentation.labels));
            written.push(save_image(overlay, output_dir, &key, PredictionKind::Overlay, None)?);
        }

        if self.models.len() > 1 && self.settings.profile != OutputProfile::Minimal {
            for (i, member) in segmentation.members.iter().enumerate() {
                let prob = DynamicImage::ImageLuma8(max_probability_image(member));
                written.push(save_image(prob, output_dir, &key, PredictionKind::Probability, Some(i))?);
            }
        }

        if self.settings.write_metadata {
            let mut counts = vec![0u64; self.nclasses()];
            for &label in segmentation.labels.iter() {
                counts[label as usize] += 1;
            }
            let metadata = PredictionMetadata {
                tile: key.to_string(),
                models: self.models.iter().map(|m| m.name()).collect(),
                nclasses: self.nclasses(),
                test_time_augmentation: self.settings.test_time_augmentation,
                otsu_level: segmentation.otsu_level,
                class_pixel_counts: counts,
            };
            let path = output_dir.join(key.output_file_name(PredictionKind::Metadata, None));
            fs::write(&path, serde_json::to_string_pretty(&metadata)?)
                .map_err(|e| OrthoSegError::filesystem(&path, "write prediction metadata", e))?;
            written.push(path);
        }

        Ok(written)
    }
}

impl<M: SegmentationModel> TilePredictor for EnsembleRunner<M> {
    fn predict(&self, tile: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        self.predict_tile(tile, output_dir)
    }
}

/// Predicts every tile in `tiles_dir` one after another.
///
/// No tiles is fatal. A tile that fails is logged and recorded; the batch continues.
pub fn predict_directory<P: TilePredictor + ?Sized>(
    predictor: &P,
    tiles_dir: &Path,
    output_dir: &Path,
) -> Result<PredictReport> {
    let tiles = predictor_tiles(tiles_dir)?;
    if tiles.is_empty() {
        return Err(OrthoSegError::NoInput(format!(
            "no tiles to predict in {}",
            tiles_dir.display()
        )));
    }
    ensure_dir(output_dir)?;
    info!("Number of samples: {}", tiles.len());

    let pb = ProgressBar::new(tiles.len() as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{elapsed}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec} {eta})",
        )
        .map_err(|e| OrthoSegError::config(e.to_string()))?
        .progress_chars("#>-"),
    );

    let mut report = PredictReport::default();
    for tile in &tiles {
        match predictor.predict(tile, output_dir) {
            Ok(outputs) => {
                report.predicted += 1;
                report.outputs.extend(outputs);
            }
            Err(e) if !e.is_fatal() => {
                error!("{} failed: {}", tile.display(), e);
                report.failures.push(TileFailure::new(
                    tile,
                    Stage::Predict,
                    TileFailureKind::Predict,
                    e.to_string(),
                ));
            }
            Err(e) => {
                pb.abandon();
                return Err(e);
            }
        }
        pb.inc(1);
    }
    pb.finish_and_clear();

    if !report.failures.is_empty() {
        warn!("{} of {} tile(s) failed prediction", report.failures.len(), tiles.len());
    }
    info!("Predicted {} tile(s) into {}", report.predicted, output_dir.display());
    Ok(report)
}

fn save_image(
    image: DynamicImage,
    output_dir: &Path,
    key: &TileNameKey,
    kind: PredictionKind,
    model: Option<usize>,
) -> Result<PathBuf> {
    let path = output_dir.join(key.output_file_name(kind, model));
    image
        .save(&path)
        .map_err(|e| OrthoSegError::raster(path.display(), "write prediction", e))?;
    Ok(path)
}

/// Bilinear resample of every class plane to `width` x `height`.
pub fn resize_probabilities(probs: &Array3<f32>, width: u32, height: u32) -> Array3<f32> {
    let (nclasses, h, w) = probs.dim();
    if (w, h) == (width as usize, height as usize) {
        return probs.clone();
    }
    let mut out = Array3::<f32>::zeros((nclasses, height as usize, width as usize));
    for (k, plane) in probs.outer_iter().enumerate() {
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_fn(w as u32, h as u32, |x, y| Luma([plane[[y as usize, x as usize]]]));
        let resized = imageops::resize(&buffer, width, height, FilterType::Triangle);
        for (x, y, Luma([v])) in resized.enumerate_pixels() {
            out[[k, y as usize, x as usize]] = *v;
        }
    }
    out
}

/// Most probable class per pixel; ties go to the lower class index.
pub fn argmax(probs: &Array3<f32>) -> Array2<u8> {
    let (_, h, w) = probs.dim();
    Array2::from_shape_fn((h, w), |(r, c)| {
        let mut best = 0;
        for k in 1..probs.dim().0 {
            if probs[[k, r, c]] > probs[[best, r, c]] {
                best = k;
            }
        }
        best as u8
    })
}

/// Otsu's threshold of a probability map, using 256 bins over `[0, 1]`.
pub fn otsu_level(probs: ArrayView2<f32>) -> f32 {
    let mut histogram = [0u64; 256];
    for &p in probs.iter() {
        let bin = (p.clamp(0.0, 1.0) * 255.0).round() as usize;
        histogram[bin] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0.5;
    }
    let weighted_total: f64 = histogram.iter().enumerate().map(|(i, &n)| i as f64 * n as f64).sum();

    let (mut background, mut weighted_background) = (0u64, 0f64);
    let (mut best_bin, mut best_variance) = (127usize, -1f64);
    for (i, &n) in histogram.iter().enumerate() {
        background += n;
        if background == 0 {
            continue;
        }
        let foreground = total - background;
        if foreground == 0 {
            break;
        }
        weighted_background += i as f64 * n as f64;
        let mean_b = weighted_background / background as f64;
        let mean_f = (weighted_total - weighted_background) / foreground as f64;
        let variance = background as f64 * foreground as f64 * (mean_b - mean_f).powi(2);
        if variance > best_variance {
            best_variance = variance;
            best_bin = i;
        }
    }
    // Pixels in bins above the threshold are foreground.
    (best_bin as f32 + 0.5) / 255.0
}

fn to_gray(labels: &Array2<u8>) -> GrayImage {
    let (h, w) = labels.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| Luma([labels[[y as usize, x as usize]]]))
}

fn max_probability_image(probs: &Array3<f32>) -> GrayImage {
    let (_, h, w) = probs.dim();
    GrayImage::from_fn(w as u32, h as u32, |x, y| {
        let max = probs
            .slice(s![.., y as usize, x as usize])
            .fold(0f32, |m, &v| m.max(v));
        Luma([(max.clamp(0.0, 1.0) * 255.0).round() as u8])
    })
}

const PALETTE: [[u8; 3]; 16] = [
    [0x33, 0x66, 0xCC],
    [0xDC, 0x39, 0x12],
    [0xFF, 0x99, 0x00],
    [0x10, 0x96, 0x18],
    [0x99, 0x00, 0x99],
    [0x00, 0x99, 0xC6],
    [0xDD, 0x44, 0x77],
    [0x66, 0xAA, 0x00],
    [0xB8, 0x2E, 0x2E],
    [0x31, 0x63, 0x95],
    [0x99, 0x44, 0x99],
    [0x22, 0xAA, 0x99],
    [0xAA, 0xAA, 0x11],
    [0x66, 0x33, 0xCC],
    [0xE6, 0x73, 0x00],
    [0x8B, 0x07, 0x07],
];

/// Half-and-half blend of the tile and its colourised labels.
fn overlay_image(image: &DynamicImage, labels: &Array2<u8>) -> RgbImage {
    let rgb = image.to_rgb8();
    RgbImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let Rgb(px) = *rgb.get_pixel(x, y);
        let colour = PALETTE[labels[[y as usize, x as usize]] as usize % PALETTE.len()];
        Rgb([0, 1, 2].map(|i| ((px[i] as u16 + colour[i] as u16) / 2) as u8))
    })
}
