use std::fs;
use std::path::{Path, PathBuf};

use image::{imageops, imageops::FilterType, DynamicImage, GrayImage, Luma};
use ndarray::prelude::*;

use crate::errors::{OrthoSegError, Result};
use crate::model_config::{ModelArchitecture, ModelConfig};
use crate::naming::{PredictionKind, TileNameKey};
use crate::traits::{SegmentationModel, TilePredictor};

fn mock_config(nclasses: usize, size: u32) -> ModelConfig {
    ModelConfig {
        target_size: [size, size],
        nclasses,
        n_data_bands: 3,
        model: ModelArchitecture::Unet,
        set_gpu: "-1".to_string(),
        test_time_augmentation: false,
        write_model_metadata: false,
        otsu_threshold: false,
    }
}

/// Predicts the same class everywhere with certainty.
#[derive(Debug, Clone)]
pub struct ConstantModel {
    config: ModelConfig,
    class: usize,
}

impl ConstantModel {
    pub fn new(nclasses: usize, class: usize, size: u32) -> Self {
        Self {
            config: mock_config(nclasses, size),
            class,
        }
    }
}

impl SegmentationModel for ConstantModel {
    fn name(&self) -> &str {
        "constant"
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn predict_probabilities(&self, _image: &DynamicImage) -> Result<Array3<f32>> {
        let (h, w) = self.config.input_size();
        Ok(Array3::from_shape_fn(
            (self.config.nclasses, h as usize, w as usize),
            |(k, _, _)| if k == self.class { 1.0 } else { 0.0 },
        ))
    }
}

/// Two-class model whose foreground probability is pixel brightness.
#[derive(Debug, Clone)]
pub struct ThresholdModel {
    config: ModelConfig,
}

impl ThresholdModel {
    pub fn new(size: u32) -> Self {
        Self {
            config: mock_config(2, size),
        }
    }
}

impl SegmentationModel for ThresholdModel {
    fn name(&self) -> &str {
        "threshold"
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn predict_probabilities(&self, image: &DynamicImage) -> Result<Array3<f32>> {
        let (h, w) = self.config.input_size();
        let gray = imageops::resize(&image.to_luma8(), w, h, FilterType::Triangle);
        let mut probs = Array3::<f32>::zeros((2, h as usize, w as usize));
        for (x, y, Luma([v])) in gray.enumerate_pixels() {
            let p = f32::from(*v) / 255.0;
            probs[[0, y as usize, x as usize]] = 1.0 - p;
            probs[[1, y as usize, x as usize]] = p;
        }
        Ok(probs)
    }
}

/// Writes an all-`label` `{key}_predseg.png`, plus a `_prob.png` byproduct when
/// `byproducts` is set, without touching any model.
#[derive(Debug, Clone, Copy)]
pub struct StubPredictor {
    pub label: u8,
    pub byproducts: bool,
}

impl StubPredictor {
    pub fn new(label: u8) -> Self {
        Self {
            label,
            byproducts: true,
        }
    }

    pub fn labels_only(label: u8) -> Self {
        Self {
            label,
            byproducts: false,
        }
    }
}

impl TilePredictor for StubPredictor {
    fn predict(&self, tile: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let key = tile
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(TileNameKey::parse)
            .ok_or_else(|| OrthoSegError::raster(tile.display(), "name prediction", "not a tile name"))?;
        let (width, height) = image::image_dimensions(tile)
            .map_err(|e| OrthoSegError::raster(tile.display(), "read tile size", e))?;
        fs::create_dir_all(output_dir)?;

        let labels = GrayImage::from_pixel(width, height, Luma([self.label]));
        let label_path = output_dir.join(key.output_file_name(PredictionKind::Label, None));
        labels.save(&label_path)?;
        if !self.byproducts {
            return Ok(vec![label_path]);
        }
        let prob_path = output_dir.join(key.output_file_name(PredictionKind::Probability, None));
        GrayImage::from_pixel(width, height, Luma([255])).save(&prob_path)?;
        Ok(vec![label_path, prob_path])
    }
}
