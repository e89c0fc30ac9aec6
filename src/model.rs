use std::path::Path;

use image::{imageops, imageops::FilterType, DynamicImage};
use log::{debug, info};
use ndarray::prelude::*;
use nshare::{AsNdarray2, AsNdarray3};
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
    value::TensorRef,
};
use parking_lot::Mutex;

use crate::{
    errors::{OrthoSegError, Result},
    model_config::{DeviceConfig, ModelConfig},
    traits::SegmentationModel,
};

/// An exported segmentation network run through ONNX Runtime.
///
/// Graphs take a single NHWC float tensor `[1, H, W, bands]` and return class scores,
/// either NHWC (Keras exports) or NCHW (SegFormer exports).
pub struct OnnxModel {
    name: String,
    config: ModelConfig,
    input_name: String,
    output_name: String,
    session: Mutex<Session>,
}

fn model_error(operation: impl Into<String>, e: impl ToString) -> OrthoSegError {
    OrthoSegError::Model {
        operation: operation.into(),
        source: e.to_string().into(),
    }
}

impl OnnxModel {
    pub fn new(weights: &Path, config: ModelConfig, device: DeviceConfig) -> Result<Self> {
        let mut builder =
            SessionBuilder::new().map_err(|e| model_error("session builder initialisation", e))?;
        if !device.cpu_only {
            builder = builder
                .with_execution_providers([
                    TensorRTExecutionProvider::default()
                        .with_device_id(device.device_id)
                        .build(),
                    CUDAExecutionProvider::default()
                        .with_device_id(device.device_id)
                        .build(),
                ])
                .map_err(|e| model_error("execution provider setup", e))?;
        }
        let mut session = builder
            .with_memory_pattern(true)
            .map_err(|e| model_error("memory pattern setup", e))?
            .commit_from_file(weights)
            .map_err(|e| model_error(format!("load weights: {}", weights.display()), e))?;

        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| model_error("inspect graph inputs", "graph has no inputs"))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| model_error("inspect graph outputs", "graph has no outputs"))?;

        // Warm up so the first tile does not pay for kernel selection.
        let (h, w) = config.input_size();
        let data = Array4::<f32>::zeros((1, h as usize, w as usize, config.n_data_bands));
        session
            .run(ort::inputs![input_name.as_str() => TensorRef::from_array_view(&data)?])
            .map_err(|e| model_error("model warm-up", e))?;

        let name = weights
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();
        info!(
            "Loaded {} ({}) on {}",
            name,
            config.model,
            if device.cpu_only {
                "CPU".to_string()
            } else {
                format!("device {}", device.device_id)
            }
        );

        Ok(Self {
            name,
            config,
            input_name,
            output_name,
            session: Mutex::new(session),
        })
    }

    fn run(&self, tensor: &Array4<f32>) -> Result<Array4<f32>> {
        let mut session = self.session.lock();
        let outputs = session.run(
            ort::inputs![self.input_name.as_str() => TensorRef::from_array_view(&tensor.as_standard_layout())?],
        )?;
        let scores = outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix4>()?
            .to_owned();
        Ok(scores)
    }
}

impl SegmentationModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn predict_probabilities(&self, image: &DynamicImage) -> Result<Array3<f32>> {
        let tensor = preprocess(image, &self.config);
        let scores = self.run(&tensor)?;
        let scores = to_class_major(scores, self.config.nclasses)?;
        debug!("{} produced scores {:?}", self.name, scores.dim());
        Ok(if self.config.model.emits_logits() {
            softmax(scores)
        } else {
            scores
        })
    }
}

/// Resizes to the network input and standardizes per image, as the models were trained.
pub fn preprocess(image: &DynamicImage, config: &ModelConfig) -> Array4<f32> {
    let (h, w) = config.input_size();
    let hwc: Array3<f32> = if config.n_data_bands == 1 {
        let gray = imageops::resize(&image.to_luma8(), w, h, FilterType::Triangle);
        gray.as_ndarray2().mapv(f32::from).insert_axis(Axis(2))
    } else {
        let rgb = imageops::resize(&image.to_rgb8(), w, h, FilterType::Triangle);
        rgb.as_ndarray3().permuted_axes([1, 2, 0]).mapv(f32::from)
    };
    standardize(hwc).insert_axis(Axis(0))
}

/// `(x - mean) / max(std, 1/sqrt(n))`
pub fn standardize(mut pixels: Array3<f32>) -> Array3<f32> {
    let n = pixels.len().max(1) as f32;
    let mean = pixels.sum() / n;
    let var = pixels.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
    let std = var.sqrt().max(1.0 / n.sqrt());
    pixels.mapv_inplace(|v| (v - mean) / std);
    pixels
}

/// `[1, H, W, C]` or `[1, C, H, W]` -> `(C, H, W)`.
fn to_class_major(scores: Array4<f32>, nclasses: usize) -> Result<Array3<f32>> {
    let scores = scores.index_axis_move(Axis(0), 0);
    let (a, _, c) = scores.dim();
    if c == nclasses {
        Ok(scores.permuted_axes([2, 0, 1]).as_standard_layout().to_owned())
    } else if a == nclasses {
        Ok(scores)
    } else {
        Err(model_error(
            "interpret output",
            format!("output shape {:?} has no axis of {nclasses} classes", scores.dim()),
        ))
    }
}

pub fn softmax(mut scores: Array3<f32>) -> Array3<f32> {
    for mut lane in scores.lanes_mut(Axis(0)) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        if sum > 0.0 {
            lane.mapv_inplace(|v| v / sum);
        }
    }
    scores
}
