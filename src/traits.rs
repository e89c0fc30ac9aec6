use std::path::{Path, PathBuf};

use image::DynamicImage;
use ndarray::Array3;

use crate::errors::Result;
use crate::model_config::ModelConfig;
use crate::zoo::RemoteFile;

/// A pretrained segmentation network.
///
/// Implementations must be deterministic for fixed weights and input pixels.
pub trait SegmentationModel: Send + Sync {
    /// Short name used in logs and prediction metadata.
    fn name(&self) -> &str;

    fn config(&self) -> &ModelConfig;

    /// Class probabilities laid out as `(class, row, col)`.
    ///
    /// The spatial size is whatever the network produces; callers resample.
    fn predict_probabilities(&self, image: &DynamicImage) -> Result<Array3<f32>>;
}

/// The per-tile predictor the pipeline hands tiles to.
///
/// Output file stems must start with the tile stem so the curator can correlate
/// them; disposable outputs carry a `_prob` or `_overlay` suffix.
pub trait TilePredictor {
    fn predict(&self, tile: &Path, output_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// Somewhere model releases can be listed and downloaded from.
pub trait ArtifactSource {
    fn list_files(&self, record_id: &str) -> Result<Vec<RemoteFile>>;

    fn fetch(&self, url: &str, dest: &Path) -> Result<()>;
}
