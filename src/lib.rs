pub mod config;
pub mod curate;
pub mod errors;
pub mod georef;
pub mod manifest;
pub mod model;
pub mod model_config;
pub mod mosaic;
pub mod naming;
pub mod normalize;
pub mod pipeline;
pub mod predict;
pub mod raster;
pub mod tiling;
pub mod traits;
pub mod zoo;

pub mod mocks;

pub use config::Config;
pub use errors::{OrthoSegError, Result};
pub use model::OnnxModel;
pub use model_config::ModelConfig;
pub use mosaic::ResampleAlg;
pub use naming::TileNameKey;
pub use pipeline::Pipeline;
pub use predict::{EnsembleRunner, OutputProfile, PredictionSettings};
pub use traits::*;
