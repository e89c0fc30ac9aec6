use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::naming::TileNameKey;

/// Structured error types for the orthomosaic segmentation pipeline.
///
/// Each variant captures context specific to its error domain (filesystem, raster codec,
/// model operations, remote archive, etc.) so callers can report the failing input
/// without parsing error strings.
#[derive(Error, Debug)]
pub enum OrthoSegError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Raster error: {operation} failed (file: {path})")]
    Raster {
        path: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Remote fetch error: {operation} failed for {url}")]
    Fetch {
        url: String,
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Validation error: {field} {reason}")]
    Validation { field: String, reason: String },

    #[error("No input: {0}")]
    NoInput(String),

    #[error("Cannot build mosaic: {0}")]
    EmptyMosaic(String),
}

pub type Result<T> = std::result::Result<T, OrthoSegError>;

impl OrthoSegError {
    pub(crate) fn raster(
        path: impl fmt::Display,
        operation: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Raster {
            path: path.to_string(),
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub(crate) fn filesystem(
        path: impl Into<PathBuf>,
        operation: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::FileSystem {
            path: path.into(),
            operation: operation.into(),
            source,
        }
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether the error aborts the whole run.
    ///
    /// Only raster and model failures raised while handling a single tile are
    /// recoverable; the stage that catches them records a [`TileFailure`] and moves on.
    /// Everything else (configuration, remote fetch, filesystem layout, reassembly)
    /// is fatal at the stage boundary.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Raster { .. } | Self::Model { .. })
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that has context should construct [`OrthoSegError::FileSystem`] directly with the
/// specific path and operation; this is the fallback for the rest.
impl From<std::io::Error> for OrthoSegError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for OrthoSegError {
    fn from(err: image::ImageError) -> Self {
        Self::raster("unknown", "image codec", err)
    }
}

impl From<tiff::TiffError> for OrthoSegError {
    fn from(err: tiff::TiffError) -> Self {
        Self::raster("unknown", "tiff codec", err)
    }
}

impl From<ort::Error> for OrthoSegError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Shape errors come out of tensor handling around inference, so they are model errors.
impl From<ndarray::ShapeError> for OrthoSegError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<serde_json::Error> for OrthoSegError {
    fn from(err: serde_json::Error) -> Self {
        Self::Configuration {
            message: format!("invalid JSON: {err}"),
        }
    }
}

impl From<reqwest::Error> for OrthoSegError {
    fn from(err: reqwest::Error) -> Self {
        Self::Fetch {
            url: err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            operation: "http request".to_string(),
            source: Box::new(err),
        }
    }
}

/// Pipeline stage a per-tile failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Normalize,
    Predict,
    Curate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileFailureKind {
    /// The tile could not be transcoded; the lossless copy is left in place.
    Transcode,
    /// The predictor raised an error for this tile.
    Predict,
    /// No sidecar was found; the placement was inferred from the tile index.
    MissingSidecar,
    /// Neither a sidecar nor a tile index entry exists; the output is left out.
    Unplaced,
    /// The curated raster or its sidecar could not be read; the output is left out.
    Unreadable,
}

/// A recoverable failure scoped to a single tile.
#[derive(Debug, Clone)]
pub struct TileFailure {
    pub key: Option<TileNameKey>,
    pub file: PathBuf,
    pub stage: Stage,
    pub kind: TileFailureKind,
    pub message: String,
}

impl TileFailure {
    pub fn new(
        file: impl Into<PathBuf>,
        stage: Stage,
        kind: TileFailureKind,
        message: impl Into<String>,
    ) -> Self {
        let file = file.into();
        let key = file
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| crate::naming::PredictionName::parse(n).map(|p| p.key));
        Self {
            key,
            file,
            stage,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TileFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}/{:?} {}: {}",
            self.stage,
            self.kind,
            self.file.display(),
            self.message
        )
    }
}
