use std::fmt;
use std::fs;
use std::path::Path;

use log::info;
use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::{OrthoSegError, Result};

/// Network family named by the `MODEL` key.
///
/// The architecture itself lives in the exported weights; the name only selects
/// output handling (SegFormer exports emit logits at reduced resolution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelArchitecture {
    Unet,
    Resunet,
    SimpleUnet,
    SimpleResunet,
    Satunet,
    Segformer,
}

impl ModelArchitecture {
    /// Whether the exported graph ends in logits rather than a softmax.
    pub const fn emits_logits(self) -> bool {
        matches!(self, Self::Segformer)
    }
}

impl fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unet => "unet",
            Self::Resunet => "resunet",
            Self::SimpleUnet => "simple_unet",
            Self::SimpleResunet => "simple_resunet",
            Self::Satunet => "satunet",
            Self::Segformer => "segformer",
        };
        f.write_str(name)
    }
}

/// Per-model configuration record shipped next to each weights file.
///
/// Keys follow the upper-case names used by the model releases; unknown keys
/// (training hyper-parameters and the like) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(rename = "TARGET_SIZE")]
    pub target_size: [u32; 2],

    #[serde(rename = "NCLASSES")]
    pub nclasses: usize,

    #[serde(rename = "N_DATA_BANDS", default = "default_bands")]
    pub n_data_bands: usize,

    #[serde(rename = "MODEL")]
    pub model: ModelArchitecture,

    /// GPU selector: `"-1"` for CPU, otherwise a device index (or a comma list,
    /// of which the first entry is used).
    #[serde(rename = "SET_GPU", default = "default_gpu", deserialize_with = "string_or_number")]
    pub set_gpu: String,

    #[serde(rename = "TESTTIMEAUG", default)]
    pub test_time_augmentation: bool,

    #[serde(rename = "WRITE_MODELMETADATA", default)]
    pub write_model_metadata: bool,

    #[serde(rename = "OTSU_THRESHOLD", default)]
    pub otsu_threshold: bool,
}

fn default_bands() -> usize {
    3
}

fn default_gpu() -> String {
    "0".to_string()
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<String, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Selector {
        Text(String),
        Number(i64),
    }
    Ok(match Selector::deserialize(deserializer)? {
        Selector::Text(s) => s,
        Selector::Number(n) => n.to_string(),
    })
}

impl ModelConfig {
    /// Reads and validates a configuration file; any problem is a configuration error
    /// naming the file.
    pub fn load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| OrthoSegError::filesystem(path, "read model config", e))?;
        let config: Self = serde_json::from_str(&json)
            .map_err(|e| OrthoSegError::config(format!("{}: {e}", path.display())))?;
        config
            .validate()
            .map_err(|e| OrthoSegError::config(format!("{}: {e}", path.display())))?;
        info!(
            "Loaded {} config from {}: {}x{} px, {} band(s), {} classes, TTA={}, OTSU={}, METADATA={}",
            config.model,
            path.display(),
            config.target_size[0],
            config.target_size[1],
            config.n_data_bands,
            config.nclasses,
            config.test_time_augmentation,
            config.otsu_threshold,
            config.write_model_metadata
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_size.contains(&0) {
            return Err(OrthoSegError::Validation {
                field: "TARGET_SIZE".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        if self.nclasses < 2 || self.nclasses > 256 {
            return Err(OrthoSegError::Validation {
                field: "NCLASSES".to_string(),
                reason: format!("{} is outside 2..=256", self.nclasses),
            });
        }
        if !matches!(self.n_data_bands, 1 | 3) {
            return Err(OrthoSegError::Validation {
                field: "N_DATA_BANDS".to_string(),
                reason: format!("{} bands cannot be fed from 8-bit JPEG tiles", self.n_data_bands),
            });
        }
        self.device()?;
        Ok(())
    }

    pub fn device(&self) -> Result<DeviceConfig> {
        DeviceConfig::from_selector(&self.set_gpu)
    }

    /// `(height, width)` of the network input.
    pub fn input_size(&self) -> (u32, u32) {
        (self.target_size[0], self.target_size[1])
    }
}

/// Ensemble members must agree on everything that shapes the tensors.
pub fn ensure_compatible(configs: &[ModelConfig]) -> Result<()> {
    let Some(first) = configs.first() else {
        return Err(OrthoSegError::config("no model configurations were supplied"));
    };
    for other in &configs[1..] {
        if other.target_size != first.target_size
            || other.nclasses != first.nclasses
            || other.n_data_bands != first.n_data_bands
        {
            return Err(OrthoSegError::config(format!(
                "ensemble members disagree: {:?}/{}/{} vs {:?}/{}/{}",
                first.target_size,
                first.nclasses,
                first.n_data_bands,
                other.target_size,
                other.nclasses,
                other.n_data_bands
            )));
        }
    }
    Ok(())
}

/// Inference device handed to the model constructor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    pub cpu_only: bool,
    pub device_id: i32,
}

impl DeviceConfig {
    pub const CPU: Self = Self {
        cpu_only: true,
        device_id: 0,
    };

    pub fn from_selector(selector: &str) -> Result<Self> {
        let first = selector.split(',').next().unwrap_or_default().trim();
        let id: i32 = first.parse().map_err(|_| OrthoSegError::Validation {
            field: "SET_GPU".to_string(),
            reason: format!("`{selector}` is not a device index"),
        })?;
        Ok(if id < 0 {
            Self::CPU
        } else {
            Self {
                cpu_only: false,
                device_id: id,
            }
        })
    }
}
