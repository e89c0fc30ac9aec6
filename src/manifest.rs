//! Typed files that sit beside the rasters: the tile index written by the splitter
//! and the mosaic manifest written by the curator.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{OrthoSegError, Result};
use crate::georef::{Crs, GeoTransform};
use crate::naming::TileNameKey;

pub const TILE_INDEX_FILE: &str = "tiles.json";
pub const MANIFEST_FILE: &str = "manifest.json";

/// One tile cut from the source raster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileRecord {
    pub key: TileNameKey,
    pub row_off: usize,
    pub col_off: usize,
    pub width: usize,
    pub height: usize,
    pub geotransform: GeoTransform,
}

/// Everything the splitter knows about the grid it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileIndex {
    pub source: PathBuf,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub geotransform: GeoTransform,
    pub crs: Option<Crs>,
    pub tile_size: usize,
    pub overlap: usize,
    pub tiles: Vec<TileRecord>,
}

impl TileIndex {
    pub fn find(&self, key: &TileNameKey) -> Option<&TileRecord> {
        self.tiles.iter().find(|t| &t.key == key)
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        save_json(&dir.join(TILE_INDEX_FILE), self)
    }

    /// Loads the index if the splitter left one in `dir`.
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(TILE_INDEX_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        load_json(&path).map(Some)
    }
}

/// Where a manifest entry's placement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeorefSource {
    Sidecar,
    /// No sidecar was found; the tile index supplied the geotransform.
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub key: TileNameKey,
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub geotransform: GeoTransform,
    pub georef: GeorefSource,
}

/// Curated prediction outputs in mosaic order (sorted by key).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MosaicManifest {
    pub crs: Option<Crs>,
    pub entries: Vec<ManifestEntry>,
}

impl MosaicManifest {
    /// Sorts entries into mosaic order and rejects duplicate keys.
    pub fn new(crs: Option<Crs>, mut entries: Vec<ManifestEntry>) -> Result<Self> {
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(&entry.key) {
                return Err(OrthoSegError::Validation {
                    field: "manifest".to_string(),
                    reason: format!("duplicate tile key {}", entry.key),
                });
            }
        }
        Ok(Self { crs, entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        save_json(&dir.join(MANIFEST_FILE), self)
    }

    pub fn load(dir: &Path) -> Result<Self> {
        load_json(&dir.join(MANIFEST_FILE))
    }
}

fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<PathBuf> {
    let json = serde_json::to_string_pretty(value)?;
    fs::write(path, json).map_err(|e| OrthoSegError::filesystem(path, "write JSON", e))?;
    Ok(path.to_path_buf())
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let json =
        fs::read_to_string(path).map_err(|e| OrthoSegError::filesystem(path, "read JSON", e))?;
    serde_json::from_str(&json).map_err(|e| OrthoSegError::Configuration {
        message: format!("{}: {e}", path.display()),
    })
}
