//! File naming schema shared by every stage.
//!
//! Stages hand work to each other through directories, so the file name is the
//! interface. Names are built and parsed here and nowhere else:
//!
//! ```text
//! tiles/{prefix}_{row:03}_{col:03}.jpg             input tile
//! tiles/{prefix}_{row:03}_{col:03}.jpg.aux.xml     its georeferencing sidecar
//! out/{key}_predseg.png                            fused label raster
//! out/{key}_prob.png, out/{key}_overlay.png        byproducts
//! out/{key}_m{i}_prob.png                          per-model byproducts
//! out/{key}_meta.json                              prediction metadata
//! out/{key}.png + out/{key}.png.aux.xml            curated pair
//! ```
//!
//! Suffixes are only ever matched at the end of a stem, so a prefix that happens to
//! contain `predseg` or `prob` is left alone.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Extension of the PAM sidecar written next to every georeferenced raster.
pub const SIDECAR_EXTENSION: &str = "aux.xml";

/// Canonical identifier correlating a tile with everything derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileNameKey {
    pub prefix: String,
    /// 1-based grid row.
    pub row: u32,
    /// 1-based grid column.
    pub col: u32,
}

impl TileNameKey {
    pub fn new(prefix: impl Into<String>, row: u32, col: u32) -> Self {
        Self {
            prefix: prefix.into(),
            row,
            col,
        }
    }

    /// Parses `{prefix}_{row}_{col}`, splitting from the right.
    pub fn parse(stem: &str) -> Option<Self> {
        let mut parts = stem.rsplitn(3, '_');
        let col = parts.next()?;
        let row = parts.next()?;
        let prefix = parts.next()?;
        if prefix.is_empty() || !is_index(row) || !is_index(col) {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            row: row.parse().ok()?,
            col: col.parse().ok()?,
        })
    }

    pub fn tile_file_name(&self, extension: &str) -> String {
        format!("{self}.{extension}")
    }

    pub fn output_file_name(&self, kind: PredictionKind, model: Option<usize>) -> String {
        PredictionName {
            key: self.clone(),
            model,
            kind,
        }
        .file_name()
    }

    /// Name of the curated label raster.
    pub fn curated_file_name(&self) -> String {
        self.output_file_name(PredictionKind::Curated, None)
    }
}

impl fmt::Display for TileNameKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{:03}_{:03}", self.prefix, self.row, self.col)
    }
}

fn is_index(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

/// What a file in the prediction output directory holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PredictionKind {
    /// Fused class-label raster straight from the predictor.
    Label,
    /// Per-pixel probability of the winning class. Disposable.
    Probability,
    /// Colourised labels blended over the tile. Disposable.
    Overlay,
    /// JSON metadata describing the prediction.
    Metadata,
    /// Label raster after curation; its stem is exactly the tile key.
    Curated,
}

impl PredictionKind {
    const fn suffix(self) -> &'static str {
        match self {
            Self::Label => "_predseg",
            Self::Probability => "_prob",
            Self::Overlay => "_overlay",
            Self::Metadata => "_meta",
            Self::Curated => "",
        }
    }

    const fn extension(self) -> &'static str {
        match self {
            Self::Metadata => "json",
            _ => "png",
        }
    }

    /// Byproducts are deleted by the curator and never reach the mosaic.
    pub const fn is_byproduct(self) -> bool {
        matches!(self, Self::Probability | Self::Overlay)
    }
}

/// Parsed name of a predictor output file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PredictionName {
    pub key: TileNameKey,
    /// Index of the ensemble member for per-model byproducts.
    pub model: Option<usize>,
    pub kind: PredictionKind,
}

impl PredictionName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let (stem, extension) = file_name.rsplit_once('.')?;

        let (kind, rest) = [
            PredictionKind::Label,
            PredictionKind::Probability,
            PredictionKind::Overlay,
            PredictionKind::Metadata,
        ]
        .into_iter()
        .filter(|kind| kind.extension() == extension)
        .find_map(|kind| stem.strip_suffix(kind.suffix()).map(|rest| (kind, rest)))
        .unwrap_or((PredictionKind::Curated, stem));

        let (model, rest) = match rest.rsplit_once("_m") {
            Some((head, index)) if kind != PredictionKind::Curated && is_index(index) => {
                (index.parse().ok(), head)
            }
            _ => (None, rest),
        };

        let key = TileNameKey::parse(rest)?;
        Some(Self { key, model, kind })
    }

    pub fn file_name(&self) -> String {
        let model = self
            .model
            .map(|index| format!("_m{index}"))
            .unwrap_or_default();
        format!(
            "{}{}{}.{}",
            self.key,
            model,
            self.kind.suffix(),
            self.kind.extension()
        )
    }
}

/// `foo.png` -> `foo.png.aux.xml`
pub fn sidecar_path(image: &Path) -> std::path::PathBuf {
    let mut name = image.as_os_str().to_owned();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    name.into()
}

/// Returns the image file name a sidecar belongs to, if `file_name` is a sidecar.
pub fn sidecar_target(file_name: &str) -> Option<&str> {
    file_name
        .strip_suffix(SIDECAR_EXTENSION)
        .and_then(|s| s.strip_suffix('.'))
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip_with_underscored_prefix() {
        let key = TileNameKey::new("merged_rgb_clip", 4, 12);
        assert_eq!(key.to_string(), "merged_rgb_clip_004_012");
        assert_eq!(TileNameKey::parse("merged_rgb_clip_004_012"), Some(key));
    }

    #[test]
    fn test_key_rejects_malformed_stems() {
        assert_eq!(TileNameKey::parse("ortho"), None);
        assert_eq!(TileNameKey::parse("ortho_1"), None);
        assert_eq!(TileNameKey::parse("_001_002"), None);
        assert_eq!(TileNameKey::parse("ortho_a_002"), None);
    }

    #[test]
    fn test_parse_prediction_kinds() {
        let cases = [
            ("o_001_002_predseg.png", PredictionKind::Label, None),
            ("o_001_002_prob.png", PredictionKind::Probability, None),
            ("o_001_002_overlay.png", PredictionKind::Overlay, None),
            ("o_001_002_m1_prob.png", PredictionKind::Probability, Some(1)),
            ("o_001_002_meta.json", PredictionKind::Metadata, None),
            ("o_001_002.png", PredictionKind::Curated, None),
        ];
        for (name, kind, model) in cases {
            let parsed = PredictionName::parse(name).expect(name);
            assert_eq!(parsed.kind, kind, "{name}");
            assert_eq!(parsed.model, model, "{name}");
            assert_eq!(parsed.key, TileNameKey::new("o", 1, 2), "{name}");
            assert_eq!(parsed.file_name(), name);
        }
    }

    #[test]
    fn test_suffix_inside_prefix_is_not_stripped() {
        // Substring replacement would mangle this prefix.
        let parsed = PredictionName::parse("predseg_prob_site_003_001_predseg.png").unwrap();
        assert_eq!(parsed.kind, PredictionKind::Label);
        assert_eq!(parsed.key.prefix, "predseg_prob_site");
        assert_eq!(parsed.key.curated_file_name(), "predseg_prob_site_003_001.png");
    }

    #[test]
    fn test_sidecar_helpers() {
        let path = sidecar_path(Path::new("/a/o_001_001.png"));
        assert_eq!(path, Path::new("/a/o_001_001.png.aux.xml"));
        assert_eq!(sidecar_target("o_001_001.png.aux.xml"), Some("o_001_001.png"));
        assert_eq!(sidecar_target("o_001_001.png"), None);
    }
}
