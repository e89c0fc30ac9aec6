//! Georeferencing: affine geotransforms, coordinate reference systems and the
//! sidecar files that carry them next to plain images.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::errors::{OrthoSegError, Result};

/// GDAL-ordered affine transform `[x0, pixel_w, rot_x, y0, rot_y, pixel_h]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform(pub [f64; 6]);

impl GeoTransform {
    /// Pixel space with a downward y axis, used when an input carries no georeferencing.
    pub const IDENTITY: Self = Self([0.0, 1.0, 0.0, 0.0, 0.0, -1.0]);

    /// World coordinate of the top-left corner of pixel `(col, row)`.
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        let [x0, a, b, y0, d, e] = self.0;
        (x0 + col * a + row * b, y0 + col * d + row * e)
    }

    /// Geotransform of a window whose top-left pixel sits at `(col_off, row_off)`.
    pub fn offset(&self, col_off: usize, row_off: usize) -> Self {
        let (x, y) = self.apply(col_off as f64, row_off as f64);
        let [_, a, b, _, d, e] = self.0;
        Self([x, a, b, y, d, e])
    }

    pub fn is_north_up(&self) -> bool {
        self.0[2] == 0.0 && self.0[4] == 0.0
    }

    /// `(pixel_width, pixel_height)`; the height is negative for north-up rasters.
    pub fn pixel_size(&self) -> (f64, f64) {
        (self.0[1], self.0[5])
    }

    pub fn origin(&self) -> (f64, f64) {
        (self.0[0], self.0[3])
    }

    /// Builds a geotransform from the six lines of an ESRI world file.
    ///
    /// World files reference the centre of the upper-left pixel, geotransforms its corner.
    pub fn from_world_file(text: &str) -> Option<Self> {
        let values: Vec<f64> = text
            .split_whitespace()
            .map(str::parse)
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        let [a, d, b, e, c, f]: [f64; 6] = values.try_into().ok()?;
        Some(Self([c - a / 2.0 - b / 2.0, a, b, f - d / 2.0 - e / 2.0, d, e]))
    }
}

impl fmt::Display for GeoTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|v| format!("{v:.16e}")).collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Coordinate reference system as far as this crate needs to know it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crs {
    Epsg(u16),
    Wkt(String),
}

impl Crs {
    /// EPSG code, taken from the outermost `AUTHORITY["EPSG","n"]` for WKT.
    pub fn epsg(&self) -> Option<u16> {
        match self {
            Self::Epsg(code) => Some(*code),
            Self::Wkt(wkt) => {
                let start = wkt.rfind("AUTHORITY[\"EPSG\",")? + "AUTHORITY[\"EPSG\",".len();
                let rest = &wkt[start..];
                let end = rest.find(']')?;
                rest[..end].trim().trim_matches('"').parse().ok()
            }
        }
    }

    pub fn parse(srs: &str) -> Option<Self> {
        let srs = srs.trim();
        if srs.is_empty() {
            return None;
        }
        match srs.strip_prefix("EPSG:").or_else(|| srs.strip_prefix("epsg:")) {
            Some(code) => code.trim().parse().ok().map(Self::Epsg),
            None => Some(Self::Wkt(srs.to_string())),
        }
    }

    pub fn to_srs_string(&self) -> String {
        match self {
            Self::Epsg(code) => format!("EPSG:{code}"),
            Self::Wkt(wkt) => wkt.clone(),
        }
    }

    /// Geographic (lat/lon) CRS codes fall in the 4000 block.
    pub fn is_geographic(&self) -> bool {
        self.epsg().is_some_and(|code| (4000..5000).contains(&code))
    }
}

/// GDAL persistent auxiliary metadata (`.aux.xml`) restricted to georeferencing.
#[derive(Debug, Clone, PartialEq)]
pub struct Sidecar {
    pub geotransform: GeoTransform,
    pub crs: Option<Crs>,
}

impl Sidecar {
    pub fn new(geotransform: GeoTransform, crs: Option<Crs>) -> Self {
        Self { geotransform, crs }
    }

    pub fn to_xml(&self) -> String {
        let mut xml = String::from("<PAMDataset>\n");
        if let Some(crs) = &self.crs {
            xml.push_str(&format!("  <SRS>{}</SRS>\n", escape_xml(&crs.to_srs_string())));
        }
        xml.push_str(&format!("  <GeoTransform>{}</GeoTransform>\n", self.geotransform));
        xml.push_str("</PAMDataset>\n");
        xml
    }

    /// Reads the dataset-level `<GeoTransform>` and `<SRS>`; attributes such as
    /// `dataAxisToSRSAxisMapping` and per-band elements are ignored.
    pub fn from_xml(xml: &str) -> Option<Self> {
        let document = roxmltree::Document::parse(xml).ok()?;
        let dataset = document.root_element();
        let child_text = |tag: &str| {
            dataset
                .children()
                .find(|n| n.has_tag_name(tag))
                .and_then(|n| n.text())
                .map(str::trim)
        };

        let values: Vec<f64> = child_text("GeoTransform")?
            .split(',')
            .map(|v| v.trim().parse())
            .collect::<std::result::Result<_, _>>()
            .ok()?;
        let geotransform = GeoTransform(values.try_into().ok()?);
        let crs = child_text("SRS").and_then(Crs::parse);
        Some(Self { geotransform, crs })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_xml())
            .map_err(|e| OrthoSegError::filesystem(path, "write sidecar", e))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let xml = fs::read_to_string(path)
            .map_err(|e| OrthoSegError::filesystem(path, "read sidecar", e))?;
        Self::from_xml(&xml).ok_or_else(|| {
            OrthoSegError::raster(path.display(), "parse sidecar", "no valid <GeoTransform>")
        })
    }
}

/// Looks for georeferencing stored beside `image`: a PAM sidecar first, then a world file.
pub fn find_external_georef(image: &Path) -> Result<Option<Sidecar>> {
    let pam = crate::naming::sidecar_path(image);
    if pam.is_file() {
        debug!("Using sidecar {}", pam.display());
        return Sidecar::read(&pam).map(Some);
    }

    for candidate in world_file_candidates(image) {
        if candidate.is_file() {
            debug!("Using world file {}", candidate.display());
            let text = fs::read_to_string(&candidate)
                .map_err(|e| OrthoSegError::filesystem(&candidate, "read world file", e))?;
            let geotransform = GeoTransform::from_world_file(&text).ok_or_else(|| {
                OrthoSegError::raster(candidate.display(), "parse world file", "expected six numbers")
            })?;
            return Ok(Some(Sidecar::new(geotransform, None)));
        }
    }

    Ok(None)
}

/// `ortho.jpg` -> `ortho.jgw`, `ortho.jpgw`, `ortho.wld`
fn world_file_candidates(image: &Path) -> Vec<PathBuf> {
    let ext = image
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();
    let mut candidates = Vec::new();
    if let (Some(first), Some(last)) = (ext.chars().next(), ext.chars().last()) {
        candidates.push(image.with_extension(format!("{first}{last}w")));
    }
    candidates.push(image.with_extension(format!("{ext}w")));
    candidates.push(image.with_extension("wld"));
    candidates
}

pub(crate) fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
