//! Mosaic reassembly from curated label rasters.
//!
//! The virtual mosaic is an index of sources and their destination windows; it is
//! written out as a GDAL VRT and resolved into a single tiled GeoTIFF. Where tiles
//! overlap, candidates are gathered in manifest (sorted key) order and reduced by
//! the chosen [`ResampleAlg`]. The GeoTIFF is resolved one block row at a time and
//! only the sources reaching that band are decoded.

use std::fmt;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ValueEnum;
use image::GrayImage;
use log::{debug, info};
use ndarray::prelude::*;
use rayon::prelude::*;

use crate::errors::{OrthoSegError, Result};
use crate::georef::{escape_xml, Crs, GeoTransform, Sidecar};
use crate::manifest::{MosaicManifest, MANIFEST_FILE};
use crate::naming::TileNameKey;
use crate::raster::write_tiled_geotiff;

pub const MOSAIC_VRT: &str = "Mosaic.vrt";
pub const MOSAIC_TIF: &str = "Mosaic.tif";

/// How a pixel covered by several tiles is resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum ResampleAlg {
    /// The last tile in manifest order wins.
    Nearest,
    /// Most frequent label; ties go to the label seen first.
    #[default]
    Mode,
    Min,
    Max,
    /// Rounded mean of the candidates.
    Average,
    /// Vote weighted by closeness to each tile's centre.
    Gauss,
}

impl fmt::Display for ResampleAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Nearest => "nearest",
            Self::Mode => "mode",
            Self::Min => "min",
            Self::Max => "max",
            Self::Average => "average",
            Self::Gauss => "gauss",
        };
        f.write_str(name)
    }
}

impl FromStr for ResampleAlg {
    type Err = OrthoSegError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "nearest" | "near" => Ok(Self::Nearest),
            "mode" => Ok(Self::Mode),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            "average" | "avg" | "mean" => Ok(Self::Average),
            "gauss" | "gaussian" => Ok(Self::Gauss),
            other => Err(OrthoSegError::Validation {
                field: "resample".to_string(),
                reason: format!("unknown algorithm `{other}`"),
            }),
        }
    }
}

/// Destination window of a source, in mosaic pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DstRect {
    pub x_off: f64,
    pub y_off: f64,
    pub width: f64,
    pub height: f64,
}

impl DstRect {
    fn contains_row(&self, y: f64) -> bool {
        y >= self.y_off && y < self.y_off + self.height
    }

    fn contains_col(&self, x: f64) -> bool {
        x >= self.x_off && x < self.x_off + self.width
    }
}

#[derive(Debug, Clone)]
pub struct MosaicSource {
    pub key: TileNameKey,
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub dst: DstRect,
}

impl MosaicSource {
    /// Source pixel under mosaic pixel centre `(x, y)`.
    fn sample_at(&self, x: f64, y: f64) -> (usize, usize) {
        let col = ((x - self.dst.x_off) * self.width as f64 / self.dst.width) as usize;
        let row = ((y - self.dst.y_off) * self.height as f64 / self.dst.height) as usize;
        (row.min(self.height - 1), col.min(self.width - 1))
    }

    fn centre_weight(&self, row: usize, col: usize) -> f64 {
        let sigma = self.width.max(self.height) as f64 / 4.0;
        let dx = col as f64 + 0.5 - self.width as f64 / 2.0;
        let dy = row as f64 + 0.5 - self.height as f64 / 2.0;
        (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
    }
}

/// Lazy mosaic: extent, placement and sources, no pixels.
#[derive(Debug, Clone)]
pub struct VirtualMosaic {
    pub width: usize,
    pub height: usize,
    pub geotransform: GeoTransform,
    pub crs: Option<Crs>,
    pub sources: Vec<MosaicSource>,
}

/// Fully resolved single-band label mosaic.
#[derive(Debug, Clone)]
pub struct MosaicRaster {
    pub data: Array2<u8>,
    pub geotransform: GeoTransform,
    pub crs: Option<Crs>,
}

impl MosaicRaster {
    pub fn georef(&self) -> Sidecar {
        Sidecar::new(self.geotransform, self.crs.clone())
    }
}

/// Decoded sources for the band being resolved. Sources wholly above the band are
/// released, the ones reaching it are decoded on first use.
struct SourceCache {
    images: Vec<Option<GrayImage>>,
}

impl SourceCache {
    fn new(len: usize) -> Self {
        Self {
            images: vec![None; len],
        }
    }

    fn prepare(&mut self, sources: &[MosaicSource], rows: &Range<usize>) -> Result<()> {
        let (top, bottom) = (rows.start as f64, rows.end as f64);
        let mut wanted = Vec::new();
        for (i, source) in sources.iter().enumerate() {
            let reaches = source.dst.y_off < bottom && source.dst.y_off + source.dst.height > top;
            if !reaches {
                self.images[i] = None;
            } else if self.images[i].is_none() {
                wanted.push(i);
            }
        }

        let loaded: Vec<(usize, GrayImage)> = wanted
            .into_par_iter()
            .map(|i| load_source(&sources[i]).map(|image| (i, image)))
            .collect::<Result<_>>()?;
        for (i, image) in loaded {
            self.images[i] = Some(image);
        }
        Ok(())
    }

    fn resident(&self) -> usize {
        self.images.iter().filter(|i| i.is_some()).count()
    }
}

fn load_source(source: &MosaicSource) -> Result<GrayImage> {
    let image = image::open(&source.path)
        .map_err(|e| OrthoSegError::raster(source.path.display(), "load mosaic source", e))?
        .to_luma8();
    if image.dimensions() != (source.width as u32, source.height as u32) {
        return Err(OrthoSegError::Validation {
            field: "size".to_string(),
            reason: format!(
                "{} is {:?}, manifest says {}x{}",
                source.path.display(),
                image.dimensions(),
                source.width,
                source.height
            ),
        });
    }
    Ok(image)
}

impl VirtualMosaic {
    /// Computes the union extent at the finest source resolution.
    pub fn build(manifest: &MosaicManifest) -> Result<Self> {
        if manifest.is_empty() {
            return Err(OrthoSegError::EmptyMosaic(
                "no curated prediction outputs to mosaic".to_string(),
            ));
        }
        for entry in &manifest.entries {
            let [_, px, rx, _, ry, py] = entry.geotransform.0;
            if !entry.geotransform.is_north_up() || px <= 0.0 || py >= 0.0 {
                return Err(OrthoSegError::Validation {
                    field: "geotransform".to_string(),
                    reason: format!(
                        "{} is not north-up ({px}, {rx}, {ry}, {py})",
                        entry.path.display()
                    ),
                });
            }
            if entry.width == 0 || entry.height == 0 {
                return Err(OrthoSegError::Validation {
                    field: "size".to_string(),
                    reason: format!("{} has no pixels", entry.path.display()),
                });
            }
        }

        let entries = &manifest.entries;
        let px = entries.iter().map(|e| e.geotransform.0[1]).fold(f64::INFINITY, f64::min);
        let py = entries.iter().map(|e| -e.geotransform.0[5]).fold(f64::INFINITY, f64::min);
        let min_x = entries.iter().map(|e| e.geotransform.0[0]).fold(f64::INFINITY, f64::min);
        let max_y = entries.iter().map(|e| e.geotransform.0[3]).fold(f64::NEG_INFINITY, f64::max);
        let max_x = entries
            .iter()
            .map(|e| e.geotransform.0[0] + e.width as f64 * e.geotransform.0[1])
            .fold(f64::NEG_INFINITY, f64::max);
        let min_y = entries
            .iter()
            .map(|e| e.geotransform.0[3] + e.height as f64 * e.geotransform.0[5])
            .fold(f64::INFINITY, f64::min);

        let width = ((max_x - min_x) / px).round().max(1.0) as usize;
        let height = ((max_y - min_y) / py).round().max(1.0) as usize;

        let sources = entries
            .iter()
            .map(|e| {
                let [x0, sx, _, y0, _, sy] = e.geotransform.0;
                MosaicSource {
                    key: e.key.clone(),
                    path: e.path.clone(),
                    width: e.width,
                    height: e.height,
                    dst: DstRect {
                        x_off: (x0 - min_x) / px,
                        y_off: (max_y - y0) / py,
                        width: e.width as f64 * sx / px,
                        height: e.height as f64 * -sy / py,
                    },
                }
            })
            .collect();

        debug!("Virtual mosaic {width}x{height} from {} source(s)", entries.len());
        Ok(Self {
            width,
            height,
            geotransform: GeoTransform([min_x, px, 0.0, max_y, 0.0, -py]),
            crs: manifest.crs.clone(),
            sources,
        })
    }

    pub fn georef(&self) -> Sidecar {
        Sidecar::new(self.geotransform, self.crs.clone())
    }

    /// Writes a GDAL VRT with one `SimpleSource` per tile in manifest order.
    ///
    /// GDAL composites a VRT in painter's order (the last source wins), so the VRT
    /// matches `Mosaic.tif` only under [`ResampleAlg::Nearest`]. The overlap policy
    /// used for the GeoTIFF is recorded in the `OVERLAP_RESOLUTION` metadata item.
    pub fn write_vrt(&self, path: &Path, alg: ResampleAlg) -> Result<()> {
        let base = path.parent().unwrap_or_else(|| Path::new(""));
        let mut xml = format!(
            "<VRTDataset rasterXSize=\"{}\" rasterYSize=\"{}\">\n",
            self.width, self.height
        );
        if let Some(crs) = &self.crs {
            xml.push_str(&format!("  <SRS>{}</SRS>\n", escape_xml(&crs.to_srs_string())));
        }
        xml.push_str(&format!("  <GeoTransform>{}</GeoTransform>\n", self.geotransform));
        xml.push_str("  <Metadata>\n");
        xml.push_str(&format!("    <MDI key=\"OVERLAP_RESOLUTION\">{alg}</MDI>\n"));
        xml.push_str("  </Metadata>\n");
        xml.push_str("  <VRTRasterBand dataType=\"Byte\" band=\"1\">\n");
        xml.push_str("    <NoDataValue>0</NoDataValue>\n");
        for source in &self.sources {
            let (name, relative) = match source.path.strip_prefix(base) {
                Ok(rel) => (rel.to_string_lossy().replace('\\', "/"), 1),
                Err(_) => (source.path.to_string_lossy().into_owned(), 0),
            };
            let dst = &source.dst;
            xml.push_str(&format!(
                "    <SimpleSource>\n\
                 \x20     <SourceFilename relativeToVRT=\"{relative}\">{}</SourceFilename>\n\
                 \x20     <SourceBand>1</SourceBand>\n\
                 \x20     <SourceProperties RasterXSize=\"{w}\" RasterYSize=\"{h}\" DataType=\"Byte\" BlockXSize=\"{w}\" BlockYSize=\"1\"/>\n\
                 \x20     <SrcRect xOff=\"0\" yOff=\"0\" xSize=\"{w}\" ySize=\"{h}\"/>\n\
                 \x20     <DstRect xOff=\"{}\" yOff=\"{}\" xSize=\"{}\" ySize=\"{}\"/>\n\
                 \x20   </SimpleSource>\n",
                escape_xml(&name),
                dst.x_off,
                dst.y_off,
                dst.width,
                dst.height,
                w = source.width,
                h = source.height,
            ));
        }
        xml.push_str("  </VRTRasterBand>\n</VRTDataset>\n");
        fs::write(path, xml).map_err(|e| OrthoSegError::filesystem(path, "write VRT", e))
    }

    /// Resolves the whole mosaic in memory, row by row in parallel.
    ///
    /// Pixels no tile covers are 0.
    pub fn materialize(&self, alg: ResampleAlg) -> Result<MosaicRaster> {
        let mut cache = SourceCache::new(self.sources.len());
        let data = self.resolve_band(0..self.height, &mut cache, alg)?;
        Ok(MosaicRaster {
            data,
            geotransform: self.geotransform,
            crs: self.crs.clone(),
        })
    }

    /// Resolves and writes the mosaic as a tiled GeoTIFF, one block row at a time.
    pub fn write_geotiff(&self, path: &Path, alg: ResampleAlg) -> Result<()> {
        let mut cache = SourceCache::new(self.sources.len());
        write_tiled_geotiff(path, self.width, self.height, &self.georef(), |rows| {
            self.resolve_band(rows, &mut cache, alg)
        })
    }

    fn resolve_band(
        &self,
        rows: Range<usize>,
        cache: &mut SourceCache,
        alg: ResampleAlg,
    ) -> Result<Array2<u8>> {
        cache.prepare(&self.sources, &rows)?;
        debug!("Resolving rows {rows:?} with {} decoded source(s)", cache.resident());
        let images = &cache.images;
        let band: Vec<Vec<u8>> = rows
            .clone()
            .into_par_iter()
            .map(|row| self.resolve_row(row, images, alg))
            .collect();
        Ok(Array2::from_shape_vec((rows.len(), self.width), band.concat())?)
    }

    fn resolve_row(&self, row: usize, images: &[Option<GrayImage>], alg: ResampleAlg) -> Vec<u8> {
        let y = row as f64 + 0.5;
        let covering: Vec<(&MosaicSource, &GrayImage)> = self
            .sources
            .iter()
            .zip(images)
            .filter(|(s, _)| s.dst.contains_row(y))
            .filter_map(|(s, image)| image.as_ref().map(|image| (s, image)))
            .collect();

        let mut candidates = Vec::with_capacity(covering.len());
        (0..self.width)
            .map(|col| {
                let x = col as f64 + 0.5;
                candidates.clear();
                for (source, image) in &covering {
                    if !source.dst.contains_col(x) {
                        continue;
                    }
                    let (r, c) = source.sample_at(x, y);
                    let value = image.get_pixel(c as u32, r as u32).0[0];
                    let weight = match alg {
                        ResampleAlg::Gauss => source.centre_weight(r, c),
                        _ => 1.0,
                    };
                    candidates.push((value, weight));
                }
                resolve(alg, &candidates)
            })
            .collect()
    }
}

/// Reduces the candidates for one pixel, given in manifest order.
pub fn resolve(alg: ResampleAlg, candidates: &[(u8, f64)]) -> u8 {
    let Some(&(last, _)) = candidates.last() else {
        return 0;
    };
    match alg {
        ResampleAlg::Nearest => last,
        ResampleAlg::Min => candidates.iter().map(|c| c.0).min().unwrap_or(0),
        ResampleAlg::Max => candidates.iter().map(|c| c.0).max().unwrap_or(0),
        ResampleAlg::Average => {
            let sum: u32 = candidates.iter().map(|c| u32::from(c.0)).sum();
            let n = candidates.len() as u32;
            ((sum + n / 2) / n) as u8
        }
        ResampleAlg::Mode | ResampleAlg::Gauss => {
            // Tallies stay in first-seen order so a strict comparison keeps the earliest.
            let mut tallies: Vec<(u8, f64)> = Vec::new();
            for &(value, weight) in candidates {
                match tallies.iter_mut().find(|t| t.0 == value) {
                    Some(t) => t.1 += weight,
                    None => tallies.push((value, weight)),
                }
            }
            let mut best = tallies[0];
            for &t in &tallies[1..] {
                if t.1 > best.1 {
                    best = t;
                }
            }
            best.0
        }
    }
}

/// Paths of the two mosaic products.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MosaicPaths {
    pub vrt: PathBuf,
    pub tif: PathBuf,
}

/// Builds `Mosaic.vrt` and `Mosaic.tif` in `input_dir` from the manifest in `out_dir`.
pub fn reassemble(out_dir: &Path, input_dir: &Path, alg: ResampleAlg) -> Result<MosaicPaths> {
    if !out_dir.join(MANIFEST_FILE).is_file() {
        return Err(OrthoSegError::EmptyMosaic(format!(
            "no {} in {}; curate the predictions first",
            MANIFEST_FILE,
            out_dir.display()
        )));
    }
    let manifest = MosaicManifest::load(out_dir)?;
    let mosaic = VirtualMosaic::build(&manifest)?;

    let paths = MosaicPaths {
        vrt: input_dir.join(MOSAIC_VRT),
        tif: input_dir.join(MOSAIC_TIF),
    };
    mosaic.write_vrt(&paths.vrt, alg)?;
    info!(
        "Wrote {} ({}x{}, {} source(s), {alg})",
        paths.vrt.display(),
        mosaic.width,
        mosaic.height,
        mosaic.sources.len()
    );

    mosaic.write_geotiff(&paths.tif, alg)?;
    info!("Wrote {}", paths.tif.display());
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{GeorefSource, ManifestEntry};
    use crate::raster::SourceRaster;
    use image::Luma;
    use tempfile::TempDir;

    /// Writes a constant 4x4 label tile whose top-left corner is at `(x, y)`.
    fn entry(dir: &Path, col: u32, value: u8, x: f64, y: f64) -> Result<ManifestEntry> {
        let key = TileNameKey::new("t", 1, col);
        let path = dir.join(key.curated_file_name());
        GrayImage::from_pixel(4, 4, Luma([value])).save(&path)?;
        Ok(ManifestEntry {
            key,
            path,
            width: 4,
            height: 4,
            geotransform: GeoTransform([x, 1.0, 0.0, y, 0.0, -1.0]),
            georef: GeorefSource::Sidecar,
        })
    }

    #[test]
    fn test_resolve_policies() {
        let c = [(2, 1.0), (5, 1.0), (5, 1.0), (2, 1.0), (7, 1.0)];
        assert_eq!(resolve(ResampleAlg::Mode, &c), 2);
        assert_eq!(resolve(ResampleAlg::Nearest, &c), 7);
        assert_eq!(resolve(ResampleAlg::Min, &c), 2);
        assert_eq!(resolve(ResampleAlg::Max, &c), 7);
        assert_eq!(resolve(ResampleAlg::Average, &c), 4);
        assert_eq!(resolve(ResampleAlg::Gauss, &[(1, 0.2), (3, 0.9)]), 3);
        assert_eq!(resolve(ResampleAlg::Mode, &[]), 0);
    }

    #[test]
    fn test_parse_algorithm() {
        assert_eq!("MODE".parse::<ResampleAlg>().unwrap(), ResampleAlg::Mode);
        assert_eq!("near".parse::<ResampleAlg>().unwrap(), ResampleAlg::Nearest);
        assert!("cubic".parse::<ResampleAlg>().is_err());
        assert_eq!(ResampleAlg::default(), ResampleAlg::Mode);
    }

    #[test]
    fn test_build_union_extent() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = MosaicManifest::new(
            None,
            vec![entry(dir.path(), 1, 1, 10.0, 20.0)?, entry(dir.path(), 2, 1, 12.0, 18.0)?],
        )?;
        let mosaic = VirtualMosaic::build(&manifest)?;
        assert_eq!((mosaic.width, mosaic.height), (6, 6));
        assert_eq!(mosaic.geotransform, GeoTransform([10.0, 1.0, 0.0, 20.0, 0.0, -1.0]));
        assert_eq!(mosaic.sources[1].dst, DstRect { x_off: 2.0, y_off: 2.0, width: 4.0, height: 4.0 });
        Ok(())
    }

    #[test]
    fn test_majority_wins_overlap() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = MosaicManifest::new(
            None,
            vec![
                entry(dir.path(), 1, 3, 0.0, 4.0)?,
                entry(dir.path(), 2, 3, 0.0, 4.0)?,
                entry(dir.path(), 3, 9, 0.0, 4.0)?,
                entry(dir.path(), 4, 3, 0.0, 4.0)?,
            ],
        )?;
        let raster = VirtualMosaic::build(&manifest)?.materialize(ResampleAlg::Mode)?;
        assert!(raster.data.iter().all(|&v| v == 3));
        Ok(())
    }

    #[test]
    fn test_tie_break_and_uncovered_pixels() -> Result<()> {
        let dir = TempDir::new()?;
        // Two tiles overlapping by two columns, with a gap row below the second.
        let manifest = MosaicManifest::new(
            None,
            vec![entry(dir.path(), 1, 4, 0.0, 6.0)?, entry(dir.path(), 2, 8, 2.0, 6.0)?],
        )?;
        let mosaic = VirtualMosaic::build(&manifest)?;
        assert_eq!((mosaic.width, mosaic.height), (6, 4));

        let mode = mosaic.materialize(ResampleAlg::Mode)?;
        assert_eq!(mode.data.row(0).to_vec(), vec![4, 4, 4, 4, 8, 8]);
        let nearest = mosaic.materialize(ResampleAlg::Nearest)?;
        assert_eq!(nearest.data.row(0).to_vec(), vec![4, 4, 8, 8, 8, 8]);
        let average = mosaic.materialize(ResampleAlg::Average)?;
        assert_eq!(average.data.row(0).to_vec(), vec![4, 4, 6, 6, 8, 8]);
        let gauss = mosaic.materialize(ResampleAlg::Gauss)?;
        assert_eq!(gauss.data.row(0).to_vec(), vec![4, 4, 4, 8, 8, 8]);

        let gap = MosaicManifest::new(
            None,
            vec![entry(dir.path(), 1, 4, 0.0, 8.0)?, entry(dir.path(), 2, 8, 4.0, 4.0)?],
        )?;
        let raster = VirtualMosaic::build(&gap)?.materialize(ResampleAlg::Mode)?;
        assert_eq!(raster.data.dim(), (8, 8));
        assert_eq!(raster.data[[0, 7]], 0);
        assert_eq!(raster.data[[7, 0]], 0);
        assert_eq!(raster.data[[7, 7]], 8);
        Ok(())
    }

    /// Constant `size`x`size` label tile with 1 m pixels at `(x, y)`.
    fn block_entry(dir: &Path, row: u32, size: u32, value: u8, x: f64, y: f64) -> Result<ManifestEntry> {
        let key = TileNameKey::new("b", row, 1);
        let path = dir.join(key.curated_file_name());
        GrayImage::from_pixel(size, size, Luma([value])).save(&path)?;
        Ok(ManifestEntry {
            key,
            path,
            width: size as usize,
            height: size as usize,
            geotransform: GeoTransform([x, 1.0, 0.0, y, 0.0, -1.0]),
            georef: GeorefSource::Sidecar,
        })
    }

    #[test]
    fn test_banded_geotiff_matches_in_memory_mosaic() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = MosaicManifest::new(
            None,
            vec![
                block_entry(dir.path(), 1, 200, 3, 0.0, 400.0)?,
                block_entry(dir.path(), 2, 200, 7, 0.0, 250.0)?,
                block_entry(dir.path(), 3, 200, 7, 0.0, 100.0)?,
            ],
        )?;
        let mosaic = VirtualMosaic::build(&manifest)?;
        assert_eq!((mosaic.width, mosaic.height), (200, 500));

        let in_memory = mosaic.materialize(ResampleAlg::Mode)?;
        let path = dir.path().join(MOSAIC_TIF);
        mosaic.write_geotiff(&path, ResampleAlg::Mode)?;
        let written = SourceRaster::open(&path)?;
        assert_eq!(written.data.index_axis(Axis(2), 0), in_memory.data);
        assert_eq!(written.data[[0, 0, 0]], 3);
        assert_eq!(written.data[[499, 0, 0]], 7);
        Ok(())
    }

    #[test]
    fn test_band_decodes_only_reaching_sources() -> Result<()> {
        let dir = TempDir::new()?;
        let manifest = MosaicManifest::new(
            None,
            vec![
                block_entry(dir.path(), 1, 200, 3, 0.0, 400.0)?,
                block_entry(dir.path(), 2, 200, 7, 0.0, 200.0)?,
            ],
        )?;
        let mosaic = VirtualMosaic::build(&manifest)?;
        let mut cache = SourceCache::new(mosaic.sources.len());

        let top = mosaic.resolve_band(0..100, &mut cache, ResampleAlg::Mode)?;
        assert!(top.iter().all(|&v| v == 3));
        assert!(cache.images[0].is_some() && cache.images[1].is_none());

        let bottom = mosaic.resolve_band(300..400, &mut cache, ResampleAlg::Mode)?;
        assert!(bottom.iter().all(|&v| v == 7));
        assert!(cache.images[0].is_none() && cache.images[1].is_some());
        Ok(())
    }

    #[test]
    fn test_rotated_and_empty_rejected() -> Result<()> {
        assert!(matches!(
            VirtualMosaic::build(&MosaicManifest::default()),
            Err(OrthoSegError::EmptyMosaic(_))
        ));
        let dir = TempDir::new()?;
        let mut rotated = entry(dir.path(), 1, 1, 0.0, 4.0)?;
        rotated.geotransform.0[2] = 0.1;
        assert!(VirtualMosaic::build(&MosaicManifest::new(None, vec![rotated])?).is_err());
        Ok(())
    }

    #[test]
    fn test_reassemble_writes_vrt_and_geotiff() -> Result<()> {
        let dir = TempDir::new()?;
        let out = dir.path().join("tiles").join("out");
        fs::create_dir_all(&out)?;
        assert!(matches!(
            reassemble(&out, dir.path(), ResampleAlg::Mode),
            Err(OrthoSegError::EmptyMosaic(_))
        ));

        let manifest = MosaicManifest::new(
            Some(Crs::Epsg(32610)),
            vec![entry(&out, 1, 2, 100.0, 50.0)?, entry(&out, 2, 5, 104.0, 50.0)?],
        )?;
        manifest.save(&out)?;
        let paths = reassemble(&out, dir.path(), ResampleAlg::Mode)?;

        let vrt = fs::read_to_string(&paths.vrt)?;
        assert!(vrt.contains("rasterXSize=\"8\""));
        assert!(vrt.contains("tiles/out/t_001_002.png"));
        assert_eq!(vrt.matches("<SimpleSource>").count(), 2);
        assert!(!vrt.contains("resampling="));
        assert!(vrt.contains("<MDI key=\"OVERLAP_RESOLUTION\">mode</MDI>"));

        let raster = SourceRaster::open(&paths.tif)?;
        assert_eq!((raster.width(), raster.height(), raster.bands()), (8, 4, 1));
        assert_eq!(raster.data[[0, 0, 0]], 2);
        assert_eq!(raster.data[[3, 7, 0]], 5);
        assert_eq!(raster.geotransform, GeoTransform([100.0, 1.0, 0.0, 50.0, 0.0, -1.0]));
        assert_eq!(raster.crs, Some(Crs::Epsg(32610)));
        Ok(())
    }
}
