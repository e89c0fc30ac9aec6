//! Stage orchestration over the on-disk layout:
//!
//! ```text
//! <input_dir>/<ortho>.tif
//! <input_dir>/tiles/{key}.jpg(.aux.xml), tiles.json
//! <input_dir>/tiles/out/{key}.png(.aux.xml), manifest.json
//! <input_dir>/Mosaic.vrt, Mosaic.tif
//! ```

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::curate::{curate_outputs, CurationReport};
use crate::errors::{OrthoSegError, Result, TileFailure};
use crate::manifest::TileIndex;
use crate::model::OnnxModel;
use crate::model_config::ModelConfig;
use crate::mosaic::{reassemble, MosaicPaths, ResampleAlg};
use crate::normalize::{normalize_tiles, NormalizeReport, DEFAULT_JPEG_QUALITY};
use crate::predict::{predict_directory, PredictReport};
use crate::raster::SourceRaster;
use crate::tiling::{split_raster, TileGrid};
use crate::traits::TilePredictor;
use crate::zoo::config_path_for;

pub const TILES_DIR: &str = "tiles";
pub const OUTPUT_DIR: &str = "out";
pub const DEFAULT_TILE_SIZE: usize = 768;

/// Directories derived from the input raster's location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub input: PathBuf,
    pub input_dir: PathBuf,
    pub tiles_dir: PathBuf,
    pub out_dir: PathBuf,
}

impl Layout {
    pub fn new(input: &Path) -> Self {
        let input_dir = input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let tiles_dir = input_dir.join(TILES_DIR);
        let out_dir = tiles_dir.join(OUTPUT_DIR);
        Self {
            input: input.to_path_buf(),
            input_dir,
            tiles_dir,
            out_dir,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilingOptions {
    pub tile_size: usize,
    /// Defaults to half the tile size.
    pub overlap: Option<usize>,
    pub jpeg_quality: u8,
}

impl Default for TilingOptions {
    fn default() -> Self {
        Self {
            tile_size: DEFAULT_TILE_SIZE,
            overlap: None,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

/// Splits the input raster and transcodes the tiles for the predictor.
pub fn prepare_tiles(layout: &Layout, options: &TilingOptions) -> Result<(TileIndex, NormalizeReport)> {
    if !layout.input.is_file() {
        return Err(OrthoSegError::NoInput(format!(
            "input raster {} does not exist",
            layout.input.display()
        )));
    }
    let source = SourceRaster::open(&layout.input)?;
    info!(
        "Source {}: {}x{} px, {} band(s), {:?}",
        layout.input.display(),
        source.width(),
        source.height(),
        source.bands(),
        source.pixel_type
    );

    let overlap = options.overlap.unwrap_or(options.tile_size / 2);
    let grid = TileGrid::new(source.width(), source.height(), options.tile_size, overlap)?;
    let index = split_raster(&source, &layout.input, &layout.tiles_dir, &grid)?;
    let normalized = normalize_tiles(&layout.tiles_dir, options.jpeg_quality)?;
    Ok((index, normalized))
}

/// Curates predictions and builds both mosaic products.
pub fn finish_mosaic(layout: &Layout, alg: ResampleAlg) -> Result<(CurationReport, MosaicPaths)> {
    let curation = curate_outputs(&layout.tiles_dir, &layout.out_dir)?;
    let paths = reassemble(&layout.out_dir, &layout.input_dir, alg)?;
    Ok((curation, paths))
}

/// Loads each weights file with the configuration next to it.
pub fn load_models(weights: &[PathBuf]) -> Result<Vec<OnnxModel>> {
    weights
        .iter()
        .map(|w| {
            let config = ModelConfig::load(&config_path_for(w))?;
            let device = config.device()?;
            OnnxModel::new(w, config, device)
        })
        .collect()
}

/// What a full run did, stage by stage.
#[derive(Debug)]
pub struct RunSummary {
    pub tiles: usize,
    pub normalize: NormalizeReport,
    pub predict: PredictReport,
    pub curation: CurationReport,
    pub mosaic: MosaicPaths,
}

impl RunSummary {
    /// Per-tile failures from every stage, in stage order.
    pub fn failures(&self) -> impl Iterator<Item = &TileFailure> {
        self.normalize
            .failures
            .iter()
            .chain(&self.predict.failures)
            .chain(&self.curation.flagged)
    }
}

/// Split, normalize, predict, curate and mosaic one orthomosaic.
pub struct Pipeline<P: TilePredictor> {
    predictor: P,
    tiling: TilingOptions,
    resample: ResampleAlg,
}

impl<P: TilePredictor> Pipeline<P> {
    pub fn new(predictor: P, tiling: TilingOptions, resample: ResampleAlg) -> Self {
        Self {
            predictor,
            tiling,
            resample,
        }
    }

    pub fn run(&self, input: &Path) -> Result<RunSummary> {
        let layout = Layout::new(input);
        let (index, normalize) = prepare_tiles(&layout, &self.tiling)?;
        let predict = predict_directory(&self.predictor, &layout.tiles_dir, &layout.out_dir)?;
        let (curation, mosaic) = finish_mosaic(&layout, self.resample)?;

        let summary = RunSummary {
            tiles: index.tiles.len(),
            normalize,
            predict,
            curation,
            mosaic,
        };
        for failure in summary.failures() {
            warn!("{failure}");
        }
        info!(
            "{} tile(s): {} normalized, {} predicted, {} in mosaic, {} failure(s) -> {}",
            summary.tiles,
            summary.normalize.converted.len(),
            summary.predict.predicted,
            summary.curation.manifest.len(),
            summary.failures().count(),
            summary.mosaic.tif.display()
        );
        Ok(summary)
    }
}
