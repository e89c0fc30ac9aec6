use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::mosaic::ResampleAlg;
use crate::normalize::DEFAULT_JPEG_QUALITY;
use crate::pipeline::TilingOptions;
use crate::predict::OutputProfile;
use crate::zoo::{ModelChoice, ReleaseId};

#[derive(Parser, Clone, Debug)]
#[command(version, about = "Segment a georeferenced orthomosaic tile by tile", long_about = None)]
pub struct Config {
    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    pub fn new() -> Self {
        Self::parse()
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Print the tasks and model releases that can be fetched.
    List,

    /// Download a model release.
    Fetch {
        #[arg(short, long, value_parser = parse_release)]
        release: ReleaseId,

        #[command(flatten)]
        models: ModelArgs,
    },

    /// Split the orthomosaic into georeferenced JPEG tiles.
    Tile {
        #[arg(short, long)]
        input: PathBuf,

        #[command(flatten)]
        tiling: TilingArgs,
    },

    /// Curate predictions under `tiles/out` and build the mosaic.
    Mosaic {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long, value_enum, default_value_t = ResampleAlg::Mode)]
        resample: ResampleAlg,
    },

    /// Run every stage: tile, predict, curate, mosaic.
    Run(RunArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ModelArgs {
    /// Fetch every model of the release instead of the best one.
    #[arg(short, long)]
    pub ensemble: bool,

    #[arg(long, default_value = "downloaded_models")]
    pub models_root: PathBuf,
}

impl ModelArgs {
    pub fn choice(&self) -> ModelChoice {
        if self.ensemble {
            ModelChoice::Ensemble
        } else {
            ModelChoice::Best
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct TilingArgs {
    /// Tile edge in pixels; defaults to the model's TARGET_SIZE, or 768.
    #[arg(long)]
    pub tile_size: Option<usize>,

    /// Overlap between neighbouring tiles; defaults to half the tile size.
    #[arg(long)]
    pub overlap: Option<usize>,

    #[arg(long, default_value_t = DEFAULT_JPEG_QUALITY, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub jpeg_quality: u8,
}

impl TilingArgs {
    pub fn options(&self, default_tile_size: usize) -> TilingOptions {
        TilingOptions {
            tile_size: self.tile_size.unwrap_or(default_tile_size),
            overlap: self.overlap,
            jpeg_quality: self.jpeg_quality,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[arg(short, long)]
    pub input: PathBuf,

    /// Directory holding `*.onnx` weights with their `.json` configs.
    #[arg(short, long, conflicts_with = "release", required_unless_present = "release")]
    pub models: Option<PathBuf>,

    /// Release to download (if needed) and use.
    #[arg(long, value_parser = parse_release)]
    pub release: Option<ReleaseId>,

    #[command(flatten)]
    pub model_args: ModelArgs,

    #[command(flatten)]
    pub tiling: TilingArgs,

    #[arg(short, long, value_enum, default_value_t = ResampleAlg::Mode)]
    pub resample: ResampleAlg,

    #[arg(short, long, value_enum, default_value_t = OutputProfile::Meta)]
    pub profile: OutputProfile,

    #[arg(
        short, long, default_value_t = std::thread::available_parallelism().map_or(1, |n| n.get())
    )]
    pub threads: usize,
}

fn parse_release(s: &str) -> Result<ReleaseId, String> {
    s.parse().map_err(|e: crate::errors::OrthoSegError| e.to_string())
}
