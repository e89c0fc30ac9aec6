use std::path::{Path, PathBuf};

use anyhow::{bail, ensure, Context, Result};
use log::{info, LevelFilter};
use rayon::ThreadPoolBuilder;

use ortho_seg_rs::config::{Command, Config, RunArgs};
use ortho_seg_rs::pipeline::{finish_mosaic, load_models, prepare_tiles, Layout, Pipeline, DEFAULT_TILE_SIZE};
use ortho_seg_rs::zoo::{download_release, weights_list, ModelChoice, ReleaseId, ZenodoArchive, CATALOG};
use ortho_seg_rs::{EnsembleRunner, PredictionSettings, SegmentationModel};

fn main() -> Result<()> {
    let config = Config::new();
    env_logger::Builder::new()
        .filter_level(if config.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        })
        .parse_default_env()
        .init();

    match config.command {
        Command::List => {
            for task in CATALOG {
                println!("{}", task.name);
                for release in task.releases {
                    let marker = if *release == task.default_release { " (default)" } else { "" };
                    println!("  {release}{marker}");
                }
            }
        }
        Command::Fetch { release, models } => {
            let dir = fetch(&release, models.choice(), &models.models_root)?;
            println!("{}", dir.display());
        }
        Command::Tile { input, tiling } => {
            let layout = Layout::new(&input);
            let (index, report) = prepare_tiles(&layout, &tiling.options(DEFAULT_TILE_SIZE))?;
            info!(
                "{} tile(s) in {}, {} transcode failure(s)",
                index.tiles.len(),
                layout.tiles_dir.display(),
                report.failures.len()
            );
        }
        Command::Mosaic { input, resample } => {
            let layout = Layout::new(&input);
            let (_, paths) = finish_mosaic(&layout, resample)?;
            println!("{}", paths.tif.display());
        }
        Command::Run(args) => run(args)?,
    }
    Ok(())
}

fn model_dir(args: &RunArgs) -> Result<PathBuf> {
    match (&args.models, &args.release) {
        (Some(dir), _) => {
            ensure!(dir.is_dir(), "Model directory does not exist: {}", dir.display());
            Ok(dir.clone())
        }
        (None, Some(release)) => fetch(release, args.model_args.choice(), &args.model_args.models_root),
        (None, None) => bail!("Either --models or --release is required"),
    }
}

fn fetch(release: &ReleaseId, choice: ModelChoice, root: &Path) -> Result<PathBuf> {
    download_release(&ZenodoArchive::default(), release, choice, root)
        .with_context(|| format!("Failed to fetch release {release}"))
}

fn run(args: RunArgs) -> Result<()> {
    ensure!(args.input.is_file(), "Input raster does not exist: {}", args.input.display());
    ThreadPoolBuilder::new()
        .num_threads(args.threads)
        .build_global()?;

    let dir = model_dir(&args)?;
    let weights = weights_list(args.model_args.choice(), &dir)?;
    let models = load_models(&weights).context("Failed to load models")?;
    let first = models
        .first()
        .map(|m| m.config().clone())
        .context("No models loaded")?;

    let settings = PredictionSettings::from_config(&first, args.profile);
    let runner = EnsembleRunner::new(models, settings)?;
    let tiling = args.tiling.options(first.target_size[0] as usize);

    let summary = Pipeline::new(runner, tiling, args.resample).run(&args.input)?;
    println!("{}", summary.mosaic.tif.display());
    Ok(())
}
