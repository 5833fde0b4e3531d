//! serverkit: run image-analysis algorithms on a local image, whole, as a
//! stream, or split into tiles, and export the merged layers.
//!
//! # Usage
//!
//! ```text
//! serverkit list
//! serverkit schema threshold
//! serverkit run threshold --input cells.png --param threshold=90 \
//!     --tiled --tile-size 64 --overlap 0.25 --output-dir out/
//! ```
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

#![allow(clippy::print_stdout, clippy::print_stderr)]

mod algorithms;
mod display;
mod error;
mod logging;

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use serverkit_core::{LayerData, LayerKind, Raster, TilingConfig};
use serverkit_runtime::{AlgorithmRegistry, LogStatus, Pumped, TaskOutcome, Workbench};
use tracing::info;

use crate::display::{ConsoleDisplay, LogProgress, export_layer};
use crate::error::CliError;

/// Name the input image is imported under.
const INPUT_LAYER: &str = "input";

/// Run serverkit algorithms locally.
#[derive(Parser)]
#[command(name = "serverkit", version)]
struct Cli {
    /// Log at debug level unless `RUST_LOG` is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the built-in algorithms.
    List,
    /// Print an algorithm's parameter schema as JSON.
    Schema {
        /// Algorithm name.
        algorithm: String,
    },
    /// Run an algorithm on an image.
    Run(RunArgs),
}

#[derive(clap::Args)]
struct RunArgs {
    /// Algorithm name.
    algorithm: String,

    /// Input image (PNG, JPEG, BMP, WebP, TIFF), converted to grayscale.
    #[arg(short, long)]
    input: PathBuf,

    /// Parameter override. The value is parsed as JSON, falling back to a
    /// plain string. The image parameter defaults to the input layer.
    #[arg(short, long = "param", value_name = "KEY=VALUE")]
    params: Vec<String>,

    /// Split the input into tiles and merge the per-tile results.
    #[arg(long)]
    tiled: bool,

    /// Tile edge length in pixels.
    #[arg(long, default_value_t = TilingConfig::DEFAULT_TILE_SIZE_PX)]
    tile_size: usize,

    /// Fraction of a tile shared with its neighbour, in `[0, 1)`.
    #[arg(long, default_value_t = TilingConfig::DEFAULT_OVERLAP)]
    overlap: f64,

    /// Pause before each tile after the first, in seconds.
    #[arg(long, default_value_t = 0.0)]
    delay: f64,

    /// Visit tiles in random order.
    #[arg(long)]
    randomize: bool,

    /// Full tiling config as a JSON string.
    ///
    /// Implies `--tiled`; the other tiling flags are ignored.
    #[arg(long)]
    tiling_json: Option<String>,

    /// Cancel the run after this many batches have arrived.
    #[arg(long, value_name = "N")]
    cancel_after: Option<usize>,

    /// Directory to export result layers to.
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

/// Split `key=value`, parsing the value as JSON when possible.
fn parse_param(raw: &str) -> Result<(String, Value), CliError> {
    let (key, value) = raw
        .split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| CliError::InvalidParam(raw.to_owned()))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_owned()));
    Ok((key.to_owned(), value))
}

/// Build the tiling config, or `None` for an untiled run.
fn tiling_from_args(args: &RunArgs) -> Result<Option<TilingConfig>, CliError> {
    if let Some(ref json) = args.tiling_json {
        let config: TilingConfig = serde_json::from_str(json)?;
        config.validate()?;
        return Ok(Some(config));
    }
    if !args.tiled {
        return Ok(None);
    }
    let config = TilingConfig {
        tile_size_px: args.tile_size,
        overlap: args.overlap,
        randomize: args.randomize,
        ..TilingConfig::default()
    }
    .with_delay_secs(args.delay)?;
    config.validate()?;
    Ok(Some(config))
}

fn list(registry: &AlgorithmRegistry) {
    for algorithm in registry.iter() {
        let mode = if algorithm.is_stream() { " (stream)" } else { "" };
        println!("{:<16} {}{mode}", algorithm.name(), algorithm.description());
    }
}

fn schema(registry: &AlgorithmRegistry, name: &str) -> Result<(), CliError> {
    let algorithm = registry
        .get(name)
        .ok_or_else(|| CliError::UnknownAlgorithm(name.to_owned()))?;
    println!("{}", serde_json::to_string_pretty(&algorithm.parameters())?);
    Ok(())
}

async fn run(registry: &AlgorithmRegistry, args: RunArgs) -> Result<ExitCode, CliError> {
    let algorithm = registry
        .get(&args.algorithm)
        .ok_or_else(|| CliError::UnknownAlgorithm(args.algorithm.clone()))?;
    let tiling = tiling_from_args(&args)?;

    let mut overrides = Map::new();
    for raw in &args.params {
        let (key, value) = parse_param(raw)?;
        overrides.insert(key, value);
    }
    let parameters = algorithm.parameters();
    if let Some(image) = parameters.image_parameter() {
        overrides
            .entry(image.to_owned())
            .or_insert_with(|| Value::from(INPUT_LAYER));
    }

    let image = image::open(&args.input)?.to_luma8();
    info!(
        path = %args.input.display(),
        width = image.width(),
        height = image.height(),
        "loaded input"
    );

    let mut bench = Workbench::new(Box::new(LogStatus), Arc::new(LogProgress))?;
    bench.subscribe(Box::new(ConsoleDisplay::default()));
    bench.import_layer(
        LayerKind::Raster,
        LayerData::Raster(Raster::from_gray_image(&image)),
        INPUT_LAYER,
    )?;

    let id = bench.run(algorithm, &overrides, tiling.as_ref())?;
    let mut batches = 0;
    let mut outcome = None;
    while let Some(event) = bench.pump_next().await {
        match event {
            Pumped::Yielded(_) => {
                batches += 1;
                if args.cancel_after == Some(batches) {
                    info!(task = %id, batches, "cancelling run");
                    bench.cancel(id);
                }
            }
            Pumped::Finished(_, finished) => outcome = Some(finished),
        }
    }

    if let Some(ref dir) = args.output_dir {
        fs::create_dir_all(dir).map_err(|source| CliError::Write {
            path: dir.clone(),
            source,
        })?;
        for layer in bench.store().iter().filter(|layer| layer.name != INPUT_LAYER) {
            export_layer(layer, dir)?;
        }
    }

    Ok(match outcome {
        Some(TaskOutcome::Failed(_)) => ExitCode::FAILURE,
        _ => ExitCode::SUCCESS,
    })
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init(cli.verbose) {
        eprintln!("Error initialising logging: {e}");
        return ExitCode::FAILURE;
    }

    let registry = algorithms::builtin();
    let result = match cli.command {
        Command::List => {
            list(&registry);
            Ok(ExitCode::SUCCESS)
        }
        Command::Schema { algorithm } => schema(&registry, &algorithm).map(|()| ExitCode::SUCCESS),
        Command::Run(args) => run(&registry, args).await,
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use std::time::Duration;

    use clap::CommandFactory;

    use super::*;

    fn run_args(extra: &[&str]) -> RunArgs {
        let argv = ["serverkit", "run", "threshold", "--input", "in.png"]
            .into_iter()
            .chain(extra.iter().copied());
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            _ => panic!("expected the run subcommand"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn params_parse_as_json_or_string() {
        assert_eq!(parse_param("threshold=90").unwrap(), ("threshold".into(), Value::from(90)));
        assert_eq!(parse_param("invert=true").unwrap(), ("invert".into(), Value::from(true)));
        assert_eq!(parse_param("image=cells").unwrap(), ("image".into(), Value::from("cells")));
        assert_eq!(parse_param("label=a=b").unwrap(), ("label".into(), Value::from("a=b")));
        assert!(matches!(parse_param("novalue"), Err(CliError::InvalidParam(_))));
        assert!(matches!(parse_param("=1"), Err(CliError::InvalidParam(_))));
    }

    #[test]
    fn untiled_by_default() {
        assert!(tiling_from_args(&run_args(&[])).unwrap().is_none());
    }

    #[test]
    fn tiling_flags_build_a_config() {
        let args = run_args(&["--tiled", "--tile-size", "64", "--overlap", "0.25", "--delay", "0.5"]);
        let config = tiling_from_args(&args).unwrap().unwrap();
        assert_eq!(config.tile_size_px, 64);
        assert!((config.overlap - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.delay, Duration::from_millis(500));
        assert!(!config.randomize);
    }

    #[test]
    fn tiling_json_overrides_flags() {
        let args = run_args(&["--tile-size", "8", "--tiling-json", r#"{"tile_size_px": 32, "randomize": true}"#]);
        let config = tiling_from_args(&args).unwrap().unwrap();
        assert_eq!(config.tile_size_px, 32);
        assert!(config.randomize);
    }

    #[test]
    fn bad_tiling_is_rejected_before_running() {
        let args = run_args(&["--tiled", "--overlap", "1.0"]);
        assert!(matches!(tiling_from_args(&args), Err(CliError::Config(_))));
        let args = run_args(&["--tiled", "--delay=-1"]);
        assert!(matches!(tiling_from_args(&args), Err(CliError::Config(_))));
    }
}
