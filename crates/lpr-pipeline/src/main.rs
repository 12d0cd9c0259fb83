//! Command-line driver for the plate recognition pipeline
//!
//! Usage:
//!   lpr-detect detect <image> [--output-dir DIR]     - Detect vehicles and read plates
//!   lpr-detect region <image> --x1 .. --y2 ..        - Read a manually selected region
//!   lpr-detect normalize <text>...                   - Show how raw text normalizes

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lpr_pipeline::normalizer::lookup_key;
use lpr_pipeline::output::{write_detection_outputs, write_region_outputs};
use lpr_pipeline::{DetectionPipeline, ModelSet, PipelineConfig, PlateNormalizer};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[command(name = "lpr-detect")]
#[command(about = "License plate recognition for still images", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON pipeline configuration
    #[arg(long, global = true, env = "LPR_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect vehicles, localize and read their plates
    Detect {
        /// Input image path
        image: PathBuf,

        /// Directory for the annotated image, plate crops and JSON report
        #[arg(long, default_value = "output")]
        output_dir: PathBuf,

        /// Pretty-print JSON
        #[arg(long)]
        pretty: bool,

        /// Print Prometheus metrics to stderr when done
        #[arg(long)]
        metrics: bool,
    },

    /// Read the plate inside a manually selected rectangle
    Region {
        /// Input image path
        image: PathBuf,

        #[arg(long, allow_hyphen_values = true)]
        x1: i32,

        #[arg(long, allow_hyphen_values = true)]
        y1: i32,

        #[arg(long, allow_hyphen_values = true)]
        x2: i32,

        #[arg(long, allow_hyphen_values = true)]
        y2: i32,

        #[arg(long, default_value = "output")]
        output_dir: PathBuf,

        /// Pretty-print JSON
        #[arg(long)]
        pretty: bool,
    },

    /// Normalize raw plate text without running any model
    Normalize {
        /// Raw recognizer outputs
        #[arg(required = true)]
        texts: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
struct NormalizeOutcome {
    input: String,
    text: String,
    pass: &'static str,
    canonical: bool,
    lookup_key: String,
}

fn main() -> Result<()> {
    let _log_guard = telemetry::init_with_service("lpr-detect");
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Detect {
            image,
            output_dir,
            pretty,
            metrics,
        } => {
            detect(config, &image, &output_dir, pretty)?;
            if metrics {
                eprintln!("{}", telemetry::metrics::encode_metrics()?);
            }
        }
        Commands::Region {
            image,
            x1,
            y1,
            x2,
            y2,
            output_dir,
            pretty,
        } => region(config, &image, (x1, y1, x2, y2), &output_dir, pretty)?,
        Commands::Normalize { texts } => normalize(config, &texts)?,
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    let mut config = match path {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            PipelineConfig::from_file(path)?
        }
        None => PipelineConfig::default(),
    };
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

fn to_json<T: Serialize>(value: &T, pretty: bool) -> Result<String> {
    Ok(if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    })
}

fn detect(config: PipelineConfig, image: &Path, output_dir: &Path, pretty: bool) -> Result<()> {
    let models = ModelSet::load(&config).context("failed to load models")?;
    let pipeline = DetectionPipeline::new(config, &models)?;

    let (annotated, results) = pipeline.process_path(image)?;
    let report = write_detection_outputs(output_dir, image, &annotated, &results)?;
    info!(
        vehicles = report.vehicles.len(),
        plates = report.plate_images.len(),
        output = %output_dir.display(),
        "Detection written"
    );
    println!("{}", to_json(&report, pretty)?);

    drop(pipeline);
    models.shutdown();
    Ok(())
}

fn region(
    config: PipelineConfig,
    image: &Path,
    (x1, y1, x2, y2): (i32, i32, i32, i32),
    output_dir: &Path,
    pretty: bool,
) -> Result<()> {
    let models = ModelSet::load(&config).context("failed to load models")?;
    let pipeline = DetectionPipeline::new(config, &models)?;

    let rgb = image::open(image)
        .with_context(|| format!("failed to open {}", image.display()))?
        .to_rgb8();
    let recognition = pipeline.process_region(&rgb, x1, y1, x2, y2)?;
    let report = write_region_outputs(output_dir, image, recognition)?;
    println!("{}", to_json(&report, pretty)?);

    drop(pipeline);
    models.shutdown();
    Ok(())
}

fn normalize(config: PipelineConfig, texts: &[String]) -> Result<()> {
    let normalizer = PlateNormalizer::new(config.normalizer)?;

    for input in texts {
        let outcome = normalizer.normalize_detailed(input);
        let line = NormalizeOutcome {
            input: input.clone(),
            canonical: outcome.is_canonical(),
            pass: outcome.pass.as_str(),
            lookup_key: lookup_key(&outcome.text),
            text: outcome.text,
        };
        println!("{}", serde_json::to_string(&line)?);
    }

    Ok(())
}
