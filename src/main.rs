//! CLI entry point for strip-blur
//!
//! Provides two subcommands:
//! - `run`: blur an image file strip by strip in worker processes
//! - `worker` (hidden): the worker side, started by `run` itself
//!
//! # Usage
//!
//! ```bash
//! strip-blur run photo.jpg -n 4 --transport pool --pool-size 2 -o photo_blurred.jpg
//! strip-blur run photo.png --transport shared --save-strips part
//! ```
//!
//! Settings come from `config/strip-blur.toml` (or `--config`), then `STRIP_BLUR_*`
//! environment variables, then the flags below.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use strip_blur::config::{BlurConfig, DEFAULT_CONFIG_PATH};
use strip_blur::lifecycle::ShutdownGuard;
use strip_blur::logging::{self, OutputFormat};
use strip_blur::pipeline::Pipeline;
use strip_blur::shared_buffer::LayoutKind;
use strip_blur::transport::TransportKind;
use strip_blur::worker::{self, WorkerArgs};

#[derive(Parser)]
#[command(name = "strip-blur")]
#[command(about = "Blur an image strip by strip in parallel processes", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split, blur, and reassemble one image
    Run(RunArgs),

    /// Serve strip frames on stdin/stdout (started by `run`)
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Image to blur
    input: PathBuf,

    /// Output path; defaults to `<input stem>_blurred.<input extension>`
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of vertical strips
    #[arg(short = 'n', long)]
    strips: Option<usize>,

    /// How results travel back from workers
    #[arg(long, value_enum)]
    transport: Option<TransportKind>,

    /// Gaussian sigma
    #[arg(long)]
    sigma: Option<f32>,

    /// Pool lane cap (0 = one lane per strip)
    #[arg(long)]
    pool_size: Option<usize>,

    /// Save every blurred strip as `<PREFIX>_<n>.<ext>`
    #[arg(long, value_name = "PREFIX")]
    save_strips: Option<String>,

    /// Pass pipe/pool results through a shared buffer before reassembly
    #[arg(long)]
    round_trip_shared: bool,

    /// Shared buffer slot layout
    #[arg(long, value_enum)]
    layout: Option<LayoutKind>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Log format
    #[arg(long, value_enum)]
    log_format: Option<OutputFormat>,
}

impl RunArgs {
    fn apply(&self, config: &mut BlurConfig) {
        if let Some(strips) = self.strips {
            config.pipeline.strips = strips;
        }
        if let Some(transport) = self.transport {
            config.pipeline.transport = transport;
        }
        if let Some(sigma) = self.sigma {
            config.pipeline.sigma = sigma;
        }
        if let Some(pool_size) = self.pool_size {
            config.workers.pool_size = pool_size;
        }
        if let Some(prefix) = &self.save_strips {
            config.output.save_strips = true;
            config.output.strip_prefix = prefix.clone();
        }
        if self.round_trip_shared {
            config.pipeline.round_trip_shared = true;
        }
        if let Some(layout) = self.layout {
            config.shared.layout = layout;
        }
        if let Some(level) = &self.log_level {
            config.application.log_level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.application.log_format = format;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(&cli.config, args).await,
        Commands::Worker(args) => run_worker(args).await,
    }
}

async fn run(config_path: &Path, args: RunArgs) -> Result<()> {
    let mut config = BlurConfig::load_from(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;
    logging::init_from_config(&config)
        .map_err(anyhow::Error::msg)
        .context("Failed to initialize logging")?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input));

    let guard = ShutdownGuard::install().context("Failed to install signal handlers")?;
    let pipeline = Pipeline::new(config).context("Failed to prepare pipeline")?;
    let summary = pipeline
        .run_file(&args.input, &output, &guard.token())
        .await
        .with_context(|| format!("Failed to blur {}", args.input.display()))?;

    println!(
        "{} -> {} ({} strips via {}, {} ms)",
        args.input.display(),
        output.display(),
        summary.strip_widths.len(),
        summary.transport,
        summary.elapsed.as_millis()
    );
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<()> {
    logging::init_worker(&args.log_level)
        .map_err(anyhow::Error::msg)
        .context("Failed to initialize worker logging")?;
    worker::run(&args).await.context("Worker failed")?;
    Ok(())
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let extension = input
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "png".to_string());
    input.with_file_name(format!("{stem}_blurred.{extension}"))
}
