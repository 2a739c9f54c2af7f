use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use pairtile_core::config::{ConvertConfig, TileFormat};
use pairtile_core::logging::{self, FileSinkPlan, LoggingInitOptions, DEFAULT_LOG_FILTER};
use pairtile_core::pipeline::{ConvertPipeline, ProgressCallback, RunSummary};

#[derive(Parser, Debug)]
#[command(
    name = "pairtile",
    about = "Cut paired low-res/high-res images into aligned training tiles"
)]
struct Cli {
    #[arg(
        short = 'x',
        long = "input",
        value_name = "DIR|INDEX",
        help = "Low-res collection: a directory or a .txt/.csv index"
    )]
    input: Option<PathBuf>,

    #[arg(
        short = 'y',
        long = "target",
        value_name = "DIR|INDEX",
        help = "High-res collection: a directory or a .txt/.csv index"
    )]
    target: Option<PathBuf>,

    #[arg(short = 'o', long = "data-dir", value_name = "DIR", help = "Output directory")]
    data_dir: Option<PathBuf>,

    #[arg(long, help = "Largest tile edge on the low-res side (0 keeps whole images)")]
    max_size: Option<usize>,

    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Split each image into overlapping tiles instead of one crop"
    )]
    split_image: Option<bool>,

    #[arg(long, help = "Split step as a fraction of the tile size, in (0, 1]")]
    split_step: Option<f64>,

    #[arg(long, help = "Pad the input side by this many pixels")]
    pad_x: Option<usize>,

    #[arg(long, help = "Pad the target side by this many pixels")]
    pad_y: Option<usize>,

    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Pad the input side with zeros instead of reflection"
    )]
    zero_pad_x: Option<bool>,

    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Pad the target side with zeros instead of reflection"
    )]
    zero_pad_y: Option<bool>,

    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Convert the input side to grayscale"
    )]
    grayscale_x: Option<bool>,

    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "Convert the target side to grayscale"
    )]
    grayscale_y: Option<bool>,

    #[arg(long, value_name = "TOML", help = "Read defaults from a TOML config file")]
    config: Option<PathBuf>,

    #[arg(
        long,
        num_args = 0..=1,
        require_equals = true,
        default_missing_value = "true",
        help = "List collection directories recursively"
    )]
    recursive: Option<bool>,

    #[arg(long, value_name = "png|tiff", help = "Tile file format")]
    format: Option<TileFormat>,

    #[arg(long, help = "Decoded pairs buffered ahead of tiling")]
    queue_size: Option<usize>,

    #[arg(long, help = "Concurrent tile writers (0: available parallelism)")]
    threads: Option<usize>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, value_name = "DIR", help = "Also write rolling log files here")]
    log_dir: Option<PathBuf>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_dir.as_deref(), cli.verbose, cli.log_filter.as_deref());
    info!(pid = std::process::id(), "Runtime startup metadata");

    let config = build_config(&cli)?;
    run_conversion(config).await.map(|_| ())
}

/// Config file first, then every flag that was given on the command line.
fn build_config(cli: &Cli) -> Result<ConvertConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => ConvertConfig::load_from_path(path)?,
        None => ConvertConfig::default(),
    };

    if let Some(input) = &cli.input {
        config.input = Some(input.clone());
    }
    if let Some(target) = &cli.target {
        config.target = target.clone();
    }
    if let Some(data_dir) = &cli.data_dir {
        config.output_dir = data_dir.clone();
    }
    if let Some(max_size) = cli.max_size {
        config.max_tile_size = max_size;
    }
    if let Some(step) = cli.split_step {
        config.split_step_rate = step;
    }
    if let Some(format) = cli.format {
        config.tile_format = format;
    }
    if let Some(queue_size) = cli.queue_size {
        config.queue_size = queue_size;
    }
    if let Some(threads) = cli.threads {
        config.writer_threads = threads;
    }
    if let Some(padding) = cli.pad_x {
        config.input_transform.padding = padding;
    }
    if let Some(padding) = cli.pad_y {
        config.target_transform.padding = padding;
    }

    // Switches accept `--flag` or `--flag=false`, so file settings can be undone.
    let switches = [
        (cli.split_image, &mut config.split_enabled),
        (cli.recursive, &mut config.recursive),
        (cli.zero_pad_x, &mut config.input_transform.zero_pad),
        (cli.zero_pad_y, &mut config.target_transform.zero_pad),
        (cli.grayscale_x, &mut config.input_transform.grayscale),
        (cli.grayscale_y, &mut config.target_transform.grayscale),
    ];
    for (flag, setting) in switches {
        if let Some(value) = flag {
            *setting = value;
        }
    }

    Ok(config)
}

async fn run_conversion(config: ConvertConfig) -> Result<RunSummary> {
    info!(
        target = %config.target.display(),
        input = ?config.input,
        output = %config.output_dir.display(),
        "Starting conversion"
    );

    let summary = ConvertPipeline::from_config(config)
        .with_progress(make_progress_callback())
        .run()
        .await;
    eprintln!();
    let summary = summary.context("Conversion failed")?;

    info!(
        pairs = summary.pairs_processed,
        skipped_transparent = summary.skipped_transparent,
        tiles = summary.tiles_written,
        "Conversion completed successfully"
    );
    Ok(summary)
}

fn init_logging(log_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let init_options = LoggingInitOptions {
        log_dir: log_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_filter = init_plan.filters.console_filter;
    let file_filter = init_plan.filters.file_filter;

    match init_plan.file_sink {
        FileSinkPlan::Ready(ready) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let file_env_filter = parse_env_filter_with_fallback(&file_filter, "file");

            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(ready.appender)
                        .with_filter(file_env_filter),
                );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSinkPlan::Fallback(fallback) => {
            let console_env_filter = parse_env_filter_with_fallback(&console_filter, "console");
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            // Console-only is the normal mode when no log directory was asked for.
            if let Some(attempted_log_dir) = fallback.attempted_log_dir {
                warn!(
                    attempted_log_dir = %attempted_log_dir.display(),
                    reason = %fallback.reason,
                    "Persistent file logging unavailable; continuing with console-only logging"
                );
            }
        }
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn progress_fraction(done: usize, total: usize) -> f64 {
    if total > 0 {
        (done as f64 / total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    }
}

fn render_bar(fraction: f64) -> String {
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    "█".repeat(filled) + &"░".repeat(empty)
}

fn compute_rate(done: usize, elapsed: f64) -> f64 {
    if elapsed <= 0.0 {
        return 0.0;
    }
    done as f64 / elapsed
}

fn print_progress(done: usize, total: usize, elapsed: f64) {
    let fraction = progress_fraction(done, total);
    let rate = compute_rate(done, elapsed);
    let eta = if rate > 0.0 {
        let remaining = total.saturating_sub(done) as f64;
        format!(" | ETA: {}", format_duration(remaining / rate))
    } else {
        String::new()
    };

    eprint!(
        "\r[{}] {:5.1}% | Pair {}/{} | {:.1} pairs/s | Elapsed: {}{}    ",
        render_bar(fraction),
        fraction * 100.0,
        done,
        total,
        rate,
        format_duration(elapsed),
        eta,
    );
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    Box::new(move |done, total| {
        print_progress(done, total, start.elapsed().as_secs_f64());
    })
}


#[cfg(test)]
mod duration_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.0), "00:00:45");
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(86400.0), "24:00:00");
    }
}
