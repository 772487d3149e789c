use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use vidfill_core::backend::InferenceBackend;
use vidfill_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use vidfill_core::logging::{self, FileSink, LoggingOptions, PanicHookInstall, DEFAULT_LOG_FILTER};
use vidfill_core::model::ModelVariant;
use vidfill_core::pipeline::{resolve_checkpoint, run_job, InpaintJob};
use vidfill_core::schedule::WindowProgress;

#[derive(Parser, Debug)]
#[command(
    name = "vidfill",
    about = "Remove masked objects from a video with a flow-guided inpainting model"
)]
struct Cli {
    #[arg(short = 'i', long = "video", help = "Input video file or directory of frames")]
    video: PathBuf,

    #[arg(short = 'c', long = "ckpt", help = "Exported ONNX checkpoint")]
    ckpt: PathBuf,

    #[arg(short = 'm', long = "mask", help = "Directory of mask images, one per frame")]
    mask: PathBuf,

    #[arg(short = 'o', long = "output", help = "Output video path")]
    output: PathBuf,

    #[arg(long, help = "Model variant: e2fgvi or e2fgvi_hq")]
    model: Option<ModelVariant>,

    #[arg(long, help = "Stride between reference frames")]
    step: Option<usize>,

    #[arg(
        long = "num-ref",
        allow_hyphen_values = true,
        help = "Maximum reference frames per window (-1: no limit)"
    )]
    num_ref: Option<i64>,

    #[arg(long = "neighbor-stride", help = "Window spacing and neighbor radius")]
    neighbor_stride: Option<usize>,

    #[arg(long, help = "Frame rate of the written video")]
    savefps: Option<f64>,

    #[arg(long, requires = "height", help = "Working width, e2fgvi_hq only (requires --height)")]
    width: Option<u32>,

    #[arg(long, requires = "width", help = "Working height, e2fgvi_hq only (requires --width)")]
    height: Option<u32>,

    #[arg(long, help = "Inference backend: cpu, cuda or tensorrt")]
    backend: Option<String>,

    #[arg(long = "ckpt-sha256", value_name = "HEX", help = "Expected SHA-256 of the checkpoint")]
    ckpt_sha256: Option<String>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

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
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    vidfill_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    if let Err(e) = initialize_data_dir(&resolved_data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let config = match AppConfig::load_from_path(&config_path(&resolved_data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };

    let job = build_job(&cli, &config, &resolved_data_dir)?;
    info!(
        video = %job.input.display(),
        ckpt = %job.checkpoint.display(),
        masks = %job.mask_dir.display(),
        output = %job.output.display(),
        model = %job.variant,
        backend = %job.backend,
        step = job.schedule.reference_step,
        num_ref = %job.schedule.reference_limit,
        neighbor_stride = job.schedule.neighbor_stride,
        "Starting job"
    );

    let summary = tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let result = run_job(&job, |progress| print_progress(&progress, started));
        eprintln!();
        result
    })
    .await
    .context("inpainting task panicked")??;

    info!(
        frames = summary.frames,
        elapsed = %format_duration(summary.elapsed_secs),
        "Done"
    );
    Ok(())
}

/// Merge CLI flags over `config.toml` values.
fn build_job(cli: &Cli, config: &AppConfig, data_dir: &Path) -> Result<InpaintJob> {
    let mut schedule_cfg = config.schedule.clone();
    if let Some(step) = cli.step {
        schedule_cfg.step = step;
    }
    if let Some(num_ref) = cli.num_ref {
        schedule_cfg.num_ref = num_ref;
    }
    if let Some(stride) = cli.neighbor_stride {
        schedule_cfg.neighbor_stride = stride;
    }
    let schedule = schedule_cfg.to_params()?;

    let backend = cli
        .backend
        .as_deref()
        .map(InferenceBackend::from_str_lossy)
        .unwrap_or(config.inference.backend);

    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let trt_cache_dir = resolve_relative_to(data_dir, &config.paths.trt_cache_dir);

    Ok(InpaintJob {
        input: cli.video.clone(),
        checkpoint: resolve_checkpoint(&models_dir, &cli.ckpt),
        checkpoint_sha256: cli.ckpt_sha256.clone(),
        mask_dir: cli.mask.clone(),
        output: cli.output.clone(),
        variant: cli.model.unwrap_or(config.inference.model),
        backend,
        trt_cache_dir: Some(trt_cache_dir),
        schedule,
        mask: config.mask,
        size: cli.width.zip(cli.height),
        fps: cli.savefps.unwrap_or(config.output.fps),
        codec: config.output.codec.clone(),
        crf: config.output.crf,
        pixel_format: config.output.pixel_format.clone(),
    })
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook = logging::install_panic_hook(data_dir);
    if let PanicHookInstall::Skipped { reason } = &panic_hook {
        eprintln!(
            "Warning: panic crash artifact hook unavailable ({reason}). Panics will not be persisted to crash logs."
        );
    }

    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_log_filters(&options);
    let console_filter = parse_env_filter_with_fallback(&filters.console_filter, "console");
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    match logging::build_file_sink(&options) {
        FileSink::Ready {
            log_dir,
            retention_files,
            appender,
        } => {
            let file_filter = parse_env_filter_with_fallback(&filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(appender)
                    .with_filter(file_filter),
            );
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            info!(
                log_dir = %log_dir.display(),
                retention_files,
                "Persistent file logging enabled"
            );
        }
        FileSink::Disabled {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }
            warn!(
                attempted_log_dir = ?attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
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

fn log_startup_metadata(data_dir: &Path) {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn format_progress(progress: &WindowProgress, elapsed: f64) -> String {
    let done = progress.index + 1;
    let fraction = if progress.total > 0 {
        (done as f64 / progress.total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));

    let eta = if done > 0 && done < progress.total {
        let per_window = elapsed / done as f64;
        format!(" | ETA: {}", format_duration(per_window * (progress.total - done) as f64))
    } else {
        String::new()
    };

    format!(
        "[{}] {:5.1}% | Window {}/{} (frame {}, {} inputs) | Elapsed: {}{}",
        bar,
        fraction * 100.0,
        done,
        progress.total,
        progress.start,
        progress.batch_len,
        format_duration(elapsed),
        eta,
    )
}

fn print_progress(progress: &WindowProgress, started: Instant) {
    let line = format_progress(progress, started.elapsed().as_secs_f64());
    eprint!("\r{line}    ");
}


#[cfg(test)]
mod progress_tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(6595.0), "01:49:55");
        assert_eq!(format_duration(45.0), "00:00:45");
        assert_eq!(format_duration(0.0), "00:00:00");
        assert_eq!(format_duration(86400.0), "24:00:00");
    }

    #[test]
    fn test_progress_line_midway() {
        let progress = WindowProgress {
            index: 1,
            total: 4,
            start: 5,
            batch_len: 13,
        };
        let line = format_progress(&progress, 20.0);
        assert!(line.contains(" 50.0%"));
        assert!(line.contains("Window 2/4 (frame 5, 13 inputs)"));
        assert!(line.contains("Elapsed: 00:00:20"));
        assert!(line.contains("ETA: 00:00:20"));
    }

    #[test]
    fn test_progress_line_complete_has_no_eta() {
        let progress = WindowProgress {
            index: 2,
            total: 3,
            start: 10,
            batch_len: 8,
        };
        let line = format_progress(&progress, 9.0);
        assert!(line.contains("100.0%"));
        assert!(!line.contains("ETA"));
    }
}
