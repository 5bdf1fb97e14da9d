use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Instant;

use anyhow::{bail, ensure, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use sepconv_core::config::{
    config_path, data_dir, initialize_data_dir, resolve_relative_to, AppConfig,
};
use sepconv_core::logging::{
    self, FileSinkPlan, LoggingInitOptions, PanicHookInstallPlan, DEFAULT_LOG_FILTER,
};
use sepconv_core::model::{InferenceBackend, OnnxSepConvModel, SessionConfig};
use sepconv_core::pipeline::FramePipeline;
use sepconv_core::run::{
    ensure_output_is_not_input, prepare_output_path, InterpolationRun, PairFailurePolicy,
    ProgressCallback, RunOptions, RunOutcome,
};
use sepconv_core::sepconv::{list_adapters, EngineKind};
use sepconv_core::tier::{ConvolutionGeometry, ResolutionTier};
use sepconv_core::video::{probe_video, EncoderConfig, FfmpegFrameSource, VideoEncoder};

pub const DEFAULT_OUTPUT_FILE: &str = "output_video.mp4";

#[derive(Parser)]
#[command(
    name = "sepconv",
    about = "Double the frame rate of a video with adaptive separable convolution"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory holding config.toml, models and logs")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interpolate a video to twice its frame rate.
    Run(RunArgs),
    /// List GPU adapters and mark the one the convolution engine would use.
    Devices,
    /// List resolution tiers and the largest frame side each accepts.
    Tiers,
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(help = "Input video")]
    input: PathBuf,
    #[arg(short = 'o', long, default_value = DEFAULT_OUTPUT_FILE)]
    output: PathBuf,
    #[arg(long, help = "Resolution tier: 128, 256, 512 or 1024")]
    tier: Option<ResolutionTier>,
    #[arg(long, help = "Model file (defaults to <models_dir>/SepConvPartialNetwork<tier>.onnx)")]
    model: Option<PathBuf>,
    #[arg(long, value_parser = ["gpu", "cpu"])]
    engine: Option<String>,
    #[arg(long, value_parser = ["cpu", "cuda", "tensorrt"])]
    backend: Option<String>,
    #[arg(long, value_name = "FRAMES")]
    queue_capacity: Option<usize>,
    #[arg(long, value_parser = ["abort", "skip"])]
    on_pair_error: Option<String>,
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    sepconv_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    sepconv_core::runtime::log_runtime_lib_status();
    log_startup_metadata(&resolved_data_dir);

    match cli.command {
        Commands::Run(args) => run_interpolation(args, &resolved_data_dir).await,
        Commands::Devices => {
            print_devices();
            Ok(())
        }
        Commands::Tiers => {
            print_tiers();
            Ok(())
        }
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook_plan = logging::install_panic_hook(data_dir);

    let init_options = LoggingInitOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let init_plan = logging::compose_logging_init_plan(&init_options);
    let console_env_filter =
        parse_env_filter_with_fallback(&init_plan.filters.console_filter, "console");

    let init_result = match init_plan.file_sink {
        FileSinkPlan::Ready { appender, .. } => {
            let file_env_filter =
                parse_env_filter_with_fallback(&init_plan.filters.file_filter, "file");
            let subscriber = tracing_subscriber::registry()
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_filter(console_env_filter),
                )
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(appender)
                        .with_filter(file_env_filter),
                );
            tracing::subscriber::set_global_default(subscriber)
        }
        FileSinkPlan::Fallback {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(console_env_filter),
            );
            let result = tracing::subscriber::set_global_default(subscriber);
            if result.is_ok() {
                warn!(
                    attempted_log_dir = ?attempted_log_dir,
                    reason = %reason,
                    "Persistent file logging unavailable; continuing with console-only logging"
                );
            }
            result
        }
    };

    if let Err(error) = init_result {
        eprintln!(
            "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
        );
    }

    if let PanicHookInstallPlan::Fallback {
        attempted_crash_dir,
        reason,
    } = panic_hook_plan
    {
        warn!(
            attempted_crash_dir = ?attempted_crash_dir,
            reason = %reason,
            "Panic crash artifact hook unavailable; continuing without panic artifacts"
        );
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
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// Config values with this invocation's flags applied.
#[derive(Debug, Clone, PartialEq)]
struct RunSettings {
    tier: ResolutionTier,
    model_path: PathBuf,
    trt_cache_dir: PathBuf,
    engine: EngineKind,
    backend: InferenceBackend,
    options: RunOptions,
    encoder: EncoderConfig,
}

fn resolve_run_settings(
    config: &AppConfig,
    args: &RunArgs,
    data_dir: &Path,
    source_fps: f64,
) -> Result<RunSettings> {
    let tier = args.tier.unwrap_or(config.interpolation.tier);
    let models_dir = resolve_relative_to(data_dir, &config.paths.models_dir);
    let model_path = args
        .model
        .clone()
        .unwrap_or_else(|| OnnxSepConvModel::default_path(&models_dir, tier));

    let engine = match args.engine.as_deref() {
        Some(name) => EngineKind::from_str_lossy(name)
            .with_context(|| format!("unknown engine '{name}'"))?,
        None => config.interpolation.engine,
    };
    let backend = args
        .backend
        .as_deref()
        .map(InferenceBackend::from_str_lossy)
        .unwrap_or(config.inference.backend);

    let mut options = config.interpolation.run_options();
    if let Some(capacity) = args.queue_capacity {
        ensure!(capacity > 0, "--queue-capacity must be at least 1");
        options.queue_capacity = capacity;
    }
    if let Some(policy) = args.on_pair_error.as_deref() {
        options.on_pair_error = PairFailurePolicy::from_str_lossy(policy)
            .with_context(|| format!("unknown pair failure policy '{policy}'"))?;
    }

    let mut encoder = EncoderConfig::new(&args.output, source_fps * 2.0);
    encoder.codec = config.output.codec.clone();
    encoder.crf = config.output.crf;
    encoder.pixel_format = config.output.pixel_format.clone();

    Ok(RunSettings {
        tier,
        model_path,
        trt_cache_dir: resolve_relative_to(data_dir, &config.paths.trt_cache_dir),
        engine,
        backend,
        options,
        encoder,
    })
}

async fn run_interpolation(args: RunArgs, data_dir: &Path) -> Result<()> {
    initialize_data_dir(data_dir)?;
    let config = AppConfig::load_from_path(&config_path(data_dir))?;

    let probe = probe_video(&args.input)?;
    ensure_output_is_not_input(&args.input, &args.output)?;
    let settings = resolve_run_settings(&config, &args, data_dir, probe.fps)?;
    ensure!(
        settings.model_path.is_file(),
        "model file not found: {} (set paths.models_dir or pass --model)",
        settings.model_path.display()
    );

    info!(
        input = %args.input.display(),
        output = %args.output.display(),
        width = probe.width,
        height = probe.height,
        fps = format!("{:.3}", probe.fps),
        frames = ?probe.frame_count,
        tier = %settings.tier,
        engine = %settings.engine,
        backend = %settings.backend,
        "Starting interpolation"
    );

    let model = OnnxSepConvModel::load(
        &SessionConfig {
            model_path: &settings.model_path,
            backend: settings.backend,
            trt_cache_dir: Some(&settings.trt_cache_dir),
        },
        settings.tier,
    )?;
    let geometry = ConvolutionGeometry::for_tier(settings.tier)?;
    let pipeline = FramePipeline::new(
        settings.tier,
        Box::new(model),
        settings.engine.build(geometry),
    )?;

    prepare_output_path(&args.output)?;
    let source = FfmpegFrameSource::open(&args.input, &probe)?;
    let encoder = VideoEncoder::new(settings.encoder.clone());

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            let _ = cancel_tx.send(true);
        }
    });

    let report = InterpolationRun::new(settings.options)
        .execute(
            Box::new(source),
            pipeline,
            Box::new(encoder),
            cancel_rx,
            Some(make_progress_callback()),
        )
        .await;
    eprintln!();

    match report.outcome {
        RunOutcome::Completed => {
            info!(
                output = %args.output.display(),
                pairs = report.pairs_interpolated,
                skipped = report.pairs_skipped,
                frames = report.frames_written,
                "Interpolation complete"
            );
            Ok(())
        }
        RunOutcome::Cancelled => {
            warn!(pairs = report.pairs_interpolated, "Run cancelled, output discarded");
            Ok(())
        }
        RunOutcome::Failed(reason) => bail!("interpolation failed: {reason}"),
    }
}

fn print_devices() {
    let (adapters, preferred) = list_adapters();
    if adapters.is_empty() {
        println!("No GPU adapters found. Use --engine cpu to run without one.");
        return;
    }
    for adapter in &adapters {
        let marker = if preferred.as_ref().map(|p| &p.name) == Some(&adapter.name) {
            "*"
        } else {
            " "
        };
        println!(
            "{marker} {} [{} / {}] driver: {} | max storage binding: {} MiB",
            adapter.name,
            adapter.backend,
            adapter.device_type,
            adapter.driver,
            adapter.max_storage_binding_bytes / (1024 * 1024)
        );
    }
}

fn print_tiers() {
    for tier in ResolutionTier::ALL {
        println!(
            "{:>9}  max frame side {:>4}  {}",
            tier.label(),
            tier.max_image_side(),
            tier.model_file_name()
        );
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;
/// The first pair includes model warm-up and is left out of the rate.
const RATE_WARMUP_PAIRS: u64 = 1;

fn compute_pair_rate(pairs_done: u64, elapsed: f64) -> f64 {
    if elapsed <= 0.0 || pairs_done <= RATE_WARMUP_PAIRS {
        return 0.0;
    }
    (pairs_done - RATE_WARMUP_PAIRS) as f64 / elapsed
}

fn render_progress(pairs_done: u64, total_pairs: Option<u64>, total_elapsed: f64, rate: f64) -> String {
    match total_pairs {
        Some(total) => {
            let fraction = if total > 0 {
                (pairs_done as f64 / total as f64).clamp(0.0, 1.0)
            } else {
                0.0
            };
            let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
            let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH.saturating_sub(filled));
            let eta = if rate > 0.0 {
                let remaining = total.saturating_sub(pairs_done) as f64;
                format!(" | ETA: {}", format_duration(remaining / rate))
            } else {
                String::new()
            };
            format!(
                "[{bar}] {:5.1}% | Pair {pairs_done}/{total} | {rate:.2} pairs/s | Elapsed: {}{eta}",
                fraction * 100.0,
                format_duration(total_elapsed),
            )
        }
        None => format!(
            "Pair {pairs_done} | {rate:.2} pairs/s | Elapsed: {}",
            format_duration(total_elapsed)
        ),
    }
}

fn make_progress_callback() -> ProgressCallback {
    let start = Instant::now();
    let rate_start = Mutex::new(None::<Instant>);
    Box::new(move |pairs_done, total_pairs| {
        let rate_elapsed = {
            let mut rate_start = rate_start
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if rate_start.is_none() && pairs_done >= RATE_WARMUP_PAIRS {
                *rate_start = Some(Instant::now());
            }
            rate_start
                .map(|s| s.elapsed().as_secs_f64())
                .unwrap_or(0.0)
        };
        let rate = compute_pair_rate(pairs_done, rate_elapsed);
        eprint!(
            "\r{}    ",
            render_progress(pairs_done, total_pairs, start.elapsed().as_secs_f64(), rate)
        );
    })
}

#[cfg(test)]
mod cli_tests {
    use super::*;

    fn run_args(argv: &[&str]) -> RunArgs {
        let mut full = vec!["sepconv", "run"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).expect("parse cli").command {
            Commands::Run(args) => args,
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn run_defaults_output_path() {
        let args = run_args(&["in.mp4"]);
        assert_eq!(args.input, PathBuf::from("in.mp4"));
        assert_eq!(args.output, PathBuf::from(DEFAULT_OUTPUT_FILE));
        assert!(args.tier.is_none());
    }

    #[test]
    fn run_parses_tier_forms() {
        assert_eq!(run_args(&["in.mp4", "--tier", "512"]).tier, Some(ResolutionTier::X512));
        assert_eq!(
            run_args(&["in.mp4", "--tier", "1024x1024"]).tier,
            Some(ResolutionTier::X1024)
        );
        assert!(Cli::try_parse_from(["sepconv", "run", "in.mp4", "--tier", "300"]).is_err());
    }

    #[test]
    fn run_rejects_unknown_engine() {
        assert!(Cli::try_parse_from(["sepconv", "run", "in.mp4", "--engine", "tpu"]).is_err());
    }

    #[test]
    fn global_flags_accepted_after_subcommand() {
        let cli = Cli::try_parse_from(["sepconv", "tiers", "-vv", "--data-dir", "/tmp/d"])
            .expect("parse cli");
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/d")));
        assert!(matches!(cli.command, Commands::Tiers));
    }
}

#[cfg(test)]
mod settings_tests {
    use super::*;

    fn args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["sepconv", "run", "clip.mov"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("parse cli").command {
            Commands::Run(args) => args,
            _ => panic!("expected run subcommand"),
        }
    }

    #[test]
    fn config_values_apply_without_flags() {
        let config = AppConfig::default();
        let settings =
            resolve_run_settings(&config, &args(&[]), Path::new("/data"), 24.0).expect("settings");

        assert_eq!(settings.tier, ResolutionTier::X256);
        assert_eq!(
            settings.model_path,
            PathBuf::from("/data/models/SepConvPartialNetwork256.onnx")
        );
        assert_eq!(settings.trt_cache_dir, PathBuf::from("/data/trt_cache"));
        assert_eq!(settings.engine, EngineKind::Gpu);
        assert_eq!(settings.backend, InferenceBackend::Cuda);
        assert_eq!(settings.options.queue_capacity, 5);
        assert_eq!(settings.encoder.fps, 48.0);
        assert_eq!(settings.encoder.output_path, PathBuf::from(DEFAULT_OUTPUT_FILE));
    }

    #[test]
    fn flags_override_config() {
        let mut config = AppConfig::default();
        config.output.crf = 23;
        let settings = resolve_run_settings(
            &config,
            &args(&[
                "--tier",
                "128",
                "--engine",
                "cpu",
                "--backend",
                "tensorrt",
                "--queue-capacity",
                "9",
                "--on-pair-error",
                "skip",
                "--model",
                "/m/custom.onnx",
            ]),
            Path::new("/data"),
            30.0,
        )
        .expect("settings");

        assert_eq!(settings.tier, ResolutionTier::X128);
        assert_eq!(settings.model_path, PathBuf::from("/m/custom.onnx"));
        assert_eq!(settings.engine, EngineKind::Cpu);
        assert_eq!(settings.backend, InferenceBackend::Tensorrt);
        assert_eq!(settings.options.queue_capacity, 9);
        assert_eq!(settings.options.on_pair_error, PairFailurePolicy::Skip);
        assert_eq!(settings.encoder.crf, 23);
    }

    #[test]
    fn zero_queue_capacity_rejected() {
        let result = resolve_run_settings(
            &AppConfig::default(),
            &args(&["--queue-capacity", "0"]),
            Path::new("/data"),
            30.0,
        );
        assert!(result.is_err());
    }
}
