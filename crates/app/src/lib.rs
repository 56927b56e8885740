use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use bulkgen_core::client_queue::{
    ClientQueue, HttpTransport, QueueCounts, QueueEvent, QueueSettings, RunOutcome,
};
use bulkgen_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use bulkgen_core::logging::{
    self, FilterSource, LogFilters, RedactingMakeWriter, RuntimeLogMode, DEFAULT_LOG_FILTER,
};
use bulkgen_core::prompt_import::extract_prompts;
use bulkgen_core::server::{app_router, AppState};
use bulkgen_core::types::AspectRatio;

#[derive(Parser)]
#[command(name = "bulkgen", about = "Bulk image generation proxy and queue runner")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

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

    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(long)]
    host: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a prompt list through a running server, one request at a time.
    Queue(QueueArgs),
}

#[derive(Args)]
struct QueueArgs {
    #[arg(long, default_value = "http://127.0.0.1:3000/", help = "Base URL of the server")]
    server: String,
    #[arg(long, value_name = "FILE", help = "File holding the session cookie (or MOCK)")]
    cookie_file: PathBuf,
    #[arg(long, value_name = "FILE", help = "Prompt list (.txt, .json or .csv)")]
    prompts: PathBuf,
    #[arg(long, default_value_t = 1, help = "Generate each prompt this many times")]
    repeat: usize,
    #[arg(long, help = "Style prefix joined in front of every prompt")]
    style: Option<String>,
    #[arg(long, default_value = "square", value_parser = parse_aspect_ratio)]
    aspect_ratio: AspectRatio,
    #[arg(long, value_name = "DIR", help = "Queue directory (default: <data-dir>/queue)")]
    out: Option<PathBuf>,
}

fn parse_aspect_ratio(raw: &str) -> Result<AspectRatio, String> {
    AspectRatio::parse(raw)
        .ok_or_else(|| format!("unknown aspect ratio '{raw}' (square, portrait, landscape)"))
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let mode = if cli.command.is_some() {
        RuntimeLogMode::Queue
    } else {
        RuntimeLogMode::Server
    };
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());

    init_logging(
        mode,
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    log_startup_metadata(mode, &resolved_data_dir);

    match cli.command {
        Some(Commands::Queue(args)) => run_queue(args, resolved_data_dir).await,
        None => run_server(cli.port, cli.host, resolved_data_dir).await,
    }
}

/// Console plus (when the data dir is writable) a rolling file sink, both
/// behind the redacting writer. Failures degrade to console-only.
fn init_logging(
    mode: RuntimeLogMode,
    data_dir: Option<&Path>,
    verbose: u8,
    cli_log_filter: Option<&str>,
) {
    let crash_hook = logging::install_crash_hook(data_dir);
    let rust_log = std::env::var("RUST_LOG").ok();
    let filters = LogFilters::from_source(&FilterSource::pick(
        cli_log_filter,
        verbose,
        rust_log.as_deref(),
    ));

    let (file_layer, file_sink_error) = match logging::open_file_sink(mode, data_dir) {
        Ok(sink) => (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(RedactingMakeWriter::new(sink.appender))
                    .with_filter(env_filter_or_default(&filters.file, "file")),
            ),
            None,
        ),
        Err(err) => (None, Some(err)),
    };
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(RedactingMakeWriter::new(std::io::stderr))
        .with_filter(env_filter_or_default(&filters.console, "console"));

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init();
    if let Err(err) = installed {
        eprintln!("Warning: tracing already initialized ({err}); keeping the existing subscriber");
        return;
    }

    if let Some(err) = file_sink_error {
        warn!(error = %err, "File logging unavailable; logging to the console only");
    }
    if let Err(err) = crash_hook {
        warn!(error = %err, "Crash reports disabled; panics will only reach stderr");
    }
}

fn env_filter_or_default(filter: &str, sink: &str) -> EnvFilter {
    EnvFilter::try_new(filter).unwrap_or_else(|err| {
        eprintln!("Invalid {sink} log filter '{filter}' ({err}); using '{DEFAULT_LOG_FILTER}'");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: RuntimeLogMode, data_dir: &Path) {
    info!(
        mode = mode.as_str(),
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

fn load_config(data_dir: &Path) -> AppConfig {
    match initialize_data_dir(data_dir) {
        Ok(true) => info!(path = %config_path(data_dir).display(), "Wrote default config"),
        Ok(false) => {}
        Err(err) => warn!(error = %format!("{err:#}"), "Failed to initialize data directory"),
    }
    match AppConfig::load_from_path(&config_path(data_dir)) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    }
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    data_dir: PathBuf,
) -> Result<()> {
    let config = load_config(&data_dir);

    let port = port_override
        .or_else(|| std::env::var("PORT").ok().and_then(|v| v.parse().ok()))
        .unwrap_or(config.server.port);
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = AppState::new(config, &data_dir);
    state.start();
    let app = app_router(state.clone());

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, media_dir = %state.media_dir().display(), "Starting bulkgen server");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    state.shutdown().await;
    served.context("server error")?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

async fn run_queue(args: QueueArgs, data_dir: PathBuf) -> Result<()> {
    let config = load_config(&data_dir);

    let cookie = std::fs::read_to_string(&args.cookie_file)
        .with_context(|| format!("failed to read cookie file: {}", args.cookie_file.display()))?
        .trim()
        .to_string();
    if cookie.is_empty() {
        bail!("cookie file is empty: {}", args.cookie_file.display());
    }

    let prompts_raw = std::fs::read_to_string(&args.prompts)
        .with_context(|| format!("failed to read prompt file: {}", args.prompts.display()))?;
    let file_name = args
        .prompts
        .file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string);
    let prompts = extract_prompts(file_name.as_deref(), &prompts_raw)?;

    let transport = HttpTransport::new(
        &args.server,
        Duration::from_secs(config.generation.request_timeout_secs),
        config.video_timeout(),
    )?;
    let settings = QueueSettings {
        aspect_ratio: args.aspect_ratio,
        ..QueueSettings::default()
    };
    let out_dir = args.out.unwrap_or_else(|| data_dir.join("queue"));
    let queue = ClientQueue::restore(&out_dir, cookie, Arc::new(transport), settings).await?;

    if queue.counts().total == 0 {
        let added = queue.load_prompts(&prompts, args.repeat, args.style.as_deref());
        if added == 0 {
            bail!("no prompts found in {}", args.prompts.display());
        }
        info!(added, "Loaded prompts into queue");
    } else {
        eprintln!(
            "Resuming existing queue in {} (delete it to start over)",
            out_dir.display()
        );
    }

    let progress = tokio::spawn(report_progress(queue.subscribe(), queue.counts()));
    let pauser = queue.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current item...");
            pauser.pause();
        }
    });

    let outcome = queue.run().await;
    interrupt.abort();
    let _ = progress.await;
    queue.close().await;

    let counts = queue.counts();
    eprintln!(
        "\n{} | results: {}",
        summary_line(outcome, counts),
        queue.results().dir().display()
    );
    match outcome {
        RunOutcome::AuthRequired => bail!("the server rejected the session cookie"),
        RunOutcome::ThresholdReached => bail!("stopped after repeated failures; rerun to resume"),
        _ => Ok(()),
    }
}

async fn report_progress(mut rx: broadcast::Receiver<QueueEvent>, initial: QueueCounts) {
    let started = Instant::now();
    let mut counts = initial;
    loop {
        match rx.recv().await {
            Ok(QueueEvent::ItemStarted { .. }) => {}
            Ok(QueueEvent::ItemCompleted { .. }) => {
                counts.completed += 1;
                counts.pending = counts.pending.saturating_sub(1);
            }
            Ok(QueueEvent::ItemError { .. }) => {
                counts.error += 1;
                counts.pending = counts.pending.saturating_sub(1);
            }
            Ok(QueueEvent::Stopped { counts: last, .. }) => {
                eprint!("\r{}", progress_line(&last, started.elapsed()));
                break;
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
        eprint!("\r{}", progress_line(&counts, started.elapsed()));
        let _ = std::io::stderr().flush();
    }
}

fn format_duration(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn progress_line(counts: &QueueCounts, elapsed: Duration) -> String {
    let done = counts.completed + counts.error;
    let fraction = if counts.total > 0 {
        (done as f64 / counts.total as f64).clamp(0.0, 1.0)
    } else {
        0.0
    };
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let bar = "█".repeat(filled) + &"░".repeat(PROGRESS_BAR_WIDTH - filled);

    format!(
        "[{bar}] {:5.1}% | {done}/{} | ok {} | failed {} | Elapsed: {}    ",
        fraction * 100.0,
        counts.total,
        counts.completed,
        counts.error,
        format_duration(elapsed),
    )
}

fn summary_line(outcome: RunOutcome, counts: QueueCounts) -> String {
    let reason = match outcome {
        RunOutcome::Drained => "finished",
        RunOutcome::Paused => "paused",
        RunOutcome::Cancelled => "cancelled",
        RunOutcome::ThresholdReached => "paused after repeated failures",
        RunOutcome::AuthRequired => "paused: session cookie rejected",
        RunOutcome::AlreadyRunning => "already running",
    };
    format!(
        "Queue {reason}: {} completed, {} failed, {} pending of {}",
        counts.completed, counts.error, counts.pending, counts.total
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(0)), "00:00:00");
        assert_eq!(format_duration(Duration::from_secs(59)), "00:00:59");
        assert_eq!(format_duration(Duration::from_secs(3_725)), "01:02:05");
    }

    #[test]
    fn progress_line_counts_errors_as_done() {
        let counts = QueueCounts {
            total: 4,
            pending: 2,
            processing: 0,
            completed: 1,
            error: 1,
        };
        let line = progress_line(&counts, Duration::from_secs(61));
        assert!(line.contains(" 50.0%"), "{line}");
        assert!(line.contains("2/4"));
        assert!(line.contains("failed 1"));
        assert!(line.contains("00:01:01"));
        assert_eq!(line.matches('█').count(), PROGRESS_BAR_WIDTH / 2);
    }

    #[test]
    fn progress_line_handles_empty_queue() {
        let line = progress_line(&QueueCounts::default(), Duration::ZERO);
        assert!(line.contains("  0.0%"));
        assert_eq!(line.matches('░').count(), PROGRESS_BAR_WIDTH);
    }

    #[test]
    fn summary_names_the_stop_reason() {
        let counts = QueueCounts {
            total: 3,
            pending: 1,
            processing: 0,
            completed: 2,
            error: 0,
        };
        assert_eq!(
            summary_line(RunOutcome::ThresholdReached, counts),
            "Queue paused after repeated failures: 2 completed, 0 failed, 1 pending of 3"
        );
    }

    #[test]
    fn cli_parses_queue_subcommand() {
        let cli = Cli::try_parse_from([
            "bulkgen",
            "-v",
            "queue",
            "--cookie-file",
            "cookie.txt",
            "--prompts",
            "prompts.csv",
            "--repeat",
            "3",
            "--aspect-ratio",
            "landscape",
        ])
        .unwrap();

        assert_eq!(cli.verbose, 1);
        let Some(Commands::Queue(args)) = cli.command else {
            panic!("expected queue subcommand");
        };
        assert_eq!(args.server, "http://127.0.0.1:3000/");
        assert_eq!(args.repeat, 3);
        assert_eq!(args.aspect_ratio, AspectRatio::Landscape);
        assert!(args.style.is_none());
    }

    #[test]
    fn cli_rejects_unknown_aspect_ratio() {
        let parsed = Cli::try_parse_from([
            "bulkgen",
            "queue",
            "--cookie-file",
            "c",
            "--prompts",
            "p",
            "--aspect-ratio",
            "wide",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn cli_without_subcommand_serves() {
        let cli = Cli::try_parse_from(["bulkgen", "--port", "8080", "--data-dir", "/tmp/bg"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/bg")));
    }
}
