//! CLI entry point for fsdispatch.
//!
//! Watches one or more directories and runs a shell command (or just logs)
//! whenever a file matching the pattern changes.
//!
//! # Usage
//!
//! ```bash
//! fsd [OPTIONS] <ROOTS>...
//!
//! # Log every change under ./src
//! fsd ./src
//!
//! # Rebuild docs when markdown changes, including files already present
//! fsd ./docs --pattern '**/*.md' --on created --on modified \
//!     --process-existing --exec 'pandoc "$FSD_PATH" -o "${FSD_PATH%.md}.html"'
//!
//! # Stream the observation feed as JSON lines
//! fsd /srv/inbox --feed --json-logs
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

use std::io::Write;
use std::process::Command;
use std::sync::Arc;

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};
use fsd_core::Config;
use fsd_watcher::{
    EventKind, EventKinds, FileEvent, HandlerBuilder, HandlerRegistry, HandlerResult,
    WatchSession,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

// =============================================================================
// CLI ARGUMENT TYPES
// =============================================================================

/// Run a command whenever matching files change.
///
/// Events are normalized before dispatch: bursts collapse into one event per
/// debounce window, and delete-then-create saves are reported as
/// modifications.
#[derive(Parser)]
#[command(name = "fsd", version, about, long_about = None)]
struct Cli {
    /// Directories to watch.
    #[arg(required = true, env = "FSD_ROOTS", value_delimiter = ',')]
    roots: Vec<Utf8PathBuf>,

    /// Glob pattern matched against paths relative to each root.
    ///
    /// `*` stays within one directory; `**` crosses directories.
    #[arg(short, long, default_value = "**", env = "FSD_PATTERN")]
    pattern: String,

    /// Event kinds to react to (repeatable).
    #[arg(long = "on", value_enum, value_delimiter = ',', default_values_t = [KindArg::Any])]
    on: Vec<KindArg>,

    /// Shell command to run for each event.
    ///
    /// Receives `FSD_PATH`, `FSD_KIND` and `FSD_ROOT` in its environment.
    /// Without it, events are only logged.
    #[arg(short, long, env = "FSD_EXEC")]
    exec: Option<String>,

    /// Run the command on the worker pool instead of one event at a time.
    #[arg(long)]
    non_blocking: bool,

    /// Also dispatch files that already exist when watching starts.
    #[arg(long)]
    process_existing: bool,

    /// Debounce window in milliseconds.
    #[arg(long, env = "FSD_DEBOUNCE_MS")]
    debounce_ms: Option<u64>,

    /// Maximum number of concurrent non-blocking commands.
    #[arg(long, env = "FSD_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// How long to wait for running commands on shutdown, in milliseconds.
    #[arg(long)]
    drain_timeout_ms: Option<u64>,

    /// Watch only the top level of each root.
    #[arg(long)]
    no_recursive: bool,

    /// JSON configuration file.
    #[arg(short, long, env = "FSD_CONFIG")]
    config: Option<Utf8PathBuf>,

    /// Print every observation as a JSON line on stdout.
    #[arg(long)]
    feed: bool,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,

    /// Enable verbose logging (debug level).
    #[arg(short, long)]
    verbose: bool,

    /// Disable colored output.
    #[arg(long)]
    no_color: bool,
}

/// Event kind selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    /// New files, and files renamed into place.
    Created,
    /// Content or metadata changes.
    Modified,
    /// Removed files.
    Deleted,
    /// Renames reported with both paths.
    Renamed,
    /// Every kind.
    Any,
}

impl KindArg {
    fn kinds(selected: &[Self]) -> EventKinds {
        selected.iter().fold(EventKinds::empty(), |kinds, arg| match arg {
            Self::Created => kinds.with(EventKind::Created),
            Self::Modified => kinds.with(EventKind::Modified),
            Self::Deleted => kinds.with(EventKind::Deleted),
            Self::Renamed => kinds.with(EventKind::Renamed),
            Self::Any => EventKinds::all(),
        })
    }
}

// =============================================================================
// INITIALIZATION FUNCTIONS
// =============================================================================

/// Initializes the tracing subscriber for logging.
///
/// Respects the `RUST_LOG` environment variable if set. Otherwise, uses
/// `debug` level if `--verbose` is set, or `info` level by default. Logs go
/// to stderr so that `--feed` output on stdout stays machine readable.
fn init_tracing(verbose: bool, no_color: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = if verbose { "debug" } else { "info" };
        EnvFilter::new(format!("{level},mio=warn,notify=warn,globset=warn"))
    });

    // Check if colors should be disabled (flag or NO_COLOR env var)
    let use_ansi = !no_color && std::env::var("NO_COLOR").is_err();

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_ansi(use_ansi)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Builds a [`Config`] from the optional file and CLI overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the result is invalid.
fn build_config(cli: &Cli) -> color_eyre::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .map_err(|e| color_eyre::eyre::eyre!("Failed to load {path}: {e}"))?,
        None => Config::default(),
    };

    if let Some(debounce_ms) = cli.debounce_ms {
        config.watch.debounce_ms = debounce_ms;
    }
    if let Some(max_workers) = cli.max_workers {
        config.dispatch.max_workers = max_workers;
    }
    if let Some(drain_timeout_ms) = cli.drain_timeout_ms {
        config.dispatch.drain_timeout_ms = Some(drain_timeout_ms);
    }
    if cli.no_recursive {
        config.watch.recursive = false;
    }

    config
        .validate()
        .map_err(|e| color_eyre::eyre::eyre!("Invalid configuration: {e}"))?;
    Ok(config)
}

fn validate_root(path: &Utf8PathBuf) -> color_eyre::Result<()> {
    if !path.exists() {
        return Err(color_eyre::eyre::eyre!("Path does not exist: {path}"));
    }
    if !path.is_dir() {
        return Err(color_eyre::eyre::eyre!("Path is not a directory: {path}"));
    }
    Ok(())
}

// =============================================================================
// HANDLERS
// =============================================================================

/// Runs `command` through the platform shell with the event in its
/// environment.
fn run_command(command: &str, event: &FileEvent) -> HandlerResult {
    #[cfg(unix)]
    let mut shell = {
        let mut shell = Command::new("sh");
        shell.arg("-c");
        shell
    };
    #[cfg(not(unix))]
    let mut shell = {
        let mut shell = Command::new("cmd");
        shell.arg("/C");
        shell
    };

    let status = shell
        .arg(command)
        .env("FSD_PATH", event.path.as_str())
        .env("FSD_KIND", event.kind.label())
        .env("FSD_ROOT", event.watch_root.as_str())
        .status()?;

    if status.success() {
        Ok(())
    } else {
        Err(format!("command exited with {status}").into())
    }
}

/// Logs the event.
#[allow(clippy::unnecessary_wraps)]
fn log_event(event: &FileEvent) -> HandlerResult {
    info!(kind = %event.kind, path = %event.path, "File changed");
    Ok(())
}

/// Registers the CLI's single handler for every root.
fn register_handlers(cli: &Cli, registry: &HandlerRegistry) -> color_eyre::Result<()> {
    let kinds = KindArg::kinds(&cli.on);

    for root in &cli.roots {
        let builder = HandlerBuilder::new(root.clone())
            .pattern(cli.pattern.clone())
            .kinds(kinds.iter())
            .process_existing(cli.process_existing);
        let builder = if cli.non_blocking {
            builder.non_blocking()
        } else {
            builder.blocking()
        };

        let id = match &cli.exec {
            Some(command) => {
                let command = command.clone();
                builder
                    .name("exec")
                    .register_fn(registry, move |event| run_command(&command, event))?
            }
            None => builder.name("log").register_fn(registry, log_event)?,
        };
        info!(handler_id = %id, root = %root, pattern = %cli.pattern, ?kinds, "Handler registered");
    }

    Ok(())
}

// =============================================================================
// COMMAND IMPLEMENTATION
// =============================================================================

/// Copies the observation feed to stdout as JSON lines.
fn spawn_feed_printer(
    mut feed: broadcast::Receiver<fsd_watcher::Observation>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match feed.recv().await {
                Ok(observation) => {
                    let Ok(line) = serde_json::to_string(&observation) else {
                        continue;
                    };
                    let stdout = std::io::stdout();
                    let mut handle = stdout.lock();
                    if writeln!(handle, "{line}").is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Feed output fell behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Resolves when the process is asked to stop.
async fn shutdown_signal() -> color_eyre::Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                Ok("SIGINT")
            }
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        Ok("ctrl-c")
    }
}

/// Watches until a signal arrives or the session fails.
///
/// # Errors
///
/// Returns an error if registration or startup fails, or if an event source
/// disconnects.
async fn run_watch(cli: &Cli, config: Config) -> color_eyre::Result<()> {
    for root in &cli.roots {
        validate_root(root)?;
    }

    let registry = Arc::new(HandlerRegistry::new());
    register_handlers(cli, &registry)?;

    let session = WatchSession::builder(Arc::clone(&registry))
        .config(config)
        .build()?;

    let printer = cli.feed.then(|| spawn_feed_printer(session.subscribe()));

    session.start()?;
    info!(roots = ?session.roots().collect::<Vec<_>>(), "Watching");

    let outcome = tokio::select! {
        result = session.wait() => result.map_err(color_eyre::Report::from),
        signal = shutdown_signal() => {
            info!(signal = signal?, "Received shutdown signal");
            session.shutdown().await;
            Ok(())
        }
    };

    if let Some(printer) = printer {
        printer.abort();
    }

    outcome
}

// =============================================================================
// MAIN ENTRY POINT
// =============================================================================

/// Application entry point.
#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // 1. Install color-eyre FIRST (before any potential panics)
    color_eyre::install()?;

    // 2. Parse CLI arguments
    let cli = Cli::parse();

    // 3. Initialize tracing
    init_tracing(cli.verbose, cli.no_color, cli.json_logs);

    // 4. Load configuration and run
    let config = build_config(&cli)?;
    run_watch(&cli, config).await
}
