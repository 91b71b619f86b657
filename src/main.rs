//! crawlsync - follow crawl progress from the command line

use clap::{Parser, Subcommand};
use crawlsync::config::{ConfigError, SyncConfig};
use crawlsync::connection::ConnectionState;
use crawlsync::observability::init_default_logging;
use crawlsync::progress::ProgressRecord;
use crawlsync::session::SyncSession;
use crawlsync::{SyncError, WorkId};
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: [&str; 2] = ["crawlsync.toml", "config/crawlsync.toml"];

/// Real-time crawl progress client
#[derive(Parser)]
#[command(name = "crawlsync")]
#[command(about = "Follow crawl job progress over the progress broker")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "CRAWLSYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and log progress updates until interrupted
    Watch {
        /// Also follow the per-job feed of this job (repeatable)
        #[arg(long = "job", value_name = "WORK_ID")]
        jobs: Vec<WorkId>,

        /// Do not subscribe to the per-user feed
        #[arg(long)]
        no_user_feed: bool,
    },
    /// Validate configuration
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_default_logging();

    info!("Starting crawlsync v{}", env!("CARGO_PKG_VERSION"));

    let config = match load_configuration(cli.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e.redacted());
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Watch { jobs, no_user_feed } => run_watch(&config, &jobs, !no_user_feed).await,
        Commands::Config { show } => handle_config_command(&config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e.redacted());
        process::exit(1);
    }

    info!("Application shutdown complete");
}

fn load_configuration(config_path: Option<&PathBuf>) -> Result<SyncConfig, SyncError> {
    if let Some(path) = config_path {
        info!("Loading configuration from: {}", path.display());
        return Ok(SyncConfig::load_from_file(path)?);
    }

    for path_str in DEFAULT_CONFIG_PATHS {
        let path = PathBuf::from(path_str);
        if path.exists() {
            info!("Loading configuration from: {}", path.display());
            return Ok(SyncConfig::load_from_file(&path)?);
        }
    }

    Err(ConfigError::InvalidConfig(
        "no configuration file found; pass -c/--config or create crawlsync.toml".to_string(),
    )
    .into())
}

async fn run_watch(
    config: &SyncConfig,
    jobs: &[WorkId],
    user_feed: bool,
) -> Result<(), SyncError> {
    let session = SyncSession::from_config(config);

    let mut destinations = Vec::new();
    if user_feed {
        destinations.push(session.destinations().user_feed().to_string());
    }
    destinations.extend(jobs.iter().map(|job| session.destinations().job_feed(*job)));
    if destinations.is_empty() {
        warn!("Nothing to watch: user feed disabled and no --job given");
        return Ok(());
    }

    info!(url = session.url(), "Connecting to progress broker");
    session.connect();

    let outcome = tokio::select! {
        _ = shutdown_signal() => Ok(()),
        result = follow(&session, &destinations) => result,
    };

    session.shutdown();
    outcome
}

async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = interrupt => info!("Received SIGINT, shutting down gracefully..."),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully..."),
    }
}

/// Subscribe on every open and stop once reconnection has given up
async fn follow(session: &SyncSession, destinations: &[String]) -> Result<(), SyncError> {
    let mut states = session.connection().watch_state();
    loop {
        let state = *states.borrow_and_update();
        match state {
            ConnectionState::Open => subscribe_missing(session, destinations),
            ConnectionState::Closed => {
                let status = session.connection().reconnect_status();
                if status.exhausted {
                    return Err(SyncError::Unreachable {
                        attempts: status.attempts,
                    });
                }
                if let Some(delay) = status.pending_delay {
                    warn!(
                        attempts = status.attempts,
                        retry_in_ms = delay.as_millis() as u64,
                        "Disconnected from progress broker"
                    );
                }
            }
            _ => {}
        }
        if states.changed().await.is_err() {
            return Ok(());
        }
    }
}

fn subscribe_missing(session: &SyncSession, destinations: &[String]) {
    for destination in destinations {
        if session.registry().is_subscribed(destination) {
            continue;
        }
        if session.watch(destination, log_record).is_none() {
            warn!(%destination, "Subscription deferred until the connection reopens");
        }
    }
    info!(
        subscriptions = session.registry().len(),
        jobs = ?session.watched_jobs(),
        "Following progress feeds"
    );
}

fn log_record(record: &ProgressRecord) {
    info!(
        work_id = record.work_id,
        state = %record.state,
        collected = record.collect_count,
        failed = record.fail_count,
        processed = record.processed_count(),
        total = record.total_count,
        progress = record.progress,
        "Crawl progress"
    );
}

fn handle_config_command(config: &SyncConfig, show: bool) -> Result<(), SyncError> {
    if show {
        println!("Current configuration:");
        match toml::to_string_pretty(config) {
            Ok(rendered) => println!("{rendered}"),
            Err(e) => warn!("Failed to render configuration: {}", e),
        }
    }

    info!("Configuration validation complete");
    Ok(())
}
