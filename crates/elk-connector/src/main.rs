//! appmetrics-elk: forwards metric events to Elasticsearch.
//!
//! Reads newline-delimited JSON events from stdin:
//!
//! ```text
//! {"event": "cpu", "data": {"process": 0.12, "system": 0.4, "time": 1700000000000}}
//! ```
//!
//! Usage:
//!   appmetrics-elk [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>             Config file path (default: config/connector.toml)
//!   --elasticsearch-url <URL>       Elasticsearch URL (overrides config)
//!   --index <INDEX>                 Destination index (overrides config)
//!   --app <NAME>                    Application label (overrides config)
//!   --dry-run                       Record requests in memory instead of sending them

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use elk_common::{DatastoreClient, InMemoryDatastore};
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use elk_connector::{Connector, ConnectorConfig, EventBus, PublisherHandle};

/// Interval between stats log lines.
const STATS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// CLI arguments for appmetrics-elk.
#[derive(Parser, Debug)]
#[command(name = "appmetrics-elk")]
#[command(about = "Forward appmetrics events to Elasticsearch")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/connector.toml")]
    config: PathBuf,

    /// Elasticsearch URL (overrides config file)
    #[arg(long, env = "ELASTICSEARCH_URL")]
    elasticsearch_url: Option<String>,

    /// Destination index (overrides config file)
    #[arg(long)]
    index: Option<String>,

    /// Application label stamped on every document
    #[arg(long)]
    app: Option<String>,

    /// Record requests in memory instead of sending them
    #[arg(long)]
    dry_run: bool,
}

/// One line of input.
#[derive(Debug, Deserialize)]
struct InputEvent {
    event: String,
    #[serde(default)]
    data: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_missing = !args.config.exists();
    let mut config = if config_missing {
        ConnectorConfig::default()
    } else {
        ConnectorConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    };

    config.apply_overrides(args.index, args.app, args.elasticsearch_url);

    // Initialize logging
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    // Events arrive on stdin, so logs go to stderr
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    if config_missing {
        warn!("Config file not found at {:?}, using defaults", args.config);
    }

    info!("Starting appmetrics-elk");
    info!(index = %config.index, url = %config.elasticsearch.url, dry_run = args.dry_run, "Configuration");

    let connector = if args.dry_run {
        let store: Arc<dyn DatastoreClient> = Arc::new(InMemoryDatastore::default());
        Connector::with_client(config, store)
    } else {
        Connector::new(config).context("Failed to create Elasticsearch client")?
    };

    // Create shutdown channel (capacity for all subscribers)
    let (shutdown_tx, _) = broadcast::channel::<()>(4);

    let bus = EventBus::new();
    let running = connector.start(&bus, shutdown_tx.subscribe()).await;
    info!(
        version = %running.version(),
        subscribed = running.subscribed().len(),
        "Connector running"
    );

    let stats_handle = spawn_stats_task(
        running.publisher().clone(),
        STATS_LOG_INTERVAL,
        shutdown_tx.subscribe(),
    );
    let mut input = spawn_input_task(bus);

    // Wait for shutdown signal or end of input
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = &mut input => {
                info!("Input closed");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C");
            }
            _ = &mut input => {
                info!("Input closed");
            }
        }
    }

    info!("Initiating graceful shutdown...");
    input.abort();
    let _ = shutdown_tx.send(());

    // Wait for the final flush with timeout
    let shutdown_timeout = Duration::from_secs(10);

    tokio::select! {
        result = async {
            let _ = stats_handle.await;
            running.join().await
        } => {
            match result {
                Ok(stats) => info!(
                    recorded = stats.recorded,
                    written = stats.written,
                    rejected = stats.rejected,
                    discarded = stats.discarded,
                    "Publisher drained"
                ),
                Err(e) => warn!(error = %e, "Publisher did not stop cleanly"),
            }
        }
        _ = tokio::time::sleep(shutdown_timeout) => {
            warn!("Shutdown timeout exceeded, forcing exit");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Spawn the stdin reader; completes at end of input.
fn spawn_input_task(bus: EventBus) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut line_no = 0u64;

        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<InputEvent>(&line) {
                        Ok(input) => {
                            if bus.emit(&input.event, &input.data) == 0 {
                                debug!(event = %input.event, "No listener for event");
                            }
                        }
                        Err(e) => warn!(error = %e, line = line_no, "Skipping malformed event"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to read input");
                    break;
                }
            }
        }
    })
}

/// Spawn the stats logging task.
fn spawn_stats_task(
    publisher: PublisherHandle,
    log_interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = interval(log_interval);
        // First tick completes immediately
        timer.tick().await;

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let stats = publisher.stats_snapshot();
                    info!(
                        recorded = stats.recorded,
                        flushes = stats.flushes,
                        written = stats.written,
                        rejected = stats.rejected,
                        write_errors = stats.write_errors,
                        pending = stats.pending(),
                        "Publisher stats"
                    );
                }
                _ = shutdown.recv() => {
                    debug!("Stats logger received shutdown signal");
                    break;
                }
            }
        }
    })
}
