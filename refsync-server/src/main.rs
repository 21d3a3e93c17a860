//! refsync server
//!
//! Runs either side of the referee match-assignment event layer: the
//! producer that publishes match lists, or the consumer that keeps the
//! calendar in sync. Also ships the operator commands `check` and `status`.

mod adapters;
mod config;
mod server;
mod shutdown;
mod state;

use adapters::{HttpCalendarSync, LoggingCalendarSync, Producer};
use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use config::ConfigLoader;
use config::runtime::LoadedConfig;
use refsync_core::broker::{Connector, MemoryBroker};
use refsync_core::broker::redis::RedisConnector;
use refsync_core::config::ConfigStore;
use refsync_core::harness::Harness;
use refsync_core::processors::{CalendarSync, MessageDispatcher};
use refsync_core::publisher::Publisher;
use refsync_core::subscriber::Subscriber;
use refsync_sdk::objects::EventType;
use serde_json::json;
use server::{build_router, run_server};
use shutdown::{shutdown_signal, spawn_config_reload_handler};
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// refsync - event layer for referee match assignments
#[derive(Parser, Debug)]
#[command(name = "refsync-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./refsync.toml", env = "REFSYNC_CONFIG")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Poll the match list and publish changes
    Producer,
    /// Subscribe, sync the calendar, serve /health and /status
    Consumer {
        /// Override the status listen address (e.g., 0.0.0.0:8080)
        #[arg(short, long)]
        listen: Option<SocketAddr>,
    },
    /// Run connectivity, round-trip and performance checks
    Check {
        /// Round-trip timeout in milliseconds
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
        /// Probes for the performance check (0 skips it)
        #[arg(long, default_value_t = 100)]
        messages: usize,
    },
    /// Print a one-shot broker status report
    Status,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    tracing::info!("Starting refsync-server v{}", env!("CARGO_PKG_VERSION"));

    let config_loader = Arc::new(ConfigLoader::new(&args.config));
    let loaded = config_loader.load().map_err(|e| {
        tracing::error!("Failed to load configuration: {}", e);
        e
    })?;
    tracing::info!("Configuration loaded from {}", config_loader.path().display());

    match args.command {
        Command::Producer => run_producer(loaded, config_loader).await,
        Command::Consumer { listen } => run_consumer(loaded, listen).await,
        Command::Check {
            timeout_ms,
            messages,
        } => run_check(loaded, Duration::from_millis(timeout_ms), messages).await,
        Command::Status => run_status(loaded).await,
    }
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,refsync_core=info"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn build_connector(loaded: &LoadedConfig) -> anyhow::Result<Arc<dyn Connector>> {
    let connector = RedisConnector::new(&loaded.redis_url)
        .with_context(|| format!("invalid redis url {}", loaded.redis_url))?
        .with_timeout(loaded.messaging.connection.connect_timeout);
    Ok(Arc::new(connector))
}

/// With messaging disabled the subscriber never starts, so `redis_url` is
/// not parsed and an idle in-process broker stands in.
fn consumer_connector(loaded: &LoadedConfig) -> anyhow::Result<Arc<dyn Connector>> {
    if loaded.messaging.enabled {
        build_connector(loaded)
    } else {
        Ok(Arc::new(MemoryBroker::new()))
    }
}

async fn run_producer(
    loaded: LoadedConfig,
    config_loader: Arc<ConfigLoader>,
) -> anyhow::Result<()> {
    let publisher = if loaded.messaging.enabled {
        let connector = build_connector(&loaded)?;
        Some(Arc::new(Publisher::new(connector, loaded.messaging.clone())))
    } else {
        tracing::warn!("Messaging disabled, every poll goes to the HTTP fallback");
        None
    };

    let producer_store = ConfigStore::new(loaded.producer);
    let reload_notify = spawn_config_reload_handler(config_loader, producer_store.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let producer = Producer::new(
        publisher,
        producer_store,
        loaded.messaging.source.clone(),
        shutdown_rx,
    );
    let handle = tokio::spawn(producer.run());

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
    reload_notify.notify_one();
    handle.await.context("producer task failed")?;

    tracing::info!("Producer shutdown complete");
    Ok(())
}

async fn run_consumer(loaded: LoadedConfig, listen: Option<SocketAddr>) -> anyhow::Result<()> {
    let calendar: Arc<dyn CalendarSync> = match loaded.consumer.calendar_sync_url.clone() {
        Some(url) => {
            tracing::info!("Calendar sync target: {}", url);
            Arc::new(HttpCalendarSync::new(url))
        }
        None => {
            tracing::warn!("No calendar_sync_url configured, snapshots are only logged");
            Arc::new(LoggingCalendarSync)
        }
    };
    let dispatcher = Arc::new(MessageDispatcher::new(calendar));

    let connector = consumer_connector(&loaded)?;
    let subscriber = Arc::new(Subscriber::new(connector, loaded.messaging.clone()));
    for event_type in EventType::ALL {
        subscriber.register_handler(event_type, dispatcher.clone());
    }

    // The broker may come up after us; keep trying in the background.
    let starter = if loaded.messaging.enabled {
        let subscriber = subscriber.clone();
        let backoff = loaded.messaging.connection.retry_delay.max(Duration::from_secs(1));
        Some(tokio::spawn(async move {
            while !subscriber.start_subscription(None).await {
                tracing::warn!(
                    retry_in_ms = backoff.as_millis() as u64,
                    "Subscription not started, retrying"
                );
                tokio::time::sleep(backoff).await;
            }
        }))
    } else {
        tracing::warn!("Messaging disabled, consumer only serves status");
        None
    };

    let addr = listen.unwrap_or(loaded.consumer.status_listen);
    let router = build_router(AppState::new(subscriber.clone(), dispatcher));
    let result = run_server(router, addr).await;

    if let Some(starter) = starter {
        starter.abort();
    }
    tracing::info!("Closing subscription...");
    subscriber.close().await;
    tracing::info!("Consumer shutdown complete");

    result.context("status server failed")
}

async fn run_check(loaded: LoadedConfig, timeout: Duration, messages: usize) -> anyhow::Result<()> {
    let connector = build_connector(&loaded)?;
    let report = Harness::new(connector, loaded.messaging)
        .run_all(timeout, messages)
        .await;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.passed() {
        anyhow::bail!("messaging checks failed");
    }
    Ok(())
}

async fn run_status(loaded: LoadedConfig) -> anyhow::Result<()> {
    let connector = build_connector(&loaded)?;
    let broker = connector.describe();
    let publisher = Publisher::new(connector, loaded.messaging.clone());

    let mut streams = serde_json::Map::new();
    for event_type in [
        EventType::MatchesSnapshot,
        EventType::SystemAlert,
        EventType::ServiceStarted,
    ] {
        let len = publisher.stream_len(event_type).await;
        streams.insert(
            publisher.channel_names().stream_key(event_type),
            json!(len),
        );
    }
    let state = publisher.connection_state().await;
    publisher.close().await;

    let report = json!({
        "enabled": loaded.messaging.enabled,
        "broker": broker,
        "connected": state.connected,
        "last_error": state.last_error,
        "namespace": loaded.messaging.namespace,
        "streams": streams,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
