//! KATCP to Prometheus bridge.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use clap::builder::BoolishValueParser;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use katcp_prometheus_bridge::{
    BridgeConfig, HttpServer, KatcpClient, SensorFilter, SensorStore, SensorWatcher,
};

/// Capacity of the client to watcher event channel.
const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// Time allowed for tasks to finish after a shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Expose the sensors of a KATCP device as Prometheus metrics.
#[derive(Parser, Debug)]
#[command(name = "katcp-prometheus-bridge")]
#[command(about = "Expose KATCP device sensors as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// KATCP device host (overrides config).
    #[arg(long, env = "KATCP_HOST")]
    katcp_host: Option<String>,

    /// KATCP device port (overrides config).
    #[arg(long, env = "KATCP_PORT")]
    katcp_port: Option<u16>,

    /// Port to serve metrics on (overrides config).
    #[arg(long, env = "METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Export string and address sensors as indices of the values seen so far.
    #[arg(
        long,
        env = "WORKAROUND_STRINGS",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    workaround_strings: Option<bool>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    /// Load the configuration file, if any, and apply overrides on top.
    fn into_config(self) -> anyhow::Result<BridgeConfig> {
        let mut config = match &self.config {
            Some(path) => BridgeConfig::load_from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(host) = self.katcp_host {
            config.katcp.host = Some(host);
        }
        if let Some(port) = self.katcp_port {
            config.katcp.port = Some(port);
        }
        if let Some(port) = self.metrics_port {
            config.prometheus.set_port(port)?;
        }
        if let Some(enabled) = self.workaround_strings {
            config.katcp.workaround_strings = enabled;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Args::parse().into_config()?;

    katcp_common::init_tracing(&config.logging)?;

    info!(
        device = %config.katcp.address()?,
        listen = %config.prometheus.listen,
        workaround_strings = config.katcp.workaround_strings,
        "Starting KATCP Prometheus bridge"
    );

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let store = Arc::new(SensorStore::new(config.prometheus.clone()));
    let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

    let listen_addr: SocketAddr = config
        .prometheus
        .listen
        .parse()
        .with_context(|| format!("Invalid listen address: {}", config.prometheus.listen))?;

    // Create components
    let client = KatcpClient::new(
        &config.katcp,
        SensorFilter::new(&config.filters),
        event_tx,
    )?;
    let watcher = SensorWatcher::new(store.clone(), config.katcp.workaround_strings);
    let http_server = HttpServer::new(
        store.clone(),
        listen_addr,
        config.prometheus.path.clone(),
    );
    let listener = http_server.bind().await?;

    // The watcher stops once the client drops its sender
    let watcher_task = tokio::spawn(watcher.run(event_rx));

    let client_task = tokio::spawn(client.run(shutdown_rx.clone()));

    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.serve(listener, http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    let signal = wait_for_signal().await;
    info!(signal, "Shutting down");

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to complete
    let stats = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
        let _ = client_task.await;
        let _ = http_task.await;
        watcher_task.await.ok()
    })
    .await
    .ok()
    .flatten();

    // Print final stats
    match stats {
        Some(stats) => info!(
            declarations = stats.declarations,
            updates = stats.updates,
            updates_exposed = stats.updates_exposed,
            updates_suppressed = stats.updates_suppressed,
            updates_ignored = stats.updates_ignored,
            decode_errors = stats.decode_errors,
            type_conflicts = stats.type_conflicts,
            interface_changes = stats.interface_changes,
            sensors = store.sensor_count(),
            exposed = store.exposed_count(),
            "Final statistics"
        ),
        None => warn!("Timed out waiting for tasks to stop"),
    }

    info!("Bridge stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM, returning the name of the signal.
async fn wait_for_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = sigterm.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl+C: {}", e);
                }
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        "SIGINT"
    }
}
