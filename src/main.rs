//! R0N Relay binary entry point.
//!
//! Loads configuration, starts the UDP relay and feeds the backend registry
//! from the watch feed until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use r0n_relay::config::{ConfigLoader, LogFormat, LogLevel, RelayConfig};
use r0n_relay::module::{ModuleConfig, ModuleContract};
use r0n_relay::modules::logging;
use r0n_relay::modules::registry::BackendRegistry;
use r0n_relay::modules::udp_relay::UdpRelay;
use r0n_relay::modules::watch::{open_feed, WatchConsumer, WatchFilter};

#[derive(Parser, Debug)]
#[command(name = "r0n-relay", author, version, about = "Session-affine UDP relay")]
struct Cli {
    /// Path to the TOML configuration file (defaults apply if it is missing)
    #[arg(short, long, env = "R0N_RELAY_CONFIG", default_value = "r0n-relay.toml")]
    config: PathBuf,

    /// Client-facing UDP port
    #[arg(long, env = "R0N_RELAY_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Port datagrams are forwarded to on each backend
    #[arg(long, env = "R0N_RELAY_BACKEND_PORT")]
    backend_port: Option<u16>,

    /// Watch feed source, a file path or `-` for stdin
    #[arg(long, env = "R0N_RELAY_WATCH_SOURCE")]
    watch_source: Option<String>,

    /// Log level
    #[arg(long, env = "R0N_RELAY_LOG_LEVEL")]
    log_level: Option<LogLevel>,

    /// Emit JSON logs
    #[arg(long, env = "R0N_RELAY_LOG_JSON", default_value_t = false)]
    log_json: bool,
}

impl Cli {
    /// Layer command-line overrides on top of the file configuration.
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(port) = self.listen_port {
            config.relay.listen_port = port;
        }
        if let Some(port) = self.backend_port {
            config.relay.backend_port = port;
        }
        if let Some(source) = &self.watch_source {
            config.watch.source.clone_from(source);
        }
        if let Some(level) = self.log_level {
            config.logging.level = level;
        }
        if self.log_json {
            config.logging.format = LogFormat::Json;
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to build tokio runtime")?;
    let result = runtime.block_on(run(cli));

    // The stdin reader can stay parked in a blocking read after shutdown.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loader = ConfigLoader::with_default_validators();
    let mut config = loader
        .load_or_default(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    cli.apply(&mut config);
    loader.validate(&config)?;

    logging::init(&config.logging)?;
    info!(
        name = %config.name,
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "Starting R0N Relay"
    );

    let registry = Arc::new(BackendRegistry::new());
    let mut relay = UdpRelay::new(Arc::clone(&registry));
    relay.init(ModuleConfig::from_settings(&config.relay)?)?;
    relay.start()?;

    let feed = open_feed(&config.watch).await?;
    let consumer = WatchConsumer::new(registry, WatchFilter::from_settings(&config.watch));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watch_task = tokio::spawn(async move { consumer.run(feed, shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown signal received");

    let _ = shutdown_tx.send(true);
    match watch_task.await {
        Ok(Ok(stats)) => info!(
            applied = stats.applied,
            rejected = stats.rejected,
            out_of_scope = stats.out_of_scope,
            "Watch consumer stopped"
        ),
        Ok(Err(e)) => warn!(error = %e, "Watch consumer failed"),
        Err(e) => warn!(error = %e, "Watch consumer task panicked"),
    }

    relay.stop()?;
    let stats = relay.stats();
    info!(
        datagrams_received = stats.datagrams_received,
        datagrams_forwarded = stats.datagrams_forwarded,
        datagrams_to_clients = stats.datagrams_to_clients,
        bindings_created = stats.bindings.total_created,
        "R0N Relay stopped"
    );

    Ok(())
}
