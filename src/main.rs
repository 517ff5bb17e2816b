//! credbroker - Credential-brokering network proxy
//!
//! This binary runs one proxy service per configured service:
//! - Resolves the service's credentials fresh for every client connection
//! - Authenticates to the backend on the client's behalf
//! - Relays all traffic transparently after authentication

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use credbroker::{
    config, BrokerError, Broker, ConnectorRegistry, HealthState, HealthStatus, Resolver, Result,
};

#[derive(Parser)]
#[command(name = "credbroker")]
#[command(version)]
#[command(about = "Network proxy that authenticates clients to backends with brokered credentials")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Override the per-connection handshake timeout (seconds, 0 = none)
    #[arg(long)]
    handshake_timeout_secs: Option<u64>,

    /// Override the per-service connection limit (0 = unlimited)
    #[arg(long)]
    max_connections: Option<usize>,

    /// Enable verbose/debug logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Priority: --verbose flag, then RUST_LOG env var, then default "info"
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt().with_env_filter(&log_level).init();

    info!("Starting credbroker v{}", env!("CARGO_PKG_VERSION"));

    let mut config = config::load_config(&cli.config)?;
    info!("Loaded configuration from {:?}", cli.config);

    if let Some(secs) = cli.handshake_timeout_secs {
        config.broker.handshake_timeout_secs = secs;
    }
    if let Some(max) = cli.max_connections {
        config.broker.max_connections = max;
    }

    let health = Arc::new(HealthState::new());
    let registry = ConnectorRegistry::with_builtins();
    info!("Connectors available: {}", registry.ids().join(", "));
    let resolver = Arc::new(Resolver::with_builtin_providers());

    let broker = Broker::launch(&config, &registry, resolver).await;
    if broker.services().is_empty() {
        error!("No service could be started");
        return Err(BrokerError::Config("no service could be started".into()));
    }
    for service in broker.services() {
        match service.local_addr() {
            Some(addr) => info!("  {} -> {} ({})", service.name(), service.listen_on(), addr),
            None => info!("  {} -> {}", service.name(), service.listen_on()),
        }
    }
    health.set_ready(broker.failures().is_empty());
    match health.status() {
        HealthStatus::Ready => info!("Health: {}", health.status()),
        status => warn!(
            "Health: {} ({} service(s) failed to start)",
            status,
            broker.failures().len()
        ),
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    health.shutting_down();
    info!("Health: {}", health.status());
    broker.stop_all().await;
    info!("Shutdown complete");

    Ok(())
}

async fn terminate() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
