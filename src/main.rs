//! Backhaul CLI
//!
//! `backhaul gateway` runs the public-facing gateway; `backhaul agent` runs
//! next to private services and keeps a tunnel to it.

use anyhow::{Context, Result};
use backhaul_agent::{AgentWorker, TunnelConfig};
use backhaul_gateway::{Gateway, GatewayConfig};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Backhaul - expose private HTTP services through a public gateway
#[derive(Parser, Debug)]
#[command(name = "backhaul")]
#[command(about = "Expose private HTTP services through a public gateway", long_about = None)]
#[command(version = env!("GIT_TAG"))]
#[command(long_version = concat!(env!("GIT_TAG"), "\nCommit: ", env!("GIT_HASH"), "\nBuilt: ", env!("BUILD_TIME")))]
struct Cli {
    /// Log level or filter directive (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "BACKHAUL_LOG")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway: accept agent tunnels and forward public HTTP to them
    Gateway {
        /// Address to listen on for both agents and end users
        #[arg(long, default_value = "0.0.0.0:8080", env = "BACKHAUL_LISTEN")]
        listen: SocketAddr,

        /// Shared secret agents must present (empty disables the check)
        #[arg(long, env = "BACKHAUL_PASSWORD")]
        password: Option<String>,

        /// Seconds a request waits for a free tunnel before getting 504
        #[arg(long, default_value = "30", env = "BACKHAUL_WAIT_TIMEOUT")]
        wait_timeout: u64,

        /// Seconds of silence after which an agent connection is dropped
        #[arg(long, default_value = "120", env = "BACKHAUL_IDLE_TIMEOUT")]
        idle_timeout: u64,
    },

    /// Run an agent from a tunnel.json config file
    Agent {
        /// Path to the tunnel config
        #[arg(long, short = 'c', default_value = "tunnel.json", env = "BACKHAUL_CONFIG")]
        config: PathBuf,
    },
}

/// Setup logging; `RUST_LOG` wins over `--log-level` when set
fn setup_logging(log_level: &str) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level)
            .with_context(|| format!("Invalid log level: {}", log_level))?,
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();

    Ok(())
}

/// Cancel `shutdown` on Ctrl+C
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            return;
        }
        info!("Received Ctrl+C, shutting down...");
        shutdown.cancel();
    });
}

async fn run_gateway(config: GatewayConfig, shutdown: CancellationToken) -> Result<()> {
    info!("Backhaul gateway starting...");
    let gateway = Gateway::new(config, shutdown).context("Invalid gateway configuration")?;
    gateway.run().await.context("Gateway failed")
}

async fn run_agent(path: PathBuf, shutdown: CancellationToken) -> Result<()> {
    let config = TunnelConfig::load(&path)
        .with_context(|| format!("Failed to load agent config {}", path.display()))?;

    info!("Tunnel: {}", config.name);
    info!("Gateway: {} ({})", config.server_url, config.transport);
    for rule in config.proxy.iter().filter(|r| r.enabled) {
        info!("Route {} -> {}", rule.route, rule.local_remote);
    }

    let worker = AgentWorker::new(config, shutdown).context("Failed to create agent")?;
    worker.run().await.context("Agent stopped")?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(&cli.log_level)?;

    // Both the gateway and agent dial TLS through rustls
    let _ = rustls::crypto::CryptoProvider::install_default(
        rustls::crypto::ring::default_provider(),
    );

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    match cli.command {
        Commands::Gateway {
            listen,
            password,
            wait_timeout,
            idle_timeout,
        } => {
            let mut config = GatewayConfig::new(listen)
                .with_wait_timeout(Duration::from_secs(wait_timeout))
                .with_idle_timeout(Duration::from_secs(idle_timeout));
            if let Some(password) = password {
                config = config.with_password(password);
            }
            run_gateway(config, shutdown).await
        }
        Commands::Agent { config } => run_agent(config, shutdown).await,
    }
}
