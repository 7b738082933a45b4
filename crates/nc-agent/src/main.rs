//! Nectar Agent
//!
//! Runs next to a master and keeps it linked to the orchestrator.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nc_agent::keys::{load_or_generate_master_key, public_key_line};
use nc_agent::{ActiveLink, AgentConnector, ExponentialBackoff, LinkEvent};
use nc_core::config::{self, AgentConfig};

/// Interval between keepalive pings on an established link
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "nc-agent")]
#[command(about = "Nectar agent - links a master to its orchestrator")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Orchestrator agent listener (host:port)
    #[arg(short, long)]
    orchestrator: Option<String>,

    /// Organization this master belongs to
    #[arg(long, env = "NECTAR_ORGANIZATION")]
    organization: Option<String>,

    /// Provisioning grant handed out by the orchestrator
    #[arg(long, env = "NECTAR_GRANT", hide_env_values = true)]
    grant: Option<String>,

    /// Path to private key (generated if missing)
    #[arg(short, long)]
    key: Option<PathBuf>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&args)?;

    let key = load_or_generate_master_key(&config.private_key_path).await?;
    tracing::info!("Master public key: {}", public_key_line(&key)?);

    let mut backoff = ExponentialBackoff::from_config(&config.backoff);
    let connector = AgentConnector::new(config, key)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    loop {
        let link = tokio::select! {
            _ = cancel.cancelled() => break,
            result = connector.connect_with_retry(&mut backoff) => result?,
        };

        if let Some(endpoint) = link.endpoint() {
            tracing::info!("Orchestrator endpoint: {}", endpoint);
        }

        if !run_link(link, &cancel).await {
            break;
        }

        tracing::info!("Link lost, reconnecting");
    }

    tracing::info!("Agent shutdown complete");
    Ok(())
}

fn load_config(args: &Args) -> Result<AgentConfig> {
    let mut config: AgentConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => config::load_config_or_default(&config::default_agent_config_path())
            .context("Failed to load agent config")?,
    };

    if let Some(orchestrator) = &args.orchestrator {
        config.orchestrator_address = orchestrator.clone();
    }
    if let Some(organization) = &args.organization {
        config.organization = organization.clone();
    }
    if let Some(grant) = &args.grant {
        config.grant = Some(grant.clone());
    }
    if let Some(key) = &args.key {
        config.private_key_path = key.clone();
    }

    if config.organization.is_empty() {
        anyhow::bail!("No organization configured; pass --organization");
    }
    Ok(config)
}

/// Serve an approved link until it drops (true) or shutdown is requested
/// (false)
async fn run_link(mut link: ActiveLink, cancel: &CancellationToken) -> bool {
    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = link.close().await {
                    tracing::debug!("Error closing link: {}", e);
                }
                return false;
            }

            _ = ping.tick() => {
                if let Err(e) = link.ping().await {
                    tracing::warn!("Ping failed: {}", e);
                    return true;
                }
            }

            event = link.recv_event() => match event {
                Some(LinkEvent::Data(data)) => {
                    tracing::debug!("Received {} bytes from orchestrator", data.len());
                }
                Some(LinkEvent::Pong { timestamp }) => {
                    tracing::trace!(
                        "Pong, latency={}ms",
                        nc_core::time::elapsed_millis(timestamp)
                    );
                }
                Some(LinkEvent::Closed { reason }) => {
                    tracing::warn!(
                        "Orchestrator closed the link: {}",
                        reason.as_deref().unwrap_or("no reason given")
                    );
                    return true;
                }
                Some(LinkEvent::Refused { kind, reason }) => {
                    tracing::warn!("Orchestrator refused us ({}): {}", kind, reason);
                    return true;
                }
                Some(LinkEvent::Accepted { .. }) => {}
                None => return true,
            }
        }
    }
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }

    cancel.cancel();
}
