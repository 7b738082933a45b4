//! Nectar Orchestrator Daemon
//!
//! Accepts inbound SSH connections from masters and decides whether to
//! trust them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nc_core::config::{self, OrchestratorConfig};
use nc_orchestrator::{
    load_or_generate_host_key, MasterEvent, MasterIdentity, MasterProvisioner, Orchestrator,
    ProvisionRequest,
};

#[derive(Parser)]
#[command(name = "nc-orchestrator")]
#[command(about = "Nectar orchestrator daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Agent listener bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Create and provision a master (repeatable)
    #[arg(long, value_name = "ORG")]
    provision: Vec<String>,

    /// Create an attachable master, optionally approving the public key in
    /// the given file (repeatable)
    #[arg(long, value_name = "ORG[=PUBKEY_FILE]")]
    attach: Vec<String>,
}

/// Prints the grant so the operator can hand it to the master
struct ConsoleProvisioner;

#[async_trait]
impl MasterProvisioner for ConsoleProvisioner {
    async fn provision(&self, request: ProvisionRequest) -> Result<()> {
        println!(
            "{}: grant={} endpoint={}",
            request.organization,
            request.grant.expose(),
            request.endpoint
        );
        Ok(())
    }
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

    tracing::info!("Nectar orchestrator starting...");

    let config: OrchestratorConfig = match &args.config {
        Some(path) => config::load_config(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => {
            let default_path = config::default_config_path();
            config::load_config_or_default(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                OrchestratorConfig::default()
            })
        }
    };

    let bind_addr = args.bind.clone().unwrap_or_else(|| config.bind_address.clone());

    let host_key = load_or_generate_host_key(&config.host_key_path).await?;
    let host_public = host_key
        .clone_public_key()
        .context("Failed to derive host public key")?;
    tracing::info!("Host key fingerprint: {}", host_public.fingerprint());

    let (orchestrator, events) = Orchestrator::new(config, host_key, Arc::new(ConsoleProvisioner))?;
    let orchestrator = Arc::new(orchestrator);

    seed_masters(&orchestrator, &args).await?;

    tokio::spawn(log_events(events));

    // The daemon keeps running without a listener; the alert says why
    if let Err(e) = orchestrator.configure_agent_listener(&bind_addr).await {
        tracing::error!("Agent listener unavailable: {}", e);
    }

    wait_for_shutdown_signal().await;

    orchestrator.shutdown().await;
    tracing::info!("Orchestrator shutdown complete");
    Ok(())
}

/// Create the masters named on the command line
async fn seed_masters(orchestrator: &Orchestrator, args: &Args) -> Result<()> {
    for name in &args.provision {
        orchestrator
            .create_and_provision(name)
            .await
            .with_context(|| format!("Failed to provision master {}", name))?;
    }

    for entry in &args.attach {
        let (name, key_path) = match entry.split_once('=') {
            Some((name, path)) => (name, Some(PathBuf::from(path))),
            None => (entry.as_str(), None),
        };

        let master = orchestrator
            .create_attachable(name)
            .await
            .with_context(|| format!("Failed to create master {}", name))?;

        if let Some(path) = key_path {
            let line = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read public key {:?}", path))?;
            let identity = MasterIdentity::from_openssh(&line)?;
            master.approve_manually(identity).await?;
        }
    }

    Ok(())
}

async fn log_events(mut events: mpsc::Receiver<MasterEvent>) {
    while let Some(event) = events.recv().await {
        event.log();
    }
}

async fn wait_for_shutdown_signal() {
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
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown...");
        }
    }
}
