mod catalog;
mod cli;
mod config;
mod downstream;
mod gateway;
mod policy;
mod protocol;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use catalog::{ServerState, ToolCatalog};
use downstream::DownstreamManager;
use downstream::health::run_health_monitor;
use gateway::GatewayTools;
use policy::PolicyManager;
use server::GatewayServer;

#[tokio::main]
async fn main() -> Result<()> {
    let mut cli = cli::Cli::parse();

    // Env vars fill in anything the flags left unset
    if cli.config.is_none()
        && let Ok(path) = std::env::var("MCP_GATEWAY_CONFIG")
    {
        cli.config = Some(PathBuf::from(path));
    }
    if cli.policy.is_none()
        && let Ok(path) = std::env::var("MCP_GATEWAY_POLICY")
    {
        cli.policy = Some(PathBuf::from(path));
    }
    if let Ok(level) = std::env::var("MCP_GATEWAY_LOG_LEVEL") {
        cli.log_level = level;
    }

    // Logs go to stderr so the host transport owns stdout
    let filter = EnvFilter::try_new(cli.effective_log_level())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting MCP gateway");

    let policy = Arc::new(match &cli.policy {
        Some(path) => PolicyManager::load(path).context("failed to load policy")?,
        None => PolicyManager::default(),
    });

    let catalog = Arc::new(ToolCatalog::new());
    let manager = DownstreamManager::new(Arc::clone(&catalog), policy.max_tools_per_server());

    // Initial connect: per-server failures are collected, not fatal
    let configs = config::load_configs(cli.project.as_deref(), cli.config.as_deref())
        .context("failed to load server configs")?;
    let allowed: Vec<_> = configs
        .into_iter()
        .filter(|c| {
            let ok = policy.is_server_allowed(&c.name);
            if !ok {
                info!(server = %c.name, "server blocked by policy");
            }
            ok
        })
        .collect();

    if allowed.is_empty() {
        warn!("no MCP servers configured or all blocked by policy");
    } else {
        info!(servers = allowed.len(), "found allowed server configs");
    }

    let errors = manager.connect_all(&allowed).await;
    if !errors.is_empty() {
        warn!(errors = errors.len(), "some servers failed to connect");
    }

    let statuses = manager.server_statuses();
    let online = statuses
        .iter()
        .filter(|s| s.status == ServerState::Online)
        .count();
    info!(
        online,
        total = statuses.len(),
        tools = catalog.tool_count(),
        "gateway initialized"
    );

    let shutdown = Arc::new(tokio::sync::Notify::new());
    tokio::spawn(run_health_monitor(
        Arc::clone(&manager),
        Arc::clone(&shutdown),
    ));

    let tools = GatewayTools::new(
        Arc::clone(&manager),
        Arc::clone(&policy),
        cli.project.clone(),
        cli.config.clone(),
    );
    let gateway = GatewayServer::new(tools, Arc::clone(&manager));

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            result = gateway.serve(tokio::io::stdin(), tokio::io::stdout()) => {
                if let Err(e) = result {
                    warn!(error = %e, "host transport exited with error");
                }
            }
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = sigint.recv() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = gateway.serve(tokio::io::stdin(), tokio::io::stdout()).await {
            warn!(error = %e, "host transport exited with error");
        }
    }

    info!("shutting down");
    shutdown.notify_waiters();
    manager.disconnect_all().await;
    info!("gateway shut down");

    Ok(())
}
