//! Kiln Orchestrator
//!
//! Deploys inference servers on local containers or Slurm clusters and keeps
//! track of them until they stop.
//!
//! Architecture:
//! - Configuration: `Config` built from the environment
//! - Repositories: PostgreSQL persistence of services
//! - Jobs: Slurm and local container handles queried over a shell
//! - Lifecycle: the service state machine, tunnels and health probes
//! - Services: the manager owning every service operation
//! - Monitor: background refresh of active services
//! - API: axum HTTP endpoints

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use kiln_remote::{ConnectionManager, OpenSshConnector};

pub mod api;
pub mod config;
pub mod db;
pub mod job;
pub mod lifecycle;
pub mod monitor;
pub mod probe;
pub mod profiles;
pub mod repository;
pub mod script;
pub mod service;
pub mod shell;
pub mod tunnel;

#[cfg(test)]
mod testing;

use crate::api::AppState;
use crate::config::Config;
use crate::lifecycle::Lifecycle;
use crate::probe::HttpProbe;
use crate::profiles::ProfileRegistry;
use crate::repository::PgServiceStore;
use crate::script::DefaultRenderer;
use crate::service::ServiceManager;
use crate::shell::PooledShells;
use crate::tunnel::SshTunnels;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "kiln_orchestrator=debug,kiln_remote=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Kiln Orchestrator...");

    let config = Config::from_env().context("Failed to read configuration")?;
    config.validate()?;

    tracing::info!("Connecting to database...");

    let pool = db::create_pool(&config.database_url)
        .await
        .context("Failed to create database pool")?;

    tracing::info!("Database connection pool created");

    db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;

    let profiles = Arc::new(
        ProfileRegistry::load(&config.profiles_path).with_context(|| {
            format!(
                "Failed to load profiles from {}",
                config.profiles_path.display()
            )
        })?,
    );
    tracing::info!("Loaded {} profile(s)", profiles.len());

    // SSH pool and the seams built on it
    let pool_config = config.pool_config();
    let connector = Arc::new(OpenSshConnector::new(&pool_config));
    let connections = ConnectionManager::new(pool_config, connector);
    connections.spawn_reclaimer();

    let shells = Arc::new(PooledShells::new(connections.clone()));
    let probe =
        HttpProbe::new(config.probe_timeout).context("Failed to build health probe client")?;
    let lifecycle = Lifecycle::new(
        shells.clone(),
        Arc::new(SshTunnels::new(config.tunnel_port_range.clone())),
        Arc::new(probe),
        Arc::new(DefaultRenderer),
    );

    let services = Arc::new(ServiceManager::new(
        Arc::new(PgServiceStore::new(pool.clone())),
        profiles.clone(),
        lifecycle,
        config.default_grace_period,
    ));

    let shutdown = CancellationToken::new();
    let monitor = monitor::spawn(
        services.clone(),
        config.refresh_interval,
        shutdown.clone(),
    );

    // Build router with all API endpoints
    let app = api::create_router(AppState {
        services,
        profiles,
        connections: connections.clone(),
        shells,
    });

    tracing::info!("Listening on {}", config.bind_addr);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Shutting down...");

    shutdown.cancel();
    if let Err(e) = monitor.await {
        tracing::warn!("Monitor task ended abnormally: {}", e);
    }
    connections.shutdown().await;
    pool.close().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
