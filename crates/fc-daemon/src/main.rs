//! fc-daemon — binds the HTTP/WS front door and runs the background jobs
//! for the Session Coordinator, Fleet Manager, Update Pipeline, and
//! Realtime Fan-out.

use anyhow::{Context, Result};
use fc_core::config::Config;
use fc_telemetry::logging::LogFormat;
use tokio::net::TcpListener;
use tracing::info;

mod api;
mod daemon;
mod error;
mod rate_limit_middleware;
mod rollout_metrics;

use daemon::Daemon;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load().unwrap_or_else(|e| {
        eprintln!("failed to load config, using defaults: {e}");
        Config::default()
    });

    fc_telemetry::logging::init(&config.general.log_level, LogFormat::Pretty);

    info!(project = %config.general.project_name, "fc-daemon starting");

    let addr = format!("{}:{}", config.daemon.host, config.daemon.port);
    let listener = TcpListener::bind(&addr).await.with_context(|| format!("failed to bind {addr}"))?;

    let daemon = Daemon::new(config).await.context("failed to construct daemon")?;
    let shutdown = daemon.shutdown_handle();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    info!(addr = %addr, "fc-daemon ready");
    daemon.run_with_listener(listener).await?;

    info!("fc-daemon shutdown complete");
    Ok(())
}
