//! Chargie charge-management daemon
//!
//! Runs the charge engine and its HTTP control surface, or acts as a
//! thin command-line client against a running daemon.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

// CLI definitions
mod cli;
use cli::{Cli, Commands};

// HTTP client for the daemon subcommands
mod client;

use chargie_transport::{BleTransport, BoxedTransport};
use chargied::battery::BatteryReader;
use chargied::config;
use chargied::engine::ChargeEngine;
use chargied::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default: run the daemon
        None => run_daemon(None, None, None).await,
        Some(Commands::Daemon {
            config,
            port,
            log_level,
        }) => run_daemon(config, port, log_level).await,

        Some(Commands::Status { url }) => client::status(&url).await,
        Some(Commands::SetMax { value, url }) => client::set_max(&url, value).await,
        Some(Commands::SetMin { value, url }) => client::set_min(&url, value).await,
        Some(Commands::Scan { url }) => client::scan(&url).await,
        Some(Commands::Disconnect { url }) => client::disconnect(&url).await,
        Some(Commands::Stop { url }) => client::stop(&url).await,
    }
}

async fn run_daemon(
    config_path: Option<PathBuf>,
    port: Option<u16>,
    log_level: Option<String>,
) -> anyhow::Result<()> {
    let mut config = config::load_config(config_path.as_deref())?;
    let state_path = config::default_state_path();
    if let Some(path) = &state_path {
        config::load_state(&mut config, path);
    }
    if let Some(port) = port {
        config.daemon.port = port;
    }
    if let Some(level) = log_level {
        config.daemon.log_level = level;
    }

    let default_filter = format!(
        "chargied={level},chargie_transport={level}",
        level = config.daemon.log_level
    );
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    info!("chargied v{} starting", env!("CARGO_PKG_VERSION"));
    info!(
        "Charge max: {}%, charge min: {}%, PD mode: {}",
        config.charge.charge_max,
        config.charge.charge_min,
        config.charge.pd_mode.as_int()
    );

    let transport: BoxedTransport = Arc::new(
        BleTransport::new()
            .await
            .context("failed to open Bluetooth adapter")?,
    );
    let battery = Arc::new(BatteryReader::default());
    let engine = ChargeEngine::new(transport, battery, config.charge);

    if let Some(path) = state_path {
        engine.set_persist_hook(move |charge| {
            if let Err(e) = config::save_state(&path, charge) {
                warn!("Failed to persist state: {e}");
            }
        });
    }

    let start_task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            if let Err(e) = engine.start().await {
                warn!("Initial start failed: {e}");
            }
        })
    };

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let app = server::router(AppState {
        engine: Arc::clone(&engine),
        shutdown: shutdown_tx,
    });

    let addr = format!("127.0.0.1:{}", config.daemon.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("HTTP server listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await?;

    start_task.abort();
    match tokio::time::timeout(Duration::from_secs(5), engine.stop()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Shutdown incomplete: {e}"),
        Err(_) => warn!("Engine stop timed out after 5s"),
    }
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on SIGTERM, SIGINT, or an `/api/shutdown` request.
async fn wait_for_shutdown(mut shutdown_rx: mpsc::Receiver<()>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {e}");
            let _ = shutdown_rx.recv().await;
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to install SIGINT handler: {e}");
            let _ = shutdown_rx.recv().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        _ = sigint.recv() => info!("Received SIGINT, shutting down..."),
        _ = shutdown_rx.recv() => info!("Shutdown requested, stopping..."),
    }
}
