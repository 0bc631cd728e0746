//! EnvoyNPM daemon entry point.

use std::time::Duration;

use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod cache;
mod config;
mod error;
mod extract;
mod health;
mod npm_api;
mod reconciler;
mod runtime;
mod types;

use config::Config;
use health::run_health_server;
use npm_api::NpmClient;
use reconciler::Reconciler;
use runtime::{ContainerRuntime, DockerRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::load()?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cfg.log_level))
        .init();
    info!("Starting EnvoyNPM with config: {:?}", cfg);

    let cancel = CancellationToken::new();

    let api = NpmClient::from_config(&cfg)?;
    let runtime = DockerRuntime::connect(cfg.docker_socket.as_deref()).await?;

    // Health endpoint
    let health_addr = cfg.health_addr();
    let health_cancel = cancel.clone();
    let health_handle = tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_cancel).await {
            error!("Health endpoint failed: {}", e);
        }
    });

    // Container events
    let (event_tx, event_rx) = mpsc::channel(128);
    let monitor = runtime.clone();
    let monitor_cancel = cancel.clone();
    let monitor_handle = tokio::spawn(async move {
        if let Err(e) = monitor.monitor(event_tx, monitor_cancel).await {
            error!("Docker event monitor failed: {}", e);
        }
    });

    // Initial sync, then the reconcile loop
    let mut reconciler = Reconciler::new(api, runtime);
    if let Err(e) = reconciler.start().await {
        cancel.cancel();
        let _ = tokio::join!(health_handle, monitor_handle);
        return Err(e.into());
    }
    let reconcile_handle = tokio::spawn(reconciler.run(
        event_rx,
        Duration::from_secs(cfg.sync_interval),
        cancel.clone(),
    ));

    shutdown_signal().await;
    cancel.cancel();

    let (health, monitor, reconcile) =
        tokio::join!(health_handle, monitor_handle, reconcile_handle);
    for result in [health, monitor, reconcile] {
        if let Err(e) = result {
            warn!("Task ended abnormally: {}", e);
        }
    }

    info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
