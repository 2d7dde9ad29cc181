//! The `run` subcommand: the daemon itself.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Router};
use clap::Args;
use prometheus::{Encoder, TextEncoder};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

use incus_azure_pipelines::config::CliConfig;
use incus_azure_pipelines::daemon;
use incus_azure_pipelines::incus::{IncusClient, InstanceServer};
use incus_azure_pipelines::pool::Pool;

#[derive(Args, Debug)]
pub struct RunCmd {}

impl RunCmd {
    pub async fn run(self, config_path: &Path) -> Result<()> {
        let mut conf = CliConfig::load(config_path)
            .with_context(|| format!("loading config at {}", config_path.display()))?;
        conf.resolve_pats()?;

        let client: Arc<dyn InstanceServer> = Arc::new(IncusClient::connect()?);
        info!("connected to local incus daemon");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(watch_signals(shutdown_tx));

        let mut tasks = Vec::new();
        for pool_conf in conf.pools {
            let name = pool_conf.name.clone();
            match Pool::new(client.clone(), pool_conf) {
                Ok(pool) => tasks.push(tokio::spawn(daemon::run(
                    Arc::new(pool),
                    conf.daemon.clone(),
                    shutdown_rx.clone(),
                ))),
                Err(e) => error!(pool = %name, err = %e, "error initializing agent pool"),
            }
        }

        tasks.push(tokio::spawn(metrics_server(
            conf.metrics_port,
            shutdown_rx,
        )));

        for task in tasks {
            let _ = task.await;
        }
        Ok(())
    }
}

/// Flip the shutdown watch on SIGINT or SIGTERM.
async fn watch_signals(shutdown: watch::Sender<bool>) {
    let sigterm = signal(SignalKind::terminate());
    match sigterm {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            error!(err = %e, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
    info!("shutdown signal received");
    let _ = shutdown.send(true);
}

/// Serve the Prometheus registry until shutdown, with a 5-second drain.
async fn metrics_server(port: u16, mut shutdown: watch::Receiver<bool>) {
    info!(task = "metrics-server", port, "starting task");

    let app = Router::new().route("/metrics", get(metrics_handler));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(port, err = %e, "failed to bind metrics server");
            return;
        }
    };

    let graceful = {
        let mut shutdown = shutdown.clone();
        axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
    };

    tokio::select! {
        result = async { graceful.await } => {
            if let Err(e) = result {
                error!(err = %e, "metrics server error");
            }
        }
        _ = async {
            let _ = shutdown.wait_for(|stop| *stop).await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        } => warn!("metrics server did not drain within 5s"),
    }

    info!(task = "metrics-server", "exiting task");
}

async fn metrics_handler() -> Response {
    let families = prometheus::default_registry().gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            buffer,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}
