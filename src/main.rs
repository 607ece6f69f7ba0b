//! probeline - Network Latency Measurement Pipeline
//!
//! Probes a remote peer over ICMP, UDP, TCP and HTTP, appends every attempt
//! to a newline-delimited JSON log and serves windowed percentiles over it.

mod config;
mod eventlog;
mod probe;
mod query;
mod scheduler;
mod web;

use config::ServerConfig;
use eventlog::LogStore;
use scheduler::{Pipeline, PipelineMetrics};
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("probeline=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load()?;
    tracing::info!("Starting probeline on port {}...", cfg.http_port);
    tracing::info!("Using measurement log at {}", cfg.log_path);

    let metrics = Arc::new(PipelineMetrics::new());

    // Start the collector only when there is something to probe
    let pipeline = match &cfg.target {
        Some(target) if !cfg.protocols.is_empty() => {
            let store = LogStore::open(&cfg.log_path)?;
            tracing::info!(
                "Probing {} over {}",
                target,
                cfg.protocols
                    .iter()
                    .map(|c| c.protocol.as_str())
                    .collect::<Vec<_>>()
                    .join(",")
            );
            Some(Pipeline::start(
                cfg.protocols.clone(),
                store,
                cfg.pipeline,
                metrics.clone(),
            ))
        }
        _ => {
            tracing::info!("No target configured, serving queries only");
            None
        }
    };

    let states = pipeline
        .as_ref()
        .map(Pipeline::states)
        .unwrap_or_default();

    // Start web server
    let server = Server::new(cfg, metrics, states);
    let served = server.start(shutdown_signal()).await;

    if let Some(pipeline) = pipeline {
        if let Some(report) = pipeline.shutdown().await {
            tracing::info!(
                "Pipeline stopped: {} records written in {} batches, {} lost",
                report.records_written,
                report.batches_flushed,
                report.records_lost
            );
        }
    }

    served
}

/// Resolves on ctrl-c or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
