//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::query::QueryEngine;
use crate::scheduler::{PipelineMetrics, SchedulerStates};

use axum::{routing::get, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub engine: QueryEngine,
    pub metrics: Arc<PipelineMetrics>,
    pub schedulers: SchedulerStates,
}

/// Query service for the measurement log.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(
        config: ServerConfig,
        metrics: Arc<PipelineMetrics>,
        schedulers: SchedulerStates,
    ) -> Self {
        let engine = QueryEngine::new(&config.log_path);
        Self {
            state: AppState {
                config,
                engine,
                metrics,
                schedulers,
            },
        }
    }

    /// Build the router with all routes.
    pub(crate) fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/metrics", get(handlers::handle_metrics))
            .route("/health", get(handlers::handle_health))
            .route("/status", get(handlers::handle_status))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);
        tracing::info!("Serving queries over {}", self.state.engine.path().display());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
