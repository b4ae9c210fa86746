use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState};

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allow cross-origin requests from any origin.
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3141,
            permissive_cors: false,
        }
    }
}

/// Build the full application router with API and WebSocket routes.
pub fn build_router(state: Arc<AppState>, config: &ServerConfig) -> Router {
    let app = api::api_router().with_state(state);
    if config.permissive_cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

/// Serve HTTP and run the poller until Ctrl+C or `shutdown` fires. The poller
/// is stopped before returning, so an in-flight issue finishes first.
pub async fn start_server(
    config: ServerConfig,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = build_router(state.clone(), &config);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;

    state.poller.start().await;
    tracing::info!(address = %local_addr, "agentboard listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("Server error");

    state.poller.stop().await;
    tracing::info!("Server shut down gracefully");
    served
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for Ctrl+C");
                shutdown.cancelled().await;
            }
        }
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("Shutting down...");
}
