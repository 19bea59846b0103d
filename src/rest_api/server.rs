//! Axum HTTP server for the REST API.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::{Error, Result};
use crate::manager::DeploymentManager;

use super::handlers;

/// Run the REST API server until the process exits.
pub async fn run_server(manager: Arc<DeploymentManager>, addr: SocketAddr) -> Result<()> {
    let router = Router::new()
        .route("/health", get(handlers::health))
        .route("/api/v1/apps", get(handlers::list_apps))
        .route("/api/v1/apps/{name}", get(handlers::get_app))
        .route("/api/v1/apps/{name}/failures", get(handlers::get_app_failures));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(handlers::metrics));

    let app = router
        .layer(TraceLayer::new_for_http())
        .with_state(manager);

    info!("REST API server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::ConfigError(format!("failed to bind to {addr}: {e}")))?;

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::ConfigError(format!("server error: {e}")))?;

    Ok(())
}
