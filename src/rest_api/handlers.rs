//! Request handlers for the REST API.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::Error;
use crate::manager::DeploymentManager;

use super::dto::{AppListResponse, ErrorResponse, HealthResponse};

fn error_response(error: Error) -> Response {
    let (status, code) = match &error {
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
        Error::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
        Error::Permission(_) => (StatusCode::FORBIDDEN, "permission_denied"),
        Error::VersionConflict(_) => (StatusCode::CONFLICT, "version_conflict"),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
    };
    (
        status,
        Json(ErrorResponse::new(code, &error.to_string())),
    )
        .into_response()
}

/// GET /health
pub async fn health(State(manager): State<Arc<DeploymentManager>>) -> Response {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        cache_synced: manager.is_synced(),
    })
    .into_response()
}

/// GET /api/v1/apps
pub async fn list_apps(State(manager): State<Arc<DeploymentManager>>) -> Response {
    match manager.list_apps().await {
        Ok(items) => {
            let total = items.len();
            Json(AppListResponse { items, total }).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// GET /api/v1/apps/{name}
pub async fn get_app(
    State(manager): State<Arc<DeploymentManager>>,
    Path(name): Path<String>,
) -> Response {
    match manager.get_app(&name).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /api/v1/apps/{name}/failures
pub async fn get_app_failures(
    State(manager): State<Arc<DeploymentManager>>,
    Path(name): Path<String>,
) -> Response {
    match manager.worker_failures(&name).await {
        Ok(failures) => Json(failures).into_response(),
        Err(e) => error_response(e),
    }
}

/// GET /metrics
#[cfg(feature = "metrics")]
pub async fn metrics() -> Response {
    crate::metrics::render().into_response()
}
