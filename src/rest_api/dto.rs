//! Data Transfer Objects for the REST API.

use serde::Serialize;

use crate::types::AppInfo;

/// Response for listing endpoints.
#[derive(Debug, Serialize)]
pub struct AppListResponse {
    pub items: Vec<AppInfo>,
    pub total: usize,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// Whether the watch cache finished its initial sync.
    pub cache_synced: bool,
}

/// Error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}
