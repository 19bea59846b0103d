//! Error types for the Orbiter deployment manager.

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the deployment manager and its components.
#[derive(Error, Debug)]
pub enum Error {
    /// Name, spec, or image format violations. Never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Workload, pod, or spec absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// Optimistic-concurrency rejection on update. Callers may retry.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// Network errors, timeouts, and 5xx responses from the orchestrator
    /// or the image registry.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The orchestrator or registry denied access.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Kubernetes API errors that do not map onto the taxonomy above.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref resp) => match resp.code {
                404 => Error::NotFound(resp.message.clone()),
                409 => Error::VersionConflict(resp.message.clone()),
                401 | 403 => Error::Permission(resp.message.clone()),
                code if (500..=599).contains(&code) => Error::Transient(resp.message.clone()),
                _ => Error::KubeError(err),
            },
            _ => Error::KubeError(err),
        }
    }
}

impl Error {
    /// Whether a caller could reasonably retry the failed operation.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Error::Transient(_) | Error::VersionConflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: format!("status {code}"),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn kube_api_errors_map_onto_the_taxonomy() {
        assert!(matches!(Error::from(api_error(404)), Error::NotFound(_)));
        assert!(matches!(
            Error::from(api_error(409)),
            Error::VersionConflict(_)
        ));
        assert!(matches!(Error::from(api_error(403)), Error::Permission(_)));
        assert!(matches!(Error::from(api_error(503)), Error::Transient(_)));
        assert!(matches!(Error::from(api_error(422)), Error::KubeError(_)));
    }

    #[test]
    fn only_transient_and_conflict_are_retriable() {
        assert!(Error::Transient("x".into()).is_retriable());
        assert!(Error::VersionConflict("x".into()).is_retriable());
        assert!(!Error::InvalidInput("x".into()).is_retriable());
        assert!(!Error::NotFound("x".into()).is_retriable());
    }
}
