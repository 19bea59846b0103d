//! Pre-deployment image validation.
//!
//! Format validation is always on; existence checks against the registry are
//! gated by configuration and cached in two tiers keyed by the SHA-256 of
//! the reference.

pub mod cache;
pub mod format;
pub mod registry;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ImageValidationConfig;
use crate::error::Result;
use crate::types::RegistryCredential;

pub use cache::{ImageCache, SharedImageCache};
pub use format::{validate_image_format, ImageReference, ResolvedReference};
pub use registry::RegistryClient;

/// Outcome of validating one image reference.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ImageValidationResult {
    /// The reference is usable for a deployment attempt.
    pub valid: bool,
    /// The manifest is known to exist in the registry.
    pub exists: bool,
    /// The manifest is accessible with the given credentials.
    pub accessible: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ImageValidationResult {
    fn base(valid: bool, exists: bool, accessible: bool) -> Self {
        Self {
            valid,
            exists,
            accessible,
            error: None,
            warning: None,
            checked_at: Utc::now(),
        }
    }

    /// The manifest exists and is accessible.
    pub fn ok() -> Self {
        Self::base(true, true, true)
    }

    /// The reference itself is malformed.
    pub fn invalid(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::base(false, false, false)
        }
    }

    /// The registry answered 404.
    pub fn missing(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::base(true, false, false)
        }
    }

    /// The registry denied access; `exists` distinguishes 403 (the
    /// manifest is there) from auth failures where nothing is known.
    pub fn denied(exists: bool, error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::base(true, exists, false)
        }
    }

    /// The registry could not be reached and the check is surfaced as an
    /// error result.
    pub fn unreachable(error: String) -> Self {
        Self {
            error: Some(error),
            ..Self::base(true, false, false)
        }
    }

    /// The registry could not be reached but deployment should proceed and
    /// let the image pull verify the reference.
    pub fn deferred(warning: String) -> Self {
        Self {
            warning: Some(warning),
            ..Self::base(true, false, false)
        }
    }

    /// Only fully successful validations are worth caching.
    pub fn is_cacheable(&self) -> bool {
        self.valid && self.exists && self.accessible
    }
}

/// Facade tying format validation, the registry client, and the cache
/// together.
pub struct ImageValidator {
    config: ImageValidationConfig,
    cache: Arc<ImageCache>,
    client: RegistryClient,
}

impl ImageValidator {
    pub fn new(
        config: ImageValidationConfig,
        shared: Option<Arc<dyn SharedImageCache>>,
    ) -> Result<Self> {
        let cache = Arc::new(ImageCache::new(config.cache_duration, shared));
        let client = RegistryClient::new(config.timeout)?;
        Ok(Self {
            config,
            cache,
            client,
        })
    }

    /// Whether existence checks run at all.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// The shared cache handle, for the background sweeper.
    pub fn cache(&self) -> Arc<ImageCache> {
        Arc::clone(&self.cache)
    }

    /// Validate the reference format only.
    pub fn validate_format(&self, image: &str) -> Result<ImageReference> {
        format::validate_image_format(image)
    }

    /// Check that an image exists and is accessible, consulting the cache
    /// first. Successful results are cached for the configured TTL.
    pub async fn check_image_exists(
        &self,
        image: &str,
        credential: Option<&RegistryCredential>,
    ) -> ImageValidationResult {
        let resolved = match format::resolve(image) {
            Ok(resolved) => resolved,
            Err(e) => return ImageValidationResult::invalid(e.to_string()),
        };

        if let Some(hit) = self.cache.get(image).await {
            debug!(image, "image validation cache hit");
            crate::metrics::inc_image_cache_hit();
            return hit;
        }
        crate::metrics::inc_image_cache_miss();

        let result = self
            .client
            .check_image_exists(&resolved, credential, self.config.skip_on_timeout)
            .await;

        if result.is_cacheable() {
            self.cache.put(image, result.clone()).await;
        }
        result
    }
}
