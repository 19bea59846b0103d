//! Two-tier cache for image validation results.
//!
//! Tier one is an in-process map behind a reader-writer lock; tier two is an
//! optional shared store (e.g. Redis) reached through the `SharedImageCache`
//! trait. The shared store is consulted first on reads and written alongside
//! the local map on writes; any shared-store failure falls back to the local
//! map. Only fully successful validations are cached.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::Result;

use super::ImageValidationResult;

/// How often expired local entries are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Cache key for an image reference: hex-encoded SHA-256 of the raw string.
pub fn cache_key(image: &str) -> String {
    hex::encode(Sha256::digest(image.as_bytes()))
}

/// Optional shared cache tier. Payloads are opaque JSON; expiry in the
/// shared store relies on its native TTL support.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SharedImageCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, payload: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

struct LocalEntry {
    result: ImageValidationResult,
    expires_at: DateTime<Utc>,
}

/// The two-tier validation result cache.
pub struct ImageCache {
    local: RwLock<HashMap<String, LocalEntry>>,
    shared: Option<Arc<dyn SharedImageCache>>,
    ttl: Duration,
}

impl ImageCache {
    pub fn new(ttl: Duration, shared: Option<Arc<dyn SharedImageCache>>) -> Self {
        Self {
            local: RwLock::new(HashMap::new()),
            shared,
            ttl,
        }
    }

    /// Look up a cached result for an image reference.
    pub async fn get(&self, image: &str) -> Option<ImageValidationResult> {
        let key = cache_key(image);

        if let Some(shared) = &self.shared {
            match shared.get(&key).await {
                Ok(Some(payload)) => match serde_json::from_str::<ImageValidationResult>(&payload)
                {
                    Ok(result) => return Some(result),
                    Err(e) => {
                        // Corrupt entry: drop it and fall through to a
                        // fresh check via the local tier.
                        warn!(key, error = %e, "corrupt shared image-cache entry, deleting");
                        if let Err(e) = shared.delete(&key).await {
                            warn!(key, error = %e, "failed to delete corrupt entry");
                        }
                    }
                },
                Ok(None) => {}
                Err(e) => {
                    debug!(key, error = %e, "shared image cache unavailable, using local tier");
                }
            }
        }

        let local = self.local.read().expect("image cache lock poisoned");
        local
            .get(&key)
            .filter(|entry| entry.expires_at > Utc::now())
            .map(|entry| entry.result.clone())
    }

    /// Store a result in both tiers. Shared-store failures are logged and
    /// ignored; the local tier always succeeds.
    pub async fn put(&self, image: &str, result: ImageValidationResult) {
        let key = cache_key(image);

        if let Some(shared) = &self.shared {
            match serde_json::to_string(&result) {
                Ok(payload) => {
                    if let Err(e) = shared.set(&key, &payload, self.ttl).await {
                        warn!(key, error = %e, "failed to write shared image cache");
                    }
                }
                Err(e) => warn!(key, error = %e, "failed to encode validation result"),
            }
        }

        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::seconds(0));
        let mut local = self.local.write().expect("image cache lock poisoned");
        local.insert(key, LocalEntry { result, expires_at });
    }

    /// Drop expired local entries; returns how many were removed.
    /// Shared-store entries expire through their native TTL.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut local = self.local.write().expect("image cache lock poisoned");
        let before = local.len();
        local.retain(|_, entry| entry.expires_at > now);
        before - local.len()
    }

    /// Number of live local entries.
    pub fn len(&self) -> usize {
        self.local.read().expect("image cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Background sweep of the local tier until shutdown is signaled.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = self.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "swept expired image-cache entries");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_result() -> ImageValidationResult {
        ImageValidationResult::ok()
    }

    #[tokio::test]
    async fn round_trips_before_the_ttl_and_misses_after() {
        let cache = ImageCache::new(Duration::from_secs(60), None);
        cache.put("nginx:1.25", ok_result()).await;

        let hit = cache.get("nginx:1.25").await.unwrap();
        assert!(hit.valid && hit.exists && hit.accessible);
        assert!(cache.get("nginx:1.26").await.is_none());

        let expired = ImageCache::new(Duration::from_secs(0), None);
        expired.put("nginx:1.25", ok_result()).await;
        assert!(expired.get("nginx:1.25").await.is_none());
    }

    #[test]
    fn keys_are_sha256_of_the_reference() {
        // sha256("x/y:tag")
        assert_eq!(cache_key("x/y:tag").len(), 64);
        assert_ne!(cache_key("x/y:tag"), cache_key("x/y:other"));
        assert_eq!(cache_key("x/y:tag"), cache_key("x/y:tag"));
    }

    #[test]
    fn sweep_removes_only_expired_entries() {
        let cache = ImageCache::new(Duration::from_secs(60), None);
        {
            let mut local = cache.local.write().unwrap();
            local.insert(
                "live".to_string(),
                LocalEntry {
                    result: ok_result(),
                    expires_at: Utc::now() + chrono::Duration::minutes(5),
                },
            );
            local.insert(
                "dead".to_string(),
                LocalEntry {
                    result: ok_result(),
                    expires_at: Utc::now() - chrono::Duration::minutes(5),
                },
            );
        }

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn shared_tier_answers_first() {
        let payload = serde_json::to_string(&ok_result()).unwrap();
        let mut shared = MockSharedImageCache::new();
        shared.expect_get().returning(move |_| Ok(Some(payload.clone())));

        let cache = ImageCache::new(Duration::from_secs(60), Some(Arc::new(shared)));
        // Nothing in the local tier, yet the shared hit answers.
        let hit = cache.get("nginx:1.25").await.unwrap();
        assert!(hit.valid);
    }

    #[tokio::test]
    async fn corrupt_shared_entries_are_deleted_and_local_answers() {
        let mut shared = MockSharedImageCache::new();
        shared
            .expect_get()
            .returning(|_| Ok(Some("not json".to_string())));
        shared.expect_delete().times(1..).returning(|_| Ok(()));
        shared.expect_set().returning(|_, _, _| Ok(()));

        let cache = ImageCache::new(Duration::from_secs(60), Some(Arc::new(shared)));
        cache.put("nginx:1.25", ok_result()).await;

        let hit = cache.get("nginx:1.25").await.unwrap();
        assert!(hit.valid);
    }

    #[tokio::test]
    async fn shared_errors_fall_back_to_local() {
        let mut shared = MockSharedImageCache::new();
        shared
            .expect_get()
            .returning(|_| Err(crate::error::Error::Transient("down".to_string())));
        shared
            .expect_set()
            .returning(|_, _, _| Err(crate::error::Error::Transient("down".to_string())));

        let cache = ImageCache::new(Duration::from_secs(60), Some(Arc::new(shared)));
        cache.put("nginx:1.25", ok_result()).await;
        assert!(cache.get("nginx:1.25").await.is_some());
    }
}
