//! Subscriber registry and panic-safe event fan-out.
//!
//! Three independent tables map subscriber ids to callbacks for replica,
//! pod-terminating, and template-change events. Dispatch snapshots the
//! table under a read lock, releases it, then invokes every callback in
//! its own task behind a panic guard: no callback can block the watch
//! loop, and a buggy subscriber cannot take down delivery for its peers.
//!
//! Ordering across subscribers is unspecified. Events for one subscriber
//! are launched as independent tasks, so a subscriber that needs
//! per-object ordering must serialize internally.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tracing::error;

use crate::watch::events::{PodTerminatingEvent, ReplicaEvent, TemplateChangeEvent};

pub type ReplicaCallback = Arc<dyn Fn(ReplicaEvent) + Send + Sync + 'static>;
pub type PodTerminatingCallback = Arc<dyn Fn(PodTerminatingEvent) + Send + Sync + 'static>;
pub type TemplateChangeCallback = Arc<dyn Fn(TemplateChangeEvent) + Send + Sync + 'static>;

#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    replica: RwLock<HashMap<u64, ReplicaCallback>>,
    pod_terminating: RwLock<HashMap<u64, PodTerminatingCallback>>,
    template_change: RwLock<HashMap<u64, TemplateChangeCallback>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Monotonically increasing, never zero.
    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn subscribe_replica(&self, callback: ReplicaCallback) -> u64 {
        let id = self.allocate_id();
        self.replica
            .write()
            .expect("subscriber lock poisoned")
            .insert(id, callback);
        id
    }

    /// Idempotent: unknown ids are ignored.
    pub fn unsubscribe_replica(&self, id: u64) {
        self.replica
            .write()
            .expect("subscriber lock poisoned")
            .remove(&id);
    }

    pub fn subscribe_pod_terminating(&self, callback: PodTerminatingCallback) -> u64 {
        let id = self.allocate_id();
        self.pod_terminating
            .write()
            .expect("subscriber lock poisoned")
            .insert(id, callback);
        id
    }

    pub fn unsubscribe_pod_terminating(&self, id: u64) {
        self.pod_terminating
            .write()
            .expect("subscriber lock poisoned")
            .remove(&id);
    }

    pub fn subscribe_template_change(&self, callback: TemplateChangeCallback) -> u64 {
        let id = self.allocate_id();
        self.template_change
            .write()
            .expect("subscriber lock poisoned")
            .insert(id, callback);
        id
    }

    pub fn unsubscribe_template_change(&self, id: u64) {
        self.template_change
            .write()
            .expect("subscriber lock poisoned")
            .remove(&id);
    }

    pub fn dispatch_replica(&self, event: &ReplicaEvent) {
        let snapshot: Vec<(u64, ReplicaCallback)> = {
            let table = self.replica.read().expect("subscriber lock poisoned");
            table.iter().map(|(id, cb)| (*id, Arc::clone(cb))).collect()
        };
        for (id, callback) in snapshot {
            spawn_guarded(id, "replica", event.clone(), callback);
        }
    }

    pub fn dispatch_pod_terminating(&self, event: &PodTerminatingEvent) {
        let snapshot: Vec<(u64, PodTerminatingCallback)> = {
            let table = self
                .pod_terminating
                .read()
                .expect("subscriber lock poisoned");
            table.iter().map(|(id, cb)| (*id, Arc::clone(cb))).collect()
        };
        for (id, callback) in snapshot {
            spawn_guarded(id, "pod-terminating", event.clone(), callback);
        }
    }

    pub fn dispatch_template_change(&self, event: &TemplateChangeEvent) {
        let snapshot: Vec<(u64, TemplateChangeCallback)> = {
            let table = self
                .template_change
                .read()
                .expect("subscriber lock poisoned");
            table.iter().map(|(id, cb)| (*id, Arc::clone(cb))).collect()
        };
        for (id, callback) in snapshot {
            spawn_guarded(id, "template-change", event.clone(), callback);
        }
    }
}

/// Run one callback in a fresh task behind a panic guard. Panics are
/// logged with the subscriber id and otherwise swallowed.
fn spawn_guarded<E: Send + 'static>(
    id: u64,
    kind: &'static str,
    event: E,
    callback: Arc<dyn Fn(E) + Send + Sync>,
) {
    tokio::spawn(async move {
        crate::metrics::inc_events_dispatched();
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(subscriber = id, kind, panic = %detail, "subscriber panicked; event dropped for this subscriber only");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use super::*;
    use crate::watch::events::deleted_replica_event;

    async fn wait_for(counter: &Arc<AtomicUsize>, expected: usize) {
        for _ in 0..200 {
            if counter.load(Ordering::SeqCst) >= expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "counter stuck at {} (expected {expected})",
            counter.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn ids_are_nonzero_and_increasing() {
        let registry = SubscriberRegistry::new();
        let a = registry.subscribe_replica(Arc::new(|_| {}));
        let b = registry.subscribe_pod_terminating(Arc::new(|_| {}));
        let c = registry.subscribe_template_change(Arc::new(|_| {}));
        assert!(a > 0);
        assert!(b > a);
        assert!(c > b);
    }

    #[tokio::test]
    async fn dispatch_reaches_every_subscriber_once_per_event() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c1 = Arc::clone(&count);
        registry.subscribe_replica(Arc::new(move |_| {
            c1.fetch_add(1, Ordering::SeqCst);
        }));
        let c2 = Arc::clone(&count);
        registry.subscribe_replica(Arc::new(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch_replica(&deleted_replica_event("img"));
        wait_for(&count, 2).await;

        registry.dispatch_replica(&deleted_replica_event("img"));
        wait_for(&count, 4).await;
    }

    #[tokio::test]
    async fn a_panicking_subscriber_does_not_suppress_its_peers() {
        let registry = SubscriberRegistry::new();
        let delivered = Arc::new(AtomicUsize::new(0));

        registry.subscribe_replica(Arc::new(|_| {
            panic!("buggy subscriber");
        }));
        let counter = Arc::clone(&delivered);
        registry.subscribe_replica(Arc::new(move |event| {
            assert_eq!(event.workload_name, "img");
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch_replica(&deleted_replica_event("img"));
        wait_for(&delivered, 1).await;

        // The dispatcher stays healthy: a later event reaches the healthy
        // subscriber again.
        registry.dispatch_replica(&deleted_replica_event("img"));
        wait_for(&delivered, 2).await;
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let registry = SubscriberRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&count);
        let id = registry.subscribe_replica(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        registry.dispatch_replica(&deleted_replica_event("img"));
        wait_for(&count, 1).await;

        registry.unsubscribe_replica(id);
        registry.unsubscribe_replica(id);

        registry.dispatch_replica(&deleted_replica_event("img"));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
