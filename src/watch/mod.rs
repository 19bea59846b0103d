//! Watched cache of managed workloads and pods.
//!
//! Maintains an eventually-consistent local index of the Deployments and
//! Pods carrying the manager's labels, driven by list-then-watch with a
//! periodic resync. Every observed transition is forwarded as a
//! `CacheEvent` carrying the previously cached object, which is what lets
//! the manager detect terminating edges and template changes.

pub mod events;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::{Client, ResourceExt};
use kube_runtime::watcher;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{LABEL_APP, LABEL_MANAGED_BY, MANAGER_ID};

/// Initial reconnect backoff after a watch error.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect backoff ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// How long the bootstrap watchdog waits before reporting sync status.
const SYNC_WATCHDOG: Duration = Duration::from_secs(60);

/// A state change observed by the cache. `old` is the previously cached
/// object, present when the object had been seen before.
#[derive(Debug)]
pub enum CacheEvent {
    WorkloadApplied {
        old: Option<Box<Deployment>>,
        new: Box<Deployment>,
    },
    WorkloadDeleted {
        last: Box<Deployment>,
    },
    PodApplied {
        old: Option<Box<Pod>>,
        new: Box<Pod>,
    },
    PodDeleted {
        last: Box<Pod>,
    },
}

type Store<K> = Arc<RwLock<HashMap<String, K>>>;

/// The watched cache. Reads are served from the local stores; the manager
/// falls back to live reads until `is_synced` turns true.
pub struct WatchCache {
    workloads: Store<Deployment>,
    pods: Store<Pod>,
    workloads_synced: Arc<AtomicBool>,
    pods_synced: Arc<AtomicBool>,
}

impl WatchCache {
    /// Start the watch subsystem. Returns immediately; the initial sync
    /// runs in the background and a watchdog logs its status after a
    /// minute. Events flow into the returned receiver until shutdown.
    pub fn start(
        client: Client,
        namespace: &str,
        resync_period: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<CacheEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let cache = Arc::new(Self {
            workloads: Arc::new(RwLock::new(HashMap::new())),
            pods: Arc::new(RwLock::new(HashMap::new())),
            workloads_synced: Arc::new(AtomicBool::new(false)),
            pods_synced: Arc::new(AtomicBool::new(false)),
        });

        let selector = format!("{LABEL_MANAGED_BY}={MANAGER_ID}");

        tokio::spawn(run_workload_watcher(
            Api::namespaced(client.clone(), namespace),
            selector.clone(),
            Arc::clone(&cache.workloads),
            Arc::clone(&cache.workloads_synced),
            events_tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(run_pod_watcher(
            Api::namespaced(client, namespace),
            selector,
            Arc::clone(&cache.pods),
            Arc::clone(&cache.pods_synced),
            events_tx.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(run_resync(
            Arc::clone(&cache),
            events_tx,
            resync_period,
            shutdown.clone(),
        ));
        tokio::spawn(run_sync_watchdog(Arc::clone(&cache), shutdown));

        (cache, events_rx)
    }

    /// Whether both kinds completed their initial listing.
    pub fn is_synced(&self) -> bool {
        self.workloads_synced.load(Ordering::Relaxed) && self.pods_synced.load(Ordering::Relaxed)
    }

    pub fn get_workload(&self, name: &str) -> Option<Deployment> {
        self.workloads
            .read()
            .expect("workload store lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn list_workloads(&self) -> Vec<Deployment> {
        let mut workloads: Vec<Deployment> = self
            .workloads
            .read()
            .expect("workload store lock poisoned")
            .values()
            .cloned()
            .collect();
        workloads.sort_by_key(|w| w.name_any());
        workloads
    }

    pub fn get_pod(&self, name: &str) -> Option<Pod> {
        self.pods
            .read()
            .expect("pod store lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn list_pods(&self) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self
            .pods
            .read()
            .expect("pod store lock poisoned")
            .values()
            .cloned()
            .collect();
        pods.sort_by_key(|p| p.name_any());
        pods
    }

    /// Pods belonging to one endpoint, by the app label.
    pub fn pods_for_endpoint(&self, endpoint: &str) -> Vec<Pod> {
        let mut pods: Vec<Pod> = self
            .pods
            .read()
            .expect("pod store lock poisoned")
            .values()
            .filter(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_APP))
                    .map(String::as_str)
                    == Some(endpoint)
            })
            .cloned()
            .collect();
        pods.sort_by_key(|p| p.name_any());
        pods
    }
}

/// Insert an object and emit the applied event carrying the previous state.
fn apply_workload(store: &Store<Deployment>, tx: &mpsc::UnboundedSender<CacheEvent>, new: Deployment) {
    let name = new.name_any();
    let old = store
        .write()
        .expect("workload store lock poisoned")
        .insert(name, new.clone());
    let _ = tx.send(CacheEvent::WorkloadApplied {
        old: old.map(Box::new),
        new: Box::new(new),
    });
}

fn remove_workload(store: &Store<Deployment>, tx: &mpsc::UnboundedSender<CacheEvent>, gone: Deployment) {
    let last = store
        .write()
        .expect("workload store lock poisoned")
        .remove(&gone.name_any())
        .unwrap_or(gone);
    let _ = tx.send(CacheEvent::WorkloadDeleted {
        last: Box::new(last),
    });
}

/// After a relist, anything cached but not re-listed was deleted while the
/// watch was down ("final state unknown"): emit synthetic deletions.
fn finish_workload_relist(
    store: &Store<Deployment>,
    tx: &mpsc::UnboundedSender<CacheEvent>,
    seen: &HashSet<String>,
) {
    let vanished: Vec<Deployment> = {
        let store = store.read().expect("workload store lock poisoned");
        store
            .values()
            .filter(|w| !seen.contains(&w.name_any()))
            .cloned()
            .collect()
    };
    for workload in vanished {
        debug!(workload = %workload.name_any(), "workload vanished during relist");
        remove_workload(store, tx, workload);
    }
}

fn apply_pod(store: &Store<Pod>, tx: &mpsc::UnboundedSender<CacheEvent>, new: Pod) {
    let name = new.name_any();
    let old = store
        .write()
        .expect("pod store lock poisoned")
        .insert(name, new.clone());
    let _ = tx.send(CacheEvent::PodApplied {
        old: old.map(Box::new),
        new: Box::new(new),
    });
}

fn remove_pod(store: &Store<Pod>, tx: &mpsc::UnboundedSender<CacheEvent>, gone: Pod) {
    let last = store
        .write()
        .expect("pod store lock poisoned")
        .remove(&gone.name_any())
        .unwrap_or(gone);
    let _ = tx.send(CacheEvent::PodDeleted {
        last: Box::new(last),
    });
}

fn finish_pod_relist(
    store: &Store<Pod>,
    tx: &mpsc::UnboundedSender<CacheEvent>,
    seen: &HashSet<String>,
) {
    let vanished: Vec<Pod> = {
        let store = store.read().expect("pod store lock poisoned");
        store
            .values()
            .filter(|p| !seen.contains(&p.name_any()))
            .cloned()
            .collect()
    };
    for pod in vanished {
        debug!(pod = %pod.name_any(), "pod vanished during relist");
        remove_pod(store, tx, pod);
    }
}

async fn run_workload_watcher(
    api: Api<Deployment>,
    selector: String,
    store: Store<Deployment>,
    synced: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<CacheEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("starting workload watcher");
    let mut backoff = INITIAL_BACKOFF;

    'reconnect: loop {
        let config = watcher::Config::default().labels(&selector);
        let mut stream = watcher(api.clone(), config).boxed();
        let mut relist_seen: Option<HashSet<String>> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("workload watcher shutting down");
                        return;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        backoff = INITIAL_BACKOFF;
                        match event {
                            watcher::Event::Init => {
                                relist_seen = Some(HashSet::new());
                            }
                            watcher::Event::InitApply(workload) => {
                                if let Some(seen) = relist_seen.as_mut() {
                                    seen.insert(workload.name_any());
                                }
                                apply_workload(&store, &tx, workload);
                            }
                            watcher::Event::InitDone => {
                                if let Some(seen) = relist_seen.take() {
                                    finish_workload_relist(&store, &tx, &seen);
                                }
                                if !synced.swap(true, Ordering::Relaxed) {
                                    info!("workload cache synced");
                                }
                            }
                            watcher::Event::Apply(workload) => {
                                apply_workload(&store, &tx, workload);
                            }
                            watcher::Event::Delete(workload) => {
                                remove_workload(&store, &tx, workload);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, backoff = ?backoff, "workload watch failed, reconnecting");
                        crate::metrics::inc_watch_restarts();
                        tokio::time::sleep(jittered(backoff)).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue 'reconnect;
                    }
                    None => {
                        warn!("workload watch stream ended, reconnecting");
                        tokio::time::sleep(jittered(backoff)).await;
                        continue 'reconnect;
                    }
                }
            }
        }
    }
}

async fn run_pod_watcher(
    api: Api<Pod>,
    selector: String,
    store: Store<Pod>,
    synced: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<CacheEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("starting pod watcher");
    let mut backoff = INITIAL_BACKOFF;

    'reconnect: loop {
        let config = watcher::Config::default().labels(&selector);
        let mut stream = watcher(api.clone(), config).boxed();
        let mut relist_seen: Option<HashSet<String>> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("pod watcher shutting down");
                        return;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        backoff = INITIAL_BACKOFF;
                        match event {
                            watcher::Event::Init => {
                                relist_seen = Some(HashSet::new());
                            }
                            watcher::Event::InitApply(pod) => {
                                if let Some(seen) = relist_seen.as_mut() {
                                    seen.insert(pod.name_any());
                                }
                                apply_pod(&store, &tx, pod);
                            }
                            watcher::Event::InitDone => {
                                if let Some(seen) = relist_seen.take() {
                                    finish_pod_relist(&store, &tx, &seen);
                                }
                                if !synced.swap(true, Ordering::Relaxed) {
                                    info!("pod cache synced");
                                }
                            }
                            watcher::Event::Apply(pod) => {
                                apply_pod(&store, &tx, pod);
                            }
                            watcher::Event::Delete(pod) => {
                                remove_pod(&store, &tx, pod);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, backoff = ?backoff, "pod watch failed, reconnecting");
                        crate::metrics::inc_watch_restarts();
                        tokio::time::sleep(jittered(backoff)).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue 'reconnect;
                    }
                    None => {
                        warn!("pod watch stream ended, reconnecting");
                        tokio::time::sleep(jittered(backoff)).await;
                        continue 'reconnect;
                    }
                }
            }
        }
    }
}

/// Re-emit every cached object on the resync interval so downstream
/// reconcilers get a heartbeat even when nothing changed. The re-emitted
/// event carries the object as both old and new, so no edges fire.
async fn run_resync(
    cache: Arc<WatchCache>,
    tx: mpsc::UnboundedSender<CacheEvent>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let start = tokio::time::Instant::now() + period;
    let mut ticker = tokio::time::interval_at(start, period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
            _ = ticker.tick() => {
                let workloads = cache.list_workloads();
                let pods = cache.list_pods();
                debug!(
                    workloads = workloads.len(),
                    pods = pods.len(),
                    "resync: re-emitting cached state"
                );
                for workload in workloads {
                    let _ = tx.send(CacheEvent::WorkloadApplied {
                        old: Some(Box::new(workload.clone())),
                        new: Box::new(workload),
                    });
                }
                for pod in pods {
                    let _ = tx.send(CacheEvent::PodApplied {
                        old: Some(Box::new(pod.clone())),
                        new: Box::new(pod),
                    });
                }
            }
        }
    }
}

/// Logs sync status once after startup so a stuck bootstrap is visible.
async fn run_sync_watchdog(cache: Arc<WatchCache>, mut shutdown: watch::Receiver<bool>) {
    tokio::select! {
        _ = tokio::time::sleep(SYNC_WATCHDOG) => {
            if cache.is_synced() {
                info!("watch cache synced within the startup window");
            } else {
                warn!(
                    "watch cache not yet synced after {:?}; reads fall back to live lists",
                    SYNC_WATCHDOG
                );
            }
        }
        _ = shutdown.changed() => {}
    }
}

fn jittered(backoff: Duration) -> Duration {
    backoff + Duration::from_millis(rand::rng().random_range(0..=500))
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    fn cache() -> WatchCache {
        WatchCache {
            workloads: Arc::new(RwLock::new(HashMap::new())),
            pods: Arc::new(RwLock::new(HashMap::new())),
            workloads_synced: Arc::new(AtomicBool::new(false)),
            pods_synced: Arc::new(AtomicBool::new(false)),
        }
    }

    fn workload(name: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pod(name: &str, endpoint: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(std::collections::BTreeMap::from([(
                    LABEL_APP.to_string(),
                    endpoint.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn apply_carries_the_previous_state() {
        let cache = cache();
        let (tx, mut rx) = mpsc::unbounded_channel();

        apply_workload(&cache.workloads, &tx, workload("img"));
        match rx.try_recv().unwrap() {
            CacheEvent::WorkloadApplied { old, .. } => assert!(old.is_none()),
            other => panic!("unexpected event: {other:?}"),
        }

        apply_workload(&cache.workloads, &tx, workload("img"));
        match rx.try_recv().unwrap() {
            CacheEvent::WorkloadApplied { old, .. } => assert!(old.is_some()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn relist_detects_unobserved_deletions() {
        let cache = cache();
        let (tx, mut rx) = mpsc::unbounded_channel();

        apply_workload(&cache.workloads, &tx, workload("img"));
        apply_workload(&cache.workloads, &tx, workload("gone"));
        while rx.try_recv().is_ok() {}

        // Relist saw only "img": "gone" disappeared while the watch was
        // down and must produce a synthetic deletion.
        let seen = HashSet::from(["img".to_string()]);
        finish_workload_relist(&cache.workloads, &tx, &seen);

        match rx.try_recv().unwrap() {
            CacheEvent::WorkloadDeleted { last } => {
                assert_eq!(last.name_any(), "gone");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(cache.get_workload("gone").is_none());
        assert!(cache.get_workload("img").is_some());
    }

    #[test]
    fn delete_removes_and_reports_the_last_known_state() {
        let cache = cache();
        let (tx, mut rx) = mpsc::unbounded_channel();

        apply_pod(&cache.pods, &tx, pod("img-a", "img"));
        let _ = rx.try_recv();

        remove_pod(&cache.pods, &tx, pod("img-a", "img"));
        match rx.try_recv().unwrap() {
            CacheEvent::PodDeleted { last } => assert_eq!(last.name_any(), "img-a"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(cache.get_pod("img-a").is_none());
    }

    #[test]
    fn pods_for_endpoint_filters_by_the_app_label() {
        let cache = cache();
        let (tx, _rx) = mpsc::unbounded_channel();

        apply_pod(&cache.pods, &tx, pod("img-a", "img"));
        apply_pod(&cache.pods, &tx, pod("img-b", "img"));
        apply_pod(&cache.pods, &tx, pod("other-a", "other"));

        let pods = cache.pods_for_endpoint("img");
        assert_eq!(pods.len(), 2);
        assert!(pods.iter().all(|p| p.name_any().starts_with("img-")));
    }

    #[test]
    fn sync_flag_requires_both_kinds() {
        let cache = cache();
        assert!(!cache.is_synced());
        cache.workloads_synced.store(true, Ordering::Relaxed);
        assert!(!cache.is_synced());
        cache.pods_synced.store(true, Ordering::Relaxed);
        assert!(cache.is_synced());
    }
}
