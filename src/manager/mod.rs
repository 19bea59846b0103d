//! The deployment manager.
//!
//! Ties the validators, renderer, watch cache, and subscriber registry
//! together: translates deploy requests into workload writes, observes the
//! orchestrator through the watch cache, and steers replica lifecycle
//! during scale-down and rolling updates.

pub mod subscribers;

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::AsyncReadExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ConfigMap, Event as CoreEvent, PersistentVolume, PersistentVolumeClaim, Pod, Service,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::{Api, DeleteParams, ListParams, LogParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{
    ManagerConfig, ANNOTATION_DELETION_COST, ANNOTATION_PLATFORM_ANNOTATIONS,
    ANNOTATION_PLATFORM_LABELS, DELETION_COST_DRAINED, GLOBAL_ENV_CONFIGMAP, LABEL_APP,
    LABEL_DRAIN, LABEL_MANAGED_BY, LABEL_SPEC, MANAGER_ID, RESERVED_ENV_PREFIX, RESERVED_PREFIX,
};
use crate::error::{Error, Result};
use crate::image::{ImageValidator, SharedImageCache};
use crate::naming::validate_endpoint_name;
use crate::platform::{capability_for, PlatformCapability};
use crate::specs::{ResourceSpec, SpecRegistry};
use crate::status::{StatusSanitizer, WorkerFailureInfo};
use crate::template;
use crate::types::{AppInfo, DeployRequest, PodInfo, UpdateRequest};
use crate::watch::events::{self, TemplateChangeEvent};
use crate::watch::{CacheEvent, WatchCache};

pub use subscribers::SubscriberRegistry;

/// Grace period for a regular pod delete; force deletes use zero.
pub const DEFAULT_POD_GRACE_SECONDS: u32 = 30;
/// Upper bound on bytes returned from a log stream.
const MAX_LOG_BYTES: u64 = 1024 * 1024;

pub struct DeploymentManager {
    client: Client,
    config: ManagerConfig,
    specs: SpecRegistry,
    capability: &'static dyn PlatformCapability,
    image_validator: ImageValidator,
    sanitizer: StatusSanitizer,
    cache: Arc<WatchCache>,
    subscribers: Arc<SubscriberRegistry>,
    global_env: BTreeMap<String, String>,
    shutdown_tx: watch::Sender<bool>,
}

impl DeploymentManager {
    /// Build the manager, loading specs from the config directory, and
    /// start the watch subsystem. Startup returns immediately; the cache
    /// syncs in the background while reads fall back to live lists.
    pub async fn new(
        client: Client,
        config: ManagerConfig,
        shared_image_cache: Option<Arc<dyn SharedImageCache>>,
    ) -> Result<Arc<Self>> {
        let specs = SpecRegistry::from_config_dir(&config.config_dir)?;
        Self::with_specs(client, config, specs, shared_image_cache).await
    }

    /// Like [`DeploymentManager::new`] with an already-built spec registry
    /// (e.g. carrying a repository override).
    pub async fn with_specs(
        client: Client,
        config: ManagerConfig,
        specs: SpecRegistry,
        shared_image_cache: Option<Arc<dyn SharedImageCache>>,
    ) -> Result<Arc<Self>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut global_env = config.global_env.clone();
        for (key, value) in load_global_env(&client, &config.namespace).await {
            global_env.entry(key).or_insert(value);
        }

        let image_validator =
            ImageValidator::new(config.image_validation.clone(), shared_image_cache)?;
        image_validator.cache().spawn_sweeper(shutdown_rx.clone());

        let (cache, events_rx) = WatchCache::start(
            client.clone(),
            &config.namespace,
            config.effective_resync_period(),
            shutdown_rx.clone(),
        );

        let subscribers = Arc::new(SubscriberRegistry::new());
        tokio::spawn(run_dispatcher(
            events_rx,
            Arc::clone(&subscribers),
            shutdown_rx,
        ));

        info!(
            namespace = %config.namespace,
            platform = capability_for(config.platform).name(),
            "deployment manager started"
        );

        Ok(Arc::new(Self {
            client,
            capability: capability_for(config.platform),
            specs,
            image_validator,
            sanitizer: StatusSanitizer::default(),
            cache,
            subscribers,
            global_env,
            shutdown_tx,
            config,
        }))
    }

    /// The subscriber registry for replica, pod-terminating, and
    /// template-change events.
    pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
        &self.subscribers
    }

    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Whether the watch cache finished its initial sync.
    pub fn is_synced(&self) -> bool {
        self.cache.is_synced()
    }

    /// Signal the watch subsystem to stop. Outstanding subscriber tasks
    /// are allowed to complete.
    pub fn close(&self) {
        info!("deployment manager shutting down");
        let _ = self.shutdown_tx.send(true);
    }

    // ------------------------------------------------------------------
    // Endpoint operations
    // ------------------------------------------------------------------

    /// Create or update the workload for a deploy request.
    pub async fn deploy(&self, request: &DeployRequest) -> Result<()> {
        let endpoint = validate_endpoint_name(&request.endpoint)?;
        let mut request = request.clone();
        request.endpoint = endpoint.clone();

        let spec = self.specs.get_spec(&request.spec_name).await?;

        if request.validate_image && self.image_validator.enabled() {
            self.ensure_image_deployable(&request).await?;
        } else {
            // Format problems are caught even when registry checks are off.
            self.image_validator.validate_format(&request.image)?;
        }

        let rendered = template::render_workload(
            &request,
            &spec,
            self.capability,
            &self.config.namespace,
            &self.global_env,
        )?;

        let api = self.workloads();
        match api.get(&endpoint).await {
            Ok(current) => {
                let mut desired = rendered;
                desired.metadata.resource_version = current.metadata.resource_version.clone();
                api.replace(&endpoint, &PostParams::default(), &desired)
                    .await
                    .map_err(Error::from)?;
                info!(%endpoint, image = %request.image, "updated workload");
            }
            Err(kube::Error::Api(ref response)) if response.code == 404 => {
                api.create(&PostParams::default(), &rendered)
                    .await
                    .map_err(Error::from)?;
                info!(%endpoint, image = %request.image, replicas = request.replicas, "created workload");
            }
            Err(e) => return Err(e.into()),
        }

        crate::metrics::inc_deploys();
        Ok(())
    }

    /// Render the workload a request would produce, without writing it.
    pub async fn preview_yaml(&self, request: &DeployRequest) -> Result<String> {
        let endpoint = validate_endpoint_name(&request.endpoint)?;
        let mut request = request.clone();
        request.endpoint = endpoint;

        let spec = self.specs.get_spec(&request.spec_name).await?;
        template::render_yaml(
            &request,
            &spec,
            self.capability,
            &self.config.namespace,
            &self.global_env,
        )
    }

    /// Current state of one endpoint, from the cache when synced and the
    /// live API otherwise.
    pub async fn get_app(&self, name: &str) -> Result<AppInfo> {
        let endpoint = validate_endpoint_name(name)?;

        let workload = match self.cached_workload(&endpoint) {
            Some(workload) => workload,
            None => self.workloads().get(&endpoint).await.map_err(|e| {
                match Error::from(e) {
                    Error::NotFound(_) => Error::NotFound(format!("endpoint {endpoint:?}")),
                    other => other,
                }
            })?,
        };

        let pods = self.endpoint_pods(&endpoint).await?;
        Ok(app_info(&workload, pods))
    }

    /// All managed endpoints with their replicas.
    pub async fn list_apps(&self) -> Result<Vec<AppInfo>> {
        let (workloads, pods) = if self.cache.is_synced() {
            (self.cache.list_workloads(), self.cache.list_pods())
        } else {
            let selector = format!("{LABEL_MANAGED_BY}={MANAGER_ID}");
            let lp = ListParams::default().labels(&selector);
            let workloads = self.workloads().list(&lp).await.map_err(Error::from)?;
            let pods = self.pods_api().list(&lp).await.map_err(Error::from)?;
            (workloads.items, pods.items)
        };

        let mut by_endpoint: BTreeMap<String, Vec<Pod>> = BTreeMap::new();
        for pod in pods {
            if let Some(endpoint) = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(LABEL_APP))
                .cloned()
            {
                by_endpoint.entry(endpoint).or_default().push(pod);
            }
        }

        Ok(workloads
            .into_iter()
            .map(|workload| {
                let pods = by_endpoint
                    .remove(&workload.name_any())
                    .unwrap_or_default();
                app_info(&workload, pods)
            })
            .collect())
    }

    /// Patch the provided fields onto an existing workload. Platform
    /// labels and annotations follow the record-and-replace discipline
    /// when the spec changes.
    pub async fn update_deployment(&self, endpoint: &str, update: &UpdateRequest) -> Result<()> {
        let endpoint = validate_endpoint_name(endpoint)?;
        if update.is_empty() {
            debug!(%endpoint, "update request carries no changes");
            return Ok(());
        }
        if let Some(image) = &update.image {
            crate::image::validate_image_format(image)?;
        }
        if update.replicas.is_some_and(|n| n < 0) {
            return Err(Error::InvalidInput("replicas must be >= 0".to_string()));
        }

        let api = self.workloads();
        let mut workload = api.get(&endpoint).await.map_err(|e| match Error::from(e) {
            Error::NotFound(_) => Error::NotFound(format!("endpoint {endpoint:?}")),
            other => other,
        })?;

        let new_spec = match &update.spec_name {
            Some(name) => Some(self.specs.get_spec(name).await?),
            None => None,
        };

        apply_update(
            &mut workload,
            update,
            new_spec.as_ref(),
            self.capability,
            &self.global_env,
        )?;

        api.replace(&endpoint, &PostParams::default(), &workload)
            .await
            .map_err(Error::from)?;
        info!(%endpoint, "workload updated");
        Ok(())
    }

    /// Set the desired replica count.
    pub async fn scale_deployment(&self, endpoint: &str, replicas: i32) -> Result<()> {
        let endpoint = validate_endpoint_name(endpoint)?;
        if replicas < 0 {
            return Err(Error::InvalidInput("replicas must be >= 0".to_string()));
        }

        let patch = json!({ "spec": { "replicas": replicas } });
        self.workloads()
            .patch(&endpoint, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match Error::from(e) {
                Error::NotFound(_) => Error::NotFound(format!("endpoint {endpoint:?}")),
                other => other,
            })?;
        info!(%endpoint, replicas, "workload scaled");
        Ok(())
    }

    /// Delete the workload and, best-effort, its ancillary objects.
    /// Idempotent: deleting an absent endpoint succeeds.
    pub async fn delete_app(&self, endpoint: &str) -> Result<()> {
        let endpoint = validate_endpoint_name(endpoint)?;

        match self
            .workloads()
            .delete(&endpoint, &DeleteParams::default())
            .await
        {
            Ok(_) => info!(%endpoint, "workload deleted"),
            Err(kube::Error::Api(ref response)) if response.code == 404 => {
                debug!(%endpoint, "workload already absent");
            }
            Err(e) => return Err(e.into()),
        }

        // Ancillary cleanup never fails the operation.
        match self
            .services()
            .delete(&endpoint, &DeleteParams::default())
            .await
        {
            Ok(_) => info!(%endpoint, "service deleted"),
            Err(kube::Error::Api(ref response)) if response.code == 404 => {}
            Err(e) => warn!(%endpoint, error = %e, "failed to delete service"),
        }

        let selector = format!("{LABEL_APP}={endpoint}");
        let lp = ListParams::default().labels(&selector);
        match self.pvcs().list(&lp).await {
            Ok(list) => {
                for pvc in list.items {
                    let name = pvc.name_any();
                    if let Err(e) = self.pvcs().delete(&name, &DeleteParams::default()).await {
                        warn!(%endpoint, pvc = %name, error = %e, "failed to delete PVC");
                    }
                }
            }
            Err(e) => warn!(%endpoint, error = %e, "failed to list PVCs for cleanup"),
        }

        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());
        match pvs.list(&lp).await {
            Ok(list) => {
                for pv in list.items {
                    let name = pv.name_any();
                    if let Err(e) = pvs.delete(&name, &DeleteParams::default()).await {
                        warn!(%endpoint, pv = %name, error = %e, "failed to delete PV");
                    }
                }
            }
            Err(e) => warn!(%endpoint, error = %e, "failed to list PVs for cleanup"),
        }

        Ok(())
    }

    /// Read up to 1 MiB of logs from one replica. Without an explicit pod
    /// name the first (oldest) replica of the endpoint is used.
    pub async fn get_app_logs(
        &self,
        name: &str,
        tail_lines: i64,
        pod_name: Option<&str>,
    ) -> Result<String> {
        let endpoint = validate_endpoint_name(name)?;

        let pod = match pod_name {
            Some(pod) => {
                let found = self.pod_by_name(pod).await?;
                let belongs = found
                    .metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(LABEL_APP))
                    .map(String::as_str)
                    == Some(endpoint.as_str());
                if !belongs {
                    return Err(Error::NotFound(format!(
                        "pod {pod:?} does not belong to endpoint {endpoint:?}"
                    )));
                }
                pod.to_string()
            }
            None => {
                let mut pods = self.endpoint_pods(&endpoint).await?;
                sort_by_creation(&mut pods);
                pods.first()
                    .map(|p| p.name_any())
                    .ok_or_else(|| Error::NotFound(format!("endpoint {endpoint:?} has no pods")))?
            }
        };

        let lp = LogParams {
            container: Some(template::container_name(&endpoint)),
            tail_lines: Some(tail_lines),
            ..Default::default()
        };
        let reader = self
            .pods_api()
            .log_stream(&pod, &lp)
            .await
            .map_err(Error::from)?;
        let mut buf = Vec::new();
        Box::pin(reader)
            .take(MAX_LOG_BYTES)
            .read_to_end(&mut buf)
            .await
            .map_err(|e| Error::Transient(format!("log stream from {pod}: {e}")))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Detected failures across an endpoint's replicas, sanitized for
    /// user consumption. Terminating replicas never count.
    pub async fn worker_failures(&self, endpoint: &str) -> Result<Vec<WorkerFailureInfo>> {
        let endpoint = validate_endpoint_name(endpoint)?;
        let pods = self.endpoint_pods(&endpoint).await?;

        let mut failures = Vec::new();
        for pod in &pods {
            if let Some(failure) = self.sanitizer.detect_failure(pod) {
                failures.push(failure);
                continue;
            }
            if let Some(reason_text) = self.capability.detect_spot_interruption(pod) {
                failures.push(
                    self.sanitizer
                        .failure_from_reason("SpotInterruption", &reason_text),
                );
                continue;
            }
            // A pending pod without container state may only show its
            // problem in the event log.
            if pod.metadata.deletion_timestamp.is_none()
                && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Pending")
            {
                if let Some(failure) = self.failure_from_events(&pod.name_any()).await {
                    failures.push(failure);
                }
            }
        }
        Ok(failures)
    }

    // ------------------------------------------------------------------
    // Replica operations
    // ------------------------------------------------------------------

    /// Set the drain label: the replica should take no new work.
    pub async fn mark_pod_draining(&self, pod: &str) -> Result<()> {
        let patch = json!({ "metadata": { "labels": { LABEL_DRAIN: "true" } } });
        self.pods_api()
            .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match Error::from(e) {
                Error::NotFound(_) => Error::NotFound(format!("pod {pod:?}")),
                other => other,
            })?;
        debug!(pod, "pod marked draining");
        Ok(())
    }

    /// Write the deletion-cost annotation; lower costs are culled first.
    pub async fn set_pod_deletion_cost(&self, pod: &str, cost: i32) -> Result<()> {
        let patch = json!({
            "metadata": { "annotations": { ANNOTATION_DELETION_COST: cost.to_string() } }
        });
        self.pods_api()
            .patch(pod, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| match Error::from(e) {
                Error::NotFound(_) => Error::NotFound(format!("pod {pod:?}")),
                other => other,
            })?;
        debug!(pod, cost, "pod deletion cost set");
        Ok(())
    }

    /// Delete a replica with the default grace period. Succeeds when the
    /// pod is already gone.
    pub async fn delete_pod(&self, pod: &str) -> Result<()> {
        let dp = DeleteParams::default().grace_period(DEFAULT_POD_GRACE_SECONDS);
        match self.pods_api().delete(pod, &dp).await {
            Ok(_) => {
                info!(pod, grace = DEFAULT_POD_GRACE_SECONDS, "pod deleted");
                Ok(())
            }
            Err(kube::Error::Api(ref response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a replica immediately, skipping its grace period.
    pub async fn force_delete_pod(&self, pod: &str) -> Result<()> {
        warn!(pod, "force deleting pod with zero grace period");
        let dp = DeleteParams::default().grace_period(0);
        match self.pods_api().delete(pod, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ref response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the drain label is set. Unknown pods count as not draining.
    pub fn is_pod_draining(&self, pod: &str) -> bool {
        self.cache
            .get_pod(pod)
            .map(|p| pod_is_draining(&p))
            .unwrap_or(false)
    }

    /// Whether the deletion timestamp is set. Unknown pods count as
    /// terminating: if the cache no longer has it, it is on its way out.
    pub fn is_pod_terminating(&self, pod: &str) -> bool {
        self.cache
            .get_pod(pod)
            .map(|p| p.metadata.deletion_timestamp.is_some())
            .unwrap_or(true)
    }

    /// Label up to `count` replicas of an endpoint as draining, oldest
    /// first, skipping replicas already draining or terminating, and bias
    /// the orchestrator to cull them first. Returns the drained pod names.
    pub async fn mark_pods_as_draining(
        &self,
        endpoint: &str,
        count: usize,
    ) -> Result<Vec<String>> {
        let endpoint = validate_endpoint_name(endpoint)?;
        let pods = self.endpoint_pods(&endpoint).await?;

        let mut drained = Vec::new();
        for name in select_drain_candidates(&pods, count) {
            self.mark_pod_draining(&name).await?;
            self.set_pod_deletion_cost(&name, DELETION_COST_DRAINED).await?;
            drained.push(name);
        }

        info!(%endpoint, drained = drained.len(), requested = count, "pods marked draining");
        Ok(drained)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn workloads(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.config.namespace)
    }

    fn cached_workload(&self, endpoint: &str) -> Option<Deployment> {
        if self.cache.is_synced() {
            self.cache.get_workload(endpoint)
        } else {
            None
        }
    }

    /// Pods for an endpoint: cache when synced, live list otherwise.
    async fn endpoint_pods(&self, endpoint: &str) -> Result<Vec<Pod>> {
        if self.cache.is_synced() {
            return Ok(self.cache.pods_for_endpoint(endpoint));
        }
        let selector = format!("{LABEL_MANAGED_BY}={MANAGER_ID},{LABEL_APP}={endpoint}");
        let lp = ListParams::default().labels(&selector);
        Ok(self.pods_api().list(&lp).await.map_err(Error::from)?.items)
    }

    async fn pod_by_name(&self, pod: &str) -> Result<Pod> {
        if let Some(found) = self.cache.get_pod(pod) {
            return Ok(found);
        }
        self.pods_api().get(pod).await.map_err(|e| match Error::from(e) {
            Error::NotFound(_) => Error::NotFound(format!("pod {pod:?}")),
            other => other,
        })
    }

    /// Run pre-deployment image validation and translate the result into
    /// the error taxonomy. Warnings (e.g. skip-on-timeout) log and pass.
    async fn ensure_image_deployable(&self, request: &DeployRequest) -> Result<()> {
        let result = self
            .image_validator
            .check_image_exists(&request.image, request.registry_credential.as_ref())
            .await;

        if let Some(warning) = &result.warning {
            warn!(image = %request.image, warning, "image validation deferred");
        }
        if let Some(error) = result.error.clone() {
            return Err(if !result.valid {
                Error::InvalidInput(error)
            } else if result.exists && !result.accessible {
                Error::Permission(error)
            } else if error.contains("not found") {
                Error::InvalidInput(error)
            } else {
                Error::Transient(error)
            });
        }
        Ok(())
    }

    /// Look for a scheduling-class warning event on a pod.
    async fn failure_from_events(&self, pod: &str) -> Option<WorkerFailureInfo> {
        let api: Api<CoreEvent> = Api::namespaced(self.client.clone(), &self.config.namespace);
        let lp = ListParams::default()
            .fields(&format!("involvedObject.name={pod},involvedObject.kind=Pod"));
        let events = match api.list(&lp).await {
            Ok(events) => events,
            Err(e) => {
                debug!(pod, error = %e, "failed to list events");
                return None;
            }
        };

        events
            .items
            .iter()
            .filter(|e| e.type_.as_deref() == Some("Warning"))
            .filter_map(|e| {
                let reason = e.reason.as_deref()?;
                let message = e.message.as_deref().unwrap_or("");
                matches!(
                    reason,
                    "FailedScheduling" | "Unschedulable" | "OutOfmemory" | "OutOfcpu"
                )
                .then(|| self.sanitizer.failure_from_reason(reason, message))
            })
            .last()
    }
}

/// Default environment variables from the optional ConfigMap; a missing
/// map is an empty map, not an error.
async fn load_global_env(client: &Client, namespace: &str) -> BTreeMap<String, String> {
    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api.get(GLOBAL_ENV_CONFIGMAP).await {
        Ok(cm) => cm.data.unwrap_or_default().into_iter().collect(),
        Err(kube::Error::Api(ref response)) if response.code == 404 => BTreeMap::new(),
        Err(e) => {
            warn!(error = %e, "failed to read global env ConfigMap, using configured defaults");
            BTreeMap::new()
        }
    }
}

/// Consume cache events and fan the derived typed events out.
async fn run_dispatcher(
    mut events_rx: tokio::sync::mpsc::UnboundedReceiver<CacheEvent>,
    subscribers: Arc<SubscriberRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = events_rx.recv() => match event {
                Some(event) => handle_cache_event(&subscribers, event),
                None => break,
            }
        }
    }
    info!("event dispatcher stopped");
}

/// Translate one cache transition into subscriber events.
pub(crate) fn handle_cache_event(subscribers: &SubscriberRegistry, event: CacheEvent) {
    match event {
        CacheEvent::WorkloadApplied { old, new } => {
            subscribers.dispatch_replica(&events::replica_event(&new));
            if let Some(old) = old {
                if events::template_changed(&old, &new) {
                    let endpoint = new.name_any();
                    info!(%endpoint, "workload template changed");
                    subscribers.dispatch_template_change(&TemplateChangeEvent { endpoint });
                }
            }
        }
        CacheEvent::WorkloadDeleted { last } => {
            subscribers.dispatch_replica(&events::deleted_replica_event(&last.name_any()));
        }
        CacheEvent::PodApplied { old, new } => {
            if events::pod_terminating_edge(old.as_deref(), &new) {
                if let Some(event) = events::pod_terminating_event(&new) {
                    subscribers.dispatch_pod_terminating(&event);
                }
            }
        }
        CacheEvent::PodDeleted { last } => {
            // Deletions observed without a terminating transition (force
            // deletes, relist gaps) still owe subscribers the edge.
            if last.metadata.deletion_timestamp.is_none() {
                if let Some(event) = events::pod_terminating_event(&last) {
                    subscribers.dispatch_pod_terminating(&event);
                }
            }
        }
    }
}

/// Apply the provided update fields to a workload in place.
///
/// Platform labels and annotations use record-and-replace: the previously
/// recorded key sets are removed (reserved keys excepted), the new spec's
/// sets merged in, and the records rewritten or cleared.
fn apply_update(
    workload: &mut Deployment,
    update: &UpdateRequest,
    new_spec: Option<&ResourceSpec>,
    capability: &dyn PlatformCapability,
    global_env: &BTreeMap<String, String>,
) -> Result<()> {
    let endpoint = workload.name_any();
    let spec = workload
        .spec
        .as_mut()
        .ok_or_else(|| Error::InvalidInput(format!("workload {endpoint:?} has no spec")))?;

    if let Some(replicas) = update.replicas {
        spec.replicas = Some(replicas);
    }

    let pod_spec = spec
        .template
        .spec
        .as_mut()
        .ok_or_else(|| Error::InvalidInput(format!("workload {endpoint:?} has no pod spec")))?;

    if let Some(timeout) = update.task_timeout_seconds {
        pod_spec.termination_grace_period_seconds =
            Some(timeout + template::GRACE_PERIOD_MARGIN_SECONDS);
    }
    let effective_timeout = pod_spec
        .termination_grace_period_seconds
        .map(|grace| grace - template::GRACE_PERIOD_MARGIN_SECONDS)
        .unwrap_or_else(crate::types::default_task_timeout);

    if let Some(shm_size) = &update.shm_size {
        for volume in pod_spec.volumes.iter_mut().flatten() {
            if let Some(empty_dir) = volume.empty_dir.as_mut() {
                if empty_dir.medium.as_deref() == Some("Memory") {
                    empty_dir.size_limit = Some(Quantity(shm_size.clone()));
                }
            }
        }
    }

    let container = pod_spec
        .containers
        .first_mut()
        .ok_or_else(|| Error::InvalidInput(format!("workload {endpoint:?} has no containers")))?;

    if let Some(image) = &update.image {
        container.image = Some(image.clone());
    }
    if let Some(env) = &update.env {
        container.env = Some(template::merge_env(
            env,
            global_env,
            &endpoint,
            effective_timeout,
        ));
    } else if update.task_timeout_seconds.is_some() {
        // Keep the injected timeout variable in step with the new grace.
        for var in container.env.iter_mut().flatten() {
            if var.name == format!("{RESERVED_ENV_PREFIX}TASK_TIMEOUT") {
                var.value = Some(effective_timeout.to_string());
            }
        }
    }
    if let Some(enable_ptrace) = update.enable_ptrace {
        container.security_context = template::security_context(enable_ptrace);
    }

    if let Some(new_spec) = new_spec {
        container.resources = Some(template::resource_requirements(new_spec));
        apply_spec_platform(workload, new_spec, capability);
    }

    Ok(())
}

/// Record-and-replace the platform-sourced labels/annotations and the
/// spec label after a spec change.
fn apply_spec_platform(
    workload: &mut Deployment,
    new_spec: &ResourceSpec,
    capability: &dyn PlatformCapability,
) {
    let platform_config = new_spec.platform(capability.name());
    let new_labels = template::platform_label_set(&platform_config);
    let new_annotations =
        template::platform_annotation_set(&platform_config, capability, new_spec);

    let recorded_labels = template::decode_record(
        workload.metadata.annotations.as_ref(),
        ANNOTATION_PLATFORM_LABELS,
    );
    let recorded_annotations = template::decode_record(
        workload.metadata.annotations.as_ref(),
        ANNOTATION_PLATFORM_ANNOTATIONS,
    );

    workload
        .metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(LABEL_SPEC.to_string(), new_spec.name.clone());

    if let Some(spec) = workload.spec.as_mut() {
        let template_meta = spec.template.metadata.get_or_insert_with(Default::default);

        let labels = template_meta.labels.get_or_insert_with(Default::default);
        for key in &recorded_labels {
            if !key.starts_with(RESERVED_PREFIX) {
                labels.remove(key);
            }
        }
        labels.insert(LABEL_SPEC.to_string(), new_spec.name.clone());
        labels.extend(new_labels.clone());

        let annotations = template_meta
            .annotations
            .get_or_insert_with(Default::default);
        for key in &recorded_annotations {
            if !key.starts_with(RESERVED_PREFIX) {
                annotations.remove(key);
            }
        }
        annotations.extend(new_annotations.clone());
        if annotations.is_empty() {
            template_meta.annotations = None;
        }

        // Scheduling hints follow the new platform config wholesale.
        if let Some(pod_spec) = spec.template.spec.as_mut() {
            pod_spec.node_selector = (!platform_config.node_selector.is_empty())
                .then(|| platform_config.node_selector.clone());
            pod_spec.tolerations =
                (!platform_config.tolerations.is_empty()).then(|| platform_config.tolerations);
        }
    }

    let annotations = workload
        .metadata
        .annotations
        .get_or_insert_with(Default::default);
    match template::encode_record(&new_labels) {
        Some(record) => {
            annotations.insert(ANNOTATION_PLATFORM_LABELS.to_string(), record);
        }
        None => {
            annotations.remove(ANNOTATION_PLATFORM_LABELS);
        }
    }
    match template::encode_record(&new_annotations) {
        Some(record) => {
            annotations.insert(ANNOTATION_PLATFORM_ANNOTATIONS.to_string(), record);
        }
        None => {
            annotations.remove(ANNOTATION_PLATFORM_ANNOTATIONS);
        }
    }
    if annotations.is_empty() {
        workload.metadata.annotations = None;
    }
}

/// Pick up to `count` replicas to drain: not already draining, not
/// terminating, oldest first by creation time.
fn select_drain_candidates(pods: &[Pod], count: usize) -> Vec<String> {
    let mut candidates: Vec<&Pod> = pods
        .iter()
        .filter(|p| !pod_is_draining(p) && p.metadata.deletion_timestamp.is_none())
        .collect();
    candidates.sort_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));
    candidates
        .into_iter()
        .take(count)
        .map(|p| p.name_any())
        .collect()
}

fn pod_is_draining(pod: &Pod) -> bool {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_DRAIN))
        .map(String::as_str)
        == Some("true")
}

fn sort_by_creation(pods: &mut [Pod]) {
    pods.sort_by_key(|p| p.metadata.creation_timestamp.as_ref().map(|t| t.0));
}

/// Summarize one replica for API consumers.
fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let ready = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false);

    PodInfo {
        name: pod.name_any(),
        phase: status
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        ready,
        draining: pod_is_draining(pod),
        terminating: pod.metadata.deletion_timestamp.is_some(),
        deletion_cost: pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(ANNOTATION_DELETION_COST))
            .and_then(|v| v.parse().ok()),
        node_name: pod.spec.as_ref().and_then(|s| s.node_name.clone()),
        created_at: pod.metadata.creation_timestamp.as_ref().map(|t| t.0),
    }
}

/// Summarize a workload plus its replicas.
fn app_info(workload: &Deployment, mut pods: Vec<Pod>) -> AppInfo {
    sort_by_creation(&mut pods);
    let status = workload.status.as_ref();

    AppInfo {
        name: workload.name_any(),
        namespace: workload.namespace().unwrap_or_default(),
        workload_type: "Deployment".to_string(),
        spec_name: workload
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LABEL_SPEC))
            .cloned(),
        image: workload
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .and_then(|s| s.containers.first())
            .and_then(|c| c.image.clone()),
        desired_replicas: workload
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
        labels: workload.metadata.labels.clone().unwrap_or_default(),
        created_at: workload.metadata.creation_timestamp.as_ref().map(|t| t.0),
        pods: pods.iter().map(pod_info).collect(),
    }
}
