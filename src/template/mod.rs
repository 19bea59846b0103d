//! Workload rendering.
//!
//! Renders a deploy request and its resource spec into an `apps/v1`
//! Deployment. Rendering is a pure function: equal inputs produce
//! byte-equal output (all maps are ordered), which the manager relies on
//! for idempotency checks and the preview operation.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec, ResourceRequirements,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::config::{
    ANNOTATION_MAX_REPLICAS, ANNOTATION_MIN_REPLICAS, ANNOTATION_PLATFORM_ANNOTATIONS,
    ANNOTATION_PLATFORM_LABELS, ANNOTATION_TARGET_INFLIGHT, CONTAINER_PORT, LABEL_APP,
    LABEL_MANAGED_BY, LABEL_SPEC, MANAGER_ID, PROXY_PORT, RESERVED_ENV_PREFIX, RESERVED_PREFIX,
};
use crate::error::Result;
use crate::platform::PlatformCapability;
use crate::specs::{Category, PlatformConfig, ResourceSpec};
use crate::types::DeployRequest;

/// Name of the /dev/shm emptyDir volume.
const SHM_VOLUME: &str = "dshm";
/// Additional seconds of termination grace beyond the task timeout.
pub const GRACE_PERIOD_MARGIN_SECONDS: i64 = 30;

/// Labels stamped on the workload and its pod template.
pub fn workload_labels(endpoint: &str, spec_name: &str) -> BTreeMap<String, String> {
    let mut labels = selector_labels(endpoint);
    labels.insert(LABEL_SPEC.to_string(), spec_name.to_string());
    labels
}

/// The immutable subset of labels used for the workload selector.
pub fn selector_labels(endpoint: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGER_ID.to_string()),
        (LABEL_APP.to_string(), endpoint.to_string()),
    ])
}

/// Worker container name for an endpoint.
pub fn container_name(endpoint: &str) -> String {
    format!("{endpoint}-worker")
}

/// Platform labels with reserved-prefix keys stripped; those keys belong
/// to the manager at runtime and are never sourced from specs.
pub fn platform_label_set(config: &PlatformConfig) -> BTreeMap<String, String> {
    config
        .labels
        .iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Platform annotations with reserved keys stripped, run through the
/// platform capability so vendor hints are applied and recorded together.
pub fn platform_annotation_set(
    config: &PlatformConfig,
    capability: &dyn PlatformCapability,
    spec: &ResourceSpec,
) -> BTreeMap<String, String> {
    let filtered = config
        .annotations
        .iter()
        .filter(|(k, _)| !k.starts_with(RESERVED_PREFIX))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    capability.customize_annotations(filtered, spec)
}

/// Serialize the applied key set for the record annotation. `None` when
/// nothing was applied, so the record is cleared rather than written empty.
pub fn encode_record(keys: &BTreeMap<String, String>) -> Option<String> {
    if keys.is_empty() {
        return None;
    }
    let names: Vec<&str> = keys.keys().map(String::as_str).collect();
    serde_json::to_string(&names).ok()
}

/// Parse a record annotation back into the key list. Absent or corrupt
/// records yield an empty list.
pub fn decode_record(annotations: Option<&BTreeMap<String, String>>, record_key: &str) -> Vec<String> {
    annotations
        .and_then(|a| a.get(record_key))
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

/// Merge request env with manager defaults and inject the system set.
///
/// Request values win over global defaults except under the reserved
/// prefix, which always comes from the manager side.
pub fn merge_env(
    request_env: &BTreeMap<String, String>,
    global_env: &BTreeMap<String, String>,
    endpoint: &str,
    task_timeout_seconds: i64,
) -> Vec<EnvVar> {
    let mut merged: BTreeMap<String, String> = global_env.clone();
    for (key, value) in request_env {
        if key.starts_with(RESERVED_ENV_PREFIX) && global_env.contains_key(key) {
            continue;
        }
        merged.insert(key.clone(), value.clone());
    }

    merged.insert(format!("{RESERVED_ENV_PREFIX}ENDPOINT"), endpoint.to_string());
    merged.insert(
        format!("{RESERVED_ENV_PREFIX}PORT"),
        CONTAINER_PORT.to_string(),
    );
    merged.insert(
        format!("{RESERVED_ENV_PREFIX}PROXY_PORT"),
        PROXY_PORT.to_string(),
    );
    merged.insert(
        format!("{RESERVED_ENV_PREFIX}TASK_TIMEOUT"),
        task_timeout_seconds.to_string(),
    );

    merged
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

/// Render the workload for a deploy request.
pub fn render_workload(
    request: &DeployRequest,
    spec: &ResourceSpec,
    capability: &dyn PlatformCapability,
    namespace: &str,
    global_env: &BTreeMap<String, String>,
) -> Result<Deployment> {
    let endpoint = &request.endpoint;
    let platform_config = spec.platform(capability.name());

    let labels = workload_labels(endpoint, &spec.name);
    let platform_labels = platform_label_set(&platform_config);
    let platform_annotations = platform_annotation_set(&platform_config, capability, spec);

    // Workload-level annotations: the platform record set plus
    // autoscaling hints for the external autoscaler.
    let mut annotations = BTreeMap::new();
    if let Some(record) = encode_record(&platform_labels) {
        annotations.insert(ANNOTATION_PLATFORM_LABELS.to_string(), record);
    }
    if let Some(record) = encode_record(&platform_annotations) {
        annotations.insert(ANNOTATION_PLATFORM_ANNOTATIONS.to_string(), record);
    }
    if let Some(min) = request.autoscaling.min_replicas {
        annotations.insert(ANNOTATION_MIN_REPLICAS.to_string(), min.to_string());
    }
    if let Some(max) = request.autoscaling.max_replicas {
        annotations.insert(ANNOTATION_MAX_REPLICAS.to_string(), max.to_string());
    }
    if let Some(target) = request.autoscaling.target_inflight {
        annotations.insert(ANNOTATION_TARGET_INFLIGHT.to_string(), target.to_string());
    }

    let mut template_labels = labels.clone();
    template_labels.extend(platform_labels);

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(endpoint.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(request.replicas),
            selector: LabelSelector {
                match_labels: Some(selector_labels(endpoint)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(template_labels),
                    annotations: (!platform_annotations.is_empty())
                        .then_some(platform_annotations),
                    ..Default::default()
                }),
                spec: Some(build_pod_spec(request, spec, &platform_config, global_env)),
            },
            ..Default::default()
        }),
        status: None,
    })
}

/// Render the workload as YAML for the preview operation.
pub fn render_yaml(
    request: &DeployRequest,
    spec: &ResourceSpec,
    capability: &dyn PlatformCapability,
    namespace: &str,
    global_env: &BTreeMap<String, String>,
) -> Result<String> {
    let workload = render_workload(request, spec, capability, namespace, global_env)?;
    serde_yaml::to_string(&workload)
        .map_err(|e| crate::error::Error::ConfigError(format!("failed to render YAML: {e}")))
}

fn build_pod_spec(
    request: &DeployRequest,
    spec: &ResourceSpec,
    platform_config: &PlatformConfig,
    global_env: &BTreeMap<String, String>,
) -> PodSpec {
    PodSpec {
        containers: vec![build_container(request, spec, global_env)],
        volumes: Some(build_volumes(request, spec)),
        termination_grace_period_seconds: Some(
            request.task_timeout_seconds + GRACE_PERIOD_MARGIN_SECONDS,
        ),
        node_selector: (!platform_config.node_selector.is_empty())
            .then(|| platform_config.node_selector.clone()),
        tolerations: (!platform_config.tolerations.is_empty())
            .then(|| platform_config.tolerations.clone()),
        ..Default::default()
    }
}

fn build_container(
    request: &DeployRequest,
    spec: &ResourceSpec,
    global_env: &BTreeMap<String, String>,
) -> Container {
    let mut mounts = vec![VolumeMount {
        name: SHM_VOLUME.to_string(),
        mount_path: "/dev/shm".to_string(),
        ..Default::default()
    }];
    for mount in &request.volume_mounts {
        mounts.push(VolumeMount {
            name: mount.name.clone(),
            mount_path: mount.mount_path.clone(),
            read_only: mount.read_only.then_some(true),
            ..Default::default()
        });
    }

    Container {
        name: container_name(&request.endpoint),
        image: Some(request.image.clone()),
        ports: Some(vec![
            ContainerPort {
                name: Some("http".to_string()),
                container_port: CONTAINER_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("proxy".to_string()),
                container_port: PROXY_PORT,
                ..Default::default()
            },
        ]),
        env: Some(merge_env(
            &request.env,
            global_env,
            &request.endpoint,
            request.task_timeout_seconds,
        )),
        resources: Some(resource_requirements(spec)),
        volume_mounts: Some(mounts),
        security_context: security_context(request.enable_ptrace),
        ..Default::default()
    }
}

/// Resource requirements for a spec's envelope; requests equal limits so
/// inference workers get predictable placement.
pub fn resource_requirements(spec: &ResourceSpec) -> ResourceRequirements {
    let mut quantities = BTreeMap::new();
    quantities.insert(
        "memory".to_string(),
        Quantity(spec.resources.memory.clone()),
    );
    if let Some(cpu) = spec.resources.cpu.as_ref().filter(|c| !c.is_empty()) {
        quantities.insert("cpu".to_string(), Quantity(cpu.clone()));
    }
    quantities.insert(
        "ephemeral-storage".to_string(),
        Quantity(spec.resources.ephemeral_storage.clone()),
    );
    if spec.category == Category::Gpu {
        let key = spec
            .resources
            .gpu_type
            .clone()
            .unwrap_or_else(|| "nvidia.com/gpu".to_string());
        let count = spec.resources.gpu.unwrap_or(1);
        quantities.insert(key, Quantity(count.to_string()));
    }

    ResourceRequirements {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        claims: None,
    }
}

fn build_volumes(request: &DeployRequest, spec: &ResourceSpec) -> Vec<Volume> {
    let shm_size = request
        .shm_size
        .clone()
        .or_else(|| spec.resources.shm_size.clone());

    let mut volumes = vec![Volume {
        name: SHM_VOLUME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            size_limit: shm_size.map(Quantity),
        }),
        ..Default::default()
    }];

    for mount in &request.volume_mounts {
        volumes.push(Volume {
            name: mount.name.clone(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: mount.claim.clone(),
                read_only: mount.read_only.then_some(true),
            }),
            ..Default::default()
        });
    }

    volumes
}

/// Security context for the worker container. Empty contexts collapse to
/// `None` so toggling ptrace off round-trips to an unset field.
pub fn security_context(enable_ptrace: bool) -> Option<SecurityContext> {
    enable_ptrace.then(|| SecurityContext {
        capabilities: Some(Capabilities {
            add: Some(vec!["SYS_PTRACE".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{capability_for, GenericPlatform};
    use crate::config::PlatformKind;
    use crate::specs::fixtures;
    use crate::types::VolumeMountRequest;

    fn render(request: &DeployRequest, spec: &ResourceSpec) -> Deployment {
        render_workload(request, spec, &GenericPlatform, "prod", &BTreeMap::new()).unwrap()
    }

    fn container(dep: &Deployment) -> &Container {
        &dep.spec.as_ref().unwrap().template.spec.as_ref().unwrap().containers[0]
    }

    #[test]
    fn rendering_is_deterministic() {
        let mut request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        request.env.insert("B".to_string(), "2".to_string());
        request.env.insert("A".to_string(), "1".to_string());
        let spec = fixtures::cpu_small();

        let a = render_yaml(&request, &spec, &GenericPlatform, "prod", &BTreeMap::new()).unwrap();
        let b = render_yaml(&request, &spec, &GenericPlatform, "prod", &BTreeMap::new()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn workload_carries_the_reserved_labels() {
        let request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        let dep = render(&request, &fixtures::cpu_small());

        let labels = dep.metadata.labels.as_ref().unwrap();
        assert_eq!(labels.get(LABEL_MANAGED_BY).unwrap(), MANAGER_ID);
        assert_eq!(labels.get(LABEL_APP).unwrap(), "img");
        assert_eq!(labels.get(LABEL_SPEC).unwrap(), "cpu-small");
        assert_eq!(dep.metadata.name.as_deref(), Some("img"));
        assert_eq!(dep.metadata.namespace.as_deref(), Some("prod"));
        assert_eq!(container(&dep).name, "img-worker");
    }

    #[test]
    fn selector_excludes_the_spec_label() {
        let request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        let dep = render(&request, &fixtures::cpu_small());
        let selector = dep
            .spec
            .as_ref()
            .unwrap()
            .selector
            .match_labels
            .as_ref()
            .unwrap();
        assert!(selector.contains_key(LABEL_APP));
        assert!(!selector.contains_key(LABEL_SPEC));
    }

    #[test]
    fn cpu_is_omitted_when_empty_and_gpu_only_for_gpu_specs() {
        let request = DeployRequest::new("img", "cpu-small", "nginx:1.25");

        let mut spec = fixtures::cpu_small();
        spec.resources.cpu = None;
        let dep = render(&request, &spec);
        let requests = container(&dep)
            .resources
            .as_ref()
            .unwrap()
            .requests
            .as_ref()
            .unwrap();
        assert!(!requests.contains_key("cpu"));
        assert!(requests.contains_key("memory"));
        assert!(!requests.keys().any(|k| k.contains("gpu")));

        let dep = render(&request, &fixtures::gpu_a10());
        let limits = container(&dep)
            .resources
            .as_ref()
            .unwrap()
            .limits
            .as_ref()
            .unwrap();
        assert_eq!(limits.get("nvidia.com/gpu").unwrap().0, "1");
    }

    #[test]
    fn reserved_platform_labels_are_never_propagated() {
        let mut spec = fixtures::cpu_small();
        let platform = spec.platforms.get_mut("generic").unwrap();
        platform
            .labels
            .insert("pool".to_string(), "shared".to_string());
        platform
            .labels
            .insert(format!("{RESERVED_PREFIX}drain"), "true".to_string());

        let request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        let dep = render(&request, &spec);

        let template_labels = dep
            .spec
            .as_ref()
            .unwrap()
            .template
            .metadata
            .as_ref()
            .unwrap()
            .labels
            .as_ref()
            .unwrap();
        assert_eq!(template_labels.get("pool").unwrap(), "shared");
        assert!(!template_labels.contains_key(&format!("{RESERVED_PREFIX}drain")));

        let record = dep
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .get(ANNOTATION_PLATFORM_LABELS)
            .unwrap();
        assert_eq!(record, r#"["pool"]"#);
    }

    #[test]
    fn record_annotation_is_cleared_when_no_platform_keys_apply() {
        let request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        let dep = render(&request, &fixtures::cpu_small());
        assert!(dep.metadata.annotations.is_none());
    }

    #[test]
    fn shm_volume_uses_memory_medium_with_the_requested_limit() {
        let mut request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        request.shm_size = Some("1Gi".to_string());
        let dep = render(&request, &fixtures::cpu_small());

        let volumes = dep
            .spec
            .as_ref()
            .unwrap()
            .template
            .spec
            .as_ref()
            .unwrap()
            .volumes
            .as_ref()
            .unwrap();
        let shm = volumes.iter().find(|v| v.name == SHM_VOLUME).unwrap();
        let empty_dir = shm.empty_dir.as_ref().unwrap();
        assert_eq!(empty_dir.medium.as_deref(), Some("Memory"));
        assert_eq!(empty_dir.size_limit.as_ref().unwrap().0, "1Gi");
    }

    #[test]
    fn volume_mounts_render_one_pvc_volume_each() {
        let mut request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        request.volume_mounts.push(VolumeMountRequest {
            name: "models".to_string(),
            claim: "models-pvc".to_string(),
            mount_path: "/models".to_string(),
            read_only: true,
        });
        let dep = render(&request, &fixtures::cpu_small());

        let pod_spec = dep.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        let volume = pod_spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .find(|v| v.name == "models")
            .unwrap();
        assert_eq!(
            volume
                .persistent_volume_claim
                .as_ref()
                .unwrap()
                .claim_name,
            "models-pvc"
        );
        let mount = container(&dep)
            .volume_mounts
            .as_ref()
            .unwrap()
            .iter()
            .find(|m| m.name == "models")
            .unwrap();
        assert_eq!(mount.mount_path, "/models");
        assert_eq!(mount.read_only, Some(true));
    }

    #[test]
    fn ptrace_toggles_the_capability_and_collapses_when_off() {
        let mut request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        request.enable_ptrace = true;
        let dep = render(&request, &fixtures::cpu_small());
        let caps = container(&dep)
            .security_context
            .as_ref()
            .unwrap()
            .capabilities
            .as_ref()
            .unwrap();
        assert_eq!(caps.add.as_ref().unwrap(), &vec!["SYS_PTRACE".to_string()]);

        request.enable_ptrace = false;
        let dep = render(&request, &fixtures::cpu_small());
        assert!(container(&dep).security_context.is_none());
    }

    #[test]
    fn env_merge_preserves_reserved_variables() {
        let mut request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        request
            .env
            .insert("ORBITER_ENDPOINT".to_string(), "spoofed".to_string());
        request.env.insert("MODE".to_string(), "fast".to_string());

        let global = BTreeMap::from([
            ("MODE".to_string(), "safe".to_string()),
            ("REGION".to_string(), "eu".to_string()),
        ]);
        let env = merge_env(&request.env, &global, "img", 300);
        let get = |name: &str| {
            env.iter()
                .find(|e| e.name == name)
                .and_then(|e| e.value.clone())
        };

        // Request values win over defaults, but the system set always
        // comes from the manager side.
        assert_eq!(get("MODE").unwrap(), "fast");
        assert_eq!(get("REGION").unwrap(), "eu");
        assert_eq!(get("ORBITER_ENDPOINT").unwrap(), "img");
        assert_eq!(get("ORBITER_TASK_TIMEOUT").unwrap(), "300");

        // Deterministic ordering.
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn grace_period_is_task_timeout_plus_margin() {
        let mut request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
        request.task_timeout_seconds = 120;
        let dep = render(&request, &fixtures::cpu_small());
        assert_eq!(
            dep.spec
                .as_ref()
                .unwrap()
                .template
                .spec
                .as_ref()
                .unwrap()
                .termination_grace_period_seconds,
            Some(150)
        );
    }

    #[test]
    fn platform_scheduling_hints_are_applied() {
        let spec = fixtures::gpu_a10();
        let request = DeployRequest::new("img", "gpu-a10", "tritonserver:24.01");
        let dep = render_workload(
            &request,
            &spec,
            capability_for(PlatformKind::AwsEks),
            "prod",
            &BTreeMap::new(),
        )
        .unwrap();

        let pod_spec = dep.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(
            pod_spec
                .node_selector
                .as_ref()
                .unwrap()
                .get("node.kubernetes.io/instance-type")
                .unwrap(),
            "g5.xlarge"
        );
    }

    #[test]
    fn record_round_trips_through_decode() {
        let keys = BTreeMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]);
        let record = encode_record(&keys).unwrap();
        let annotations = BTreeMap::from([(ANNOTATION_PLATFORM_LABELS.to_string(), record)]);
        assert_eq!(
            decode_record(Some(&annotations), ANNOTATION_PLATFORM_LABELS),
            vec!["a".to_string(), "b".to_string()]
        );
        assert!(decode_record(None, ANNOTATION_PLATFORM_LABELS).is_empty());
    }
}
