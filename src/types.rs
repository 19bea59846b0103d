//! Shared request and view types for the deployment manager.
//!
//! These types are the boundary between the external request surface and the
//! manager core; everything here is plain data with serde derives.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default replica count for a new endpoint.
pub fn default_replicas() -> i32 {
    1
}

/// Default task timeout in seconds; termination grace is this plus 30.
pub fn default_task_timeout() -> i64 {
    300
}

/// Credentials for a private image registry, used during pre-deployment
/// image validation.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCredential {
    pub username: String,
    pub password: String,
}

/// A persistent-volume-backed mount requested for every replica.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMountRequest {
    /// Volume name inside the pod spec.
    pub name: String,
    /// Name of the PersistentVolumeClaim to mount.
    pub claim: String,
    /// Mount path inside the worker container.
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Autoscaling hints recorded on the workload for the external autoscaler.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoscalingHints {
    pub min_replicas: Option<i32>,
    pub max_replicas: Option<i32>,
    /// Target in-flight tasks per replica.
    pub target_inflight: Option<i32>,
}

/// A user-level request to deploy (or re-deploy) an endpoint.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    /// Endpoint name; normalized and validated before use.
    pub endpoint: String,
    /// Name of the resource spec to render against.
    pub spec_name: String,
    /// Container image reference.
    pub image: String,
    #[serde(default = "default_replicas")]
    pub replicas: i32,
    /// Per-task timeout in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_seconds: i64,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMountRequest>,
    /// Size of the /dev/shm emptyDir, e.g. "1Gi".
    #[serde(default)]
    pub shm_size: Option<String>,
    /// Grant the worker the SYS_PTRACE capability.
    #[serde(default)]
    pub enable_ptrace: bool,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub registry_credential: Option<RegistryCredential>,
    /// Verify the image against its registry before deploying.
    #[serde(default)]
    pub validate_image: bool,
    #[serde(default)]
    pub autoscaling: AutoscalingHints,
}

impl DeployRequest {
    pub fn new(
        endpoint: impl Into<String>,
        spec_name: impl Into<String>,
        image: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            spec_name: spec_name.into(),
            image: image.into(),
            replicas: default_replicas(),
            task_timeout_seconds: default_task_timeout(),
            volume_mounts: Vec::new(),
            shm_size: None,
            enable_ptrace: false,
            env: BTreeMap::new(),
            registry_credential: None,
            validate_image: false,
            autoscaling: AutoscalingHints::default(),
        }
    }
}

/// A partial update to an existing endpoint. Unset fields are left
/// unchanged on the workload.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpdateRequest {
    pub image: Option<String>,
    pub replicas: Option<i32>,
    pub task_timeout_seconds: Option<i64>,
    /// Switch to a different resource spec, re-applying its resource
    /// envelope and platform labels/annotations.
    pub spec_name: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub shm_size: Option<String>,
    pub enable_ptrace: Option<bool>,
}

impl UpdateRequest {
    /// True when no field was provided at all.
    pub fn is_empty(&self) -> bool {
        self.image.is_none()
            && self.replicas.is_none()
            && self.task_timeout_seconds.is_none()
            && self.spec_name.is_none()
            && self.env.is_none()
            && self.shm_size.is_none()
            && self.enable_ptrace.is_none()
    }
}

/// Summary of one replica, derived from the watched pod state.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodInfo {
    pub name: String,
    /// Orchestrator phase: Pending, Running, Succeeded, Failed, Unknown.
    pub phase: String,
    pub ready: bool,
    /// The drain label is set: the replica should take no new work.
    pub draining: bool,
    /// The deletion timestamp is set: shutdown is irreversible.
    pub terminating: bool,
    pub deletion_cost: Option<i32>,
    pub node_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Summary of an endpoint: its workload plus current replicas.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    pub namespace: String,
    /// Orchestrator workload kind backing the endpoint.
    pub workload_type: String,
    pub spec_name: Option<String>,
    pub image: Option<String>,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
    pub pods: Vec<PodInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_request_defaults() {
        let req: DeployRequest =
            serde_json::from_str(r#"{"endpoint":"img","specName":"cpu-small","image":"nginx"}"#)
                .unwrap();
        assert_eq!(req.replicas, 1);
        assert_eq!(req.task_timeout_seconds, 300);
        assert!(!req.validate_image);
        assert!(req.volume_mounts.is_empty());
    }

    #[test]
    fn update_request_emptiness() {
        assert!(UpdateRequest::default().is_empty());
        let update = UpdateRequest {
            image: Some("nginx:1.26".to_string()),
            ..Default::default()
        };
        assert!(!update.is_empty());
    }
}
