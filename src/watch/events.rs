//! Typed events derived from watched workload and pod state.
//!
//! The classification functions here are pure: they compare the previous
//! and current object as remembered by the watch cache and decide which
//! subscriber-facing events a transition produces.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Serialize;

use crate::config::LABEL_APP;

/// Label the deployment controller maintains on replica-set templates.
/// When both sides of an update carry it, comparing it beats comparing
/// the canonical template.
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Replica-count and availability snapshot for one workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaEvent {
    pub workload_name: String,
    pub desired_replicas: i32,
    pub ready_replicas: i32,
    pub available_replicas: i32,
    pub conditions: Vec<WorkloadCondition>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    pub reason: Option<String>,
    pub message: Option<String>,
}

/// Emitted exactly once per replica at the Running→Terminating edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodTerminatingEvent {
    pub pod_name: String,
    pub endpoint: String,
}

/// Emitted when a workload's pod template changed in a way that forces
/// replica recreation. Replica-count-only changes never produce this.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateChangeEvent {
    pub endpoint: String,
}

/// Snapshot a workload into a replica event.
pub fn replica_event(workload: &Deployment) -> ReplicaEvent {
    let status = workload.status.as_ref();
    let conditions = status
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .map(|c| WorkloadCondition {
                    condition_type: c.type_.clone(),
                    status: c.status.clone(),
                    reason: c.reason.clone(),
                    message: c.message.clone(),
                })
                .collect()
        })
        .unwrap_or_default();

    ReplicaEvent {
        workload_name: workload.name_any(),
        desired_replicas: workload
            .spec
            .as_ref()
            .and_then(|s| s.replicas)
            .unwrap_or(0),
        ready_replicas: status.and_then(|s| s.ready_replicas).unwrap_or(0),
        available_replicas: status.and_then(|s| s.available_replicas).unwrap_or(0),
        conditions,
    }
}

/// Synthetic zeroed event emitted when a workload disappears.
pub fn deleted_replica_event(workload_name: &str) -> ReplicaEvent {
    ReplicaEvent {
        workload_name: workload_name.to_string(),
        desired_replicas: 0,
        ready_replicas: 0,
        available_replicas: 0,
        conditions: vec![WorkloadCondition {
            condition_type: "Deleted".to_string(),
            status: "True".to_string(),
            reason: Some("WorkloadDeleted".to_string()),
            message: None,
        }],
    }
}

/// Whether this update crosses the Running→Terminating edge: the deletion
/// timestamp transitions from unset (or unseen) to set.
pub fn pod_terminating_edge(old: Option<&Pod>, new: &Pod) -> bool {
    if new.metadata.deletion_timestamp.is_none() {
        return false;
    }
    match old {
        Some(old) => old.metadata.deletion_timestamp.is_none(),
        // First sight of the pod already terminating: the previous state
        // was never observed with a timestamp, so this is the edge.
        None => true,
    }
}

/// Build the terminating event for a pod, resolving the endpoint from the
/// app label. Pods without the label are not ours and yield `None`.
pub fn pod_terminating_event(pod: &Pod) -> Option<PodTerminatingEvent> {
    let endpoint = pod.metadata.labels.as_ref()?.get(LABEL_APP)?.clone();
    Some(PodTerminatingEvent {
        pod_name: pod.name_any(),
        endpoint,
    })
}

/// Whether the pod template changed between two versions of a workload.
///
/// The orchestrator-maintained template-hash label decides when both sides
/// carry it; otherwise the templates are canonicalized to JSON values and
/// compared, which is insensitive to key ordering. Replica-count changes
/// live outside the template and can never register here.
pub fn template_changed(old: &Deployment, new: &Deployment) -> bool {
    let hash = |workload: &Deployment| {
        workload
            .spec
            .as_ref()
            .and_then(|s| s.template.metadata.as_ref())
            .and_then(|m| m.labels.as_ref())
            .and_then(|l| l.get(POD_TEMPLATE_HASH_LABEL))
            .cloned()
    };

    if let (Some(old_hash), Some(new_hash)) = (hash(old), hash(new)) {
        return old_hash != new_hash;
    }

    let canonical = |workload: &Deployment| {
        workload
            .spec
            .as_ref()
            .map(|s| serde_json::to_value(&s.template).unwrap_or(serde_json::Value::Null))
            .unwrap_or(serde_json::Value::Null)
    };
    canonical(old) != canonical(new)
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use chrono::Utc;

    use super::*;

    fn workload(replicas: i32, image: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("img".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta::default()),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "img-worker".to_string(),
                            image: Some(image.to_string()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                ready_replicas: Some(1),
                available_replicas: Some(1),
                conditions: Some(vec![DeploymentCondition {
                    type_: "Available".to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn pod(name: &str, endpoint: Option<&str>, terminating: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: endpoint
                    .map(|e| std::collections::BTreeMap::from([(LABEL_APP.to_string(), e.to_string())])),
                deletion_timestamp: terminating.then(|| Time(Utc::now())),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn replica_event_snapshots_counts_and_conditions() {
        let event = replica_event(&workload(2, "nginx:1.25"));
        assert_eq!(event.workload_name, "img");
        assert_eq!(event.desired_replicas, 2);
        assert_eq!(event.ready_replicas, 1);
        assert_eq!(event.available_replicas, 1);
        assert_eq!(event.conditions[0].condition_type, "Available");
    }

    #[test]
    fn deleted_event_is_zeroed_with_a_deleted_condition() {
        let event = deleted_replica_event("img");
        assert_eq!(event.desired_replicas, 0);
        assert_eq!(event.ready_replicas, 0);
        assert_eq!(event.available_replicas, 0);
        assert_eq!(event.conditions[0].condition_type, "Deleted");
    }

    #[test]
    fn replica_count_changes_are_not_template_changes() {
        let old = workload(2, "nginx:1.25");
        let new = workload(4, "nginx:1.25");
        assert!(!template_changed(&old, &new));
    }

    #[test]
    fn image_and_spec_changes_are_template_changes() {
        let old = workload(2, "nginx:1.25");
        let mut new = workload(2, "nginx:1.26");
        assert!(template_changed(&old, &new));

        new = workload(2, "nginx:1.25");
        new.spec
            .as_mut()
            .unwrap()
            .template
            .spec
            .as_mut()
            .unwrap()
            .termination_grace_period_seconds = Some(600);
        assert!(template_changed(&old, &new));
    }

    #[test]
    fn template_hash_labels_win_when_both_sides_carry_them() {
        let with_hash = |hash: &str, image: &str| {
            let mut workload = workload(2, image);
            workload
                .spec
                .as_mut()
                .unwrap()
                .template
                .metadata
                .as_mut()
                .unwrap()
                .labels = Some(std::collections::BTreeMap::from([(
                POD_TEMPLATE_HASH_LABEL.to_string(),
                hash.to_string(),
            )]));
            workload
        };

        // Same hash: no change even though something cosmetic differs.
        assert!(!template_changed(
            &with_hash("abc", "nginx:1.25"),
            &with_hash("abc", "nginx:1.25"),
        ));
        assert!(template_changed(
            &with_hash("abc", "nginx:1.25"),
            &with_hash("def", "nginx:1.26"),
        ));
    }

    #[test]
    fn terminating_edge_fires_once() {
        let running = pod("img-abc-x", Some("img"), false);
        let terminating = pod("img-abc-x", Some("img"), true);

        assert!(pod_terminating_edge(Some(&running), &terminating));
        // Already seen terminating: no second edge.
        assert!(!pod_terminating_edge(Some(&terminating), &terminating));
        assert!(!pod_terminating_edge(Some(&running), &running));
        // First observation already terminating counts as the edge.
        assert!(pod_terminating_edge(None, &terminating));
    }

    #[test]
    fn terminating_event_resolves_the_endpoint_label() {
        let event = pod_terminating_event(&pod("img-abc-x", Some("img"), true)).unwrap();
        assert_eq!(event.pod_name, "img-abc-x");
        assert_eq!(event.endpoint, "img");

        assert!(pod_terminating_event(&pod("stray", None, true)).is_none());
    }
}
