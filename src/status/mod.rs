//! Failure classification and user-facing status sanitization.
//!
//! Maps orchestrator failure reasons onto stable, safe user messages and
//! scrubs sensitive cluster details out of free-text messages before they
//! leave the manager.

pub mod scrub;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

pub use scrub::Scrubber;

/// Broad classes of worker failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    ImagePullFailed,
    ContainerCrash,
    ResourceLimit,
    Timeout,
    Unknown,
}

/// A user-facing rendering of a failure reason.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SanitizedError {
    pub user_message: String,
    pub suggestion: String,
    /// Stable code for programmatic consumers.
    pub error_code: String,
}

impl SanitizedError {
    fn new(user_message: &str, suggestion: &str, error_code: &str) -> Self {
        Self {
            user_message: user_message.to_string(),
            suggestion: suggestion.to_string(),
            error_code: error_code.to_string(),
        }
    }
}

/// A detected failure on one replica.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFailureInfo {
    #[serde(rename = "type")]
    pub failure_type: FailureType,
    pub reason: String,
    pub message: String,
    pub sanitized_message: String,
    pub occurred_at: DateTime<Utc>,
}

/// Key matched when no entry fits a reason.
const DEFAULT_KEY: &str = "default";

/// Waiting reasons that are part of normal startup, never failures.
const BENIGN_WAITING_REASONS: &[&str] = &["ContainerCreating", "PodInitializing"];

/// Reason keyword tables driving classification. Order matters: timeout
/// reasons are checked first since they embed other keywords.
const TIMEOUT_REASONS: &[&str] = &["ImagePullTimeout", "StartupTimeout", "HealthCheckTimeout"];
const IMAGE_PULL_REASONS: &[&str] = &[
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "ImageInspectError",
];
const CRASH_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "Error",
    "OOMKilled",
    "ContainerCannotRun",
    "CreateContainerError",
];
const RESOURCE_REASONS: &[&str] = &[
    "OutOfMemory",
    "OutOfCpu",
    "Unschedulable",
    "FailedScheduling",
];

/// Classify an arbitrary reason/message pair. Known reasons decide the
/// type on their own; message keywords only apply as a fallback.
pub fn classify(reason: &str, message: &str) -> FailureType {
    let matches_any = |table: &[&str]| table.iter().any(|r| r.eq_ignore_ascii_case(reason));

    if matches_any(TIMEOUT_REASONS) {
        return FailureType::Timeout;
    }
    if matches_any(IMAGE_PULL_REASONS) {
        return FailureType::ImagePullFailed;
    }
    if matches_any(CRASH_REASONS) {
        return FailureType::ContainerCrash;
    }
    if matches_any(RESOURCE_REASONS) {
        return FailureType::ResourceLimit;
    }

    let reason_lower = reason.to_lowercase();
    if reason_lower.contains("timeout") {
        return FailureType::Timeout;
    }
    if reason_lower.contains("pull") || reason_lower.contains("image") {
        return FailureType::ImagePullFailed;
    }
    if reason_lower.contains("oom") || reason_lower.contains("crash") {
        return FailureType::ContainerCrash;
    }
    if reason_lower.contains("sched") || reason_lower.contains("outof") {
        return FailureType::ResourceLimit;
    }

    let message_lower = message.to_lowercase();
    if message_lower.contains("insufficient") || message_lower.contains("no nodes available") {
        return FailureType::ResourceLimit;
    }
    if message_lower.contains("timeout") {
        return FailureType::Timeout;
    }

    FailureType::Unknown
}

/// Mapping tables plus the scrubbing pipeline.
pub struct StatusSanitizer {
    mappings: HashMap<FailureType, Vec<(String, SanitizedError)>>,
    scrubber: Scrubber,
}

impl Default for StatusSanitizer {
    fn default() -> Self {
        Self {
            mappings: built_in_mappings(),
            scrubber: Scrubber::default(),
        }
    }
}

impl StatusSanitizer {
    /// Map a classified failure onto its user-facing rendering.
    ///
    /// Lookup order per type: exact reason, case-insensitive reason,
    /// reason substring, message substring, the type default, and finally
    /// the unknown default.
    pub fn map_failure(
        &self,
        failure_type: FailureType,
        reason: &str,
        message: &str,
    ) -> SanitizedError {
        if let Some(entries) = self.mappings.get(&failure_type) {
            if let Some(hit) = lookup(entries, reason, message) {
                return hit;
            }
        }
        self.mappings
            .get(&FailureType::Unknown)
            .and_then(|entries| entries.iter().find(|(k, _)| k == DEFAULT_KEY))
            .map(|(_, e)| e.clone())
            .unwrap_or_else(|| {
                SanitizedError::new(
                    "The worker failed for an unrecognized reason.",
                    "Inspect the endpoint logs for details.",
                    "UNK-000",
                )
            })
    }

    /// Register an additional mapping. Existing entries shadow new ones by
    /// insertion order.
    pub fn add_mapping(
        &mut self,
        failure_type: FailureType,
        reason: impl Into<String>,
        error: SanitizedError,
    ) {
        self.mappings
            .entry(failure_type)
            .or_default()
            .push((reason.into(), error));
    }

    /// Register an additional scrub pattern.
    pub fn add_pattern(&mut self, pattern: regex::Regex, replacement: impl Into<String>) {
        self.scrubber.add_pattern(pattern, replacement);
    }

    /// Scrub sensitive substrings out of a message.
    pub fn sanitize_message(&self, message: &str) -> String {
        self.scrubber.scrub(message)
    }

    /// Inspect a replica for a failure worth reporting.
    ///
    /// A replica in Terminating state is never a failure: its `Error`
    /// reason is expected shutdown behavior.
    pub fn detect_failure(&self, pod: &Pod) -> Option<WorkerFailureInfo> {
        if pod.metadata.deletion_timestamp.is_some() {
            return None;
        }

        let status = pod.status.as_ref()?;

        if let Some(statuses) = &status.container_statuses {
            for container in statuses {
                let Some(state) = &container.state else {
                    continue;
                };

                if let Some(waiting) = &state.waiting {
                    let reason = waiting.reason.as_deref().unwrap_or("");
                    if reason.is_empty() || BENIGN_WAITING_REASONS.contains(&reason) {
                        continue;
                    }
                    // CrashLoopBackOff carries the interesting detail in the
                    // previous termination, not the waiting message.
                    let message = waiting
                        .message
                        .clone()
                        .or_else(|| {
                            container
                                .last_state
                                .as_ref()
                                .and_then(|s| s.terminated.as_ref())
                                .and_then(|t| t.message.clone())
                        })
                        .unwrap_or_default();
                    return Some(self.build_failure(reason, &message, None));
                }

                if let Some(terminated) = &state.terminated {
                    if terminated.exit_code != 0 {
                        let reason = terminated.reason.as_deref().unwrap_or("Error");
                        let message = terminated.message.clone().unwrap_or_else(|| {
                            format!("container exited with code {}", terminated.exit_code)
                        });
                        let at = terminated.finished_at.as_ref().map(|t| t.0);
                        return Some(self.build_failure(reason, &message, at));
                    }
                }
            }
        }

        // Pods that never got a container: scheduling failures surface as
        // the PodScheduled condition.
        if status.phase.as_deref() == Some("Pending") {
            if let Some(conditions) = &status.conditions {
                if let Some(unschedulable) = conditions.iter().find(|c| {
                    c.type_ == "PodScheduled"
                        && c.status == "False"
                        && c.reason.as_deref() == Some("Unschedulable")
                }) {
                    let message = unschedulable.message.clone().unwrap_or_default();
                    return Some(self.build_failure("Unschedulable", &message, None));
                }
            }
        }

        if status.phase.as_deref() == Some("Failed") {
            let reason = status.reason.as_deref().unwrap_or("Unknown");
            let message = status.message.clone().unwrap_or_default();
            return Some(self.build_failure(reason, &message, None));
        }

        None
    }

    /// Build a failure record from a raw reason/message pair, classifying
    /// and scrubbing on the way. Used for failures observed outside
    /// container state, e.g. orchestrator events and spot interruptions.
    pub fn failure_from_reason(&self, reason: &str, message: &str) -> WorkerFailureInfo {
        self.build_failure(reason, message, None)
    }

    fn build_failure(
        &self,
        reason: &str,
        message: &str,
        occurred_at: Option<DateTime<Utc>>,
    ) -> WorkerFailureInfo {
        WorkerFailureInfo {
            failure_type: classify(reason, message),
            reason: reason.to_string(),
            message: message.to_string(),
            sanitized_message: self.sanitize_message(message),
            occurred_at: occurred_at.unwrap_or_else(Utc::now),
        }
    }
}

fn lookup(
    entries: &[(String, SanitizedError)],
    reason: &str,
    message: &str,
) -> Option<SanitizedError> {
    let find = |pred: &dyn Fn(&str) -> bool| {
        entries
            .iter()
            .find(|(k, _)| k != DEFAULT_KEY && pred(k))
            .map(|(_, e)| e.clone())
    };

    let reason_lower = reason.to_lowercase();
    let message_lower = message.to_lowercase();

    find(&|k| k == reason)
        .or_else(|| find(&|k| k.eq_ignore_ascii_case(reason)))
        .or_else(|| find(&|k| reason_lower.contains(&k.to_lowercase())))
        .or_else(|| find(&|k| message_lower.contains(&k.to_lowercase())))
        .or_else(|| {
            entries
                .iter()
                .find(|(k, _)| k == DEFAULT_KEY)
                .map(|(_, e)| e.clone())
        })
}

fn built_in_mappings() -> HashMap<FailureType, Vec<(String, SanitizedError)>> {
    let mut tables: HashMap<FailureType, Vec<(String, SanitizedError)>> = HashMap::new();

    tables.insert(
        FailureType::ImagePullFailed,
        vec![
            (
                "ImagePullBackOff".into(),
                SanitizedError::new(
                    "The container image could not be pulled and the orchestrator is backing off.",
                    "Verify the image name, tag, and registry credentials.",
                    "IMG-001",
                ),
            ),
            (
                "ErrImagePull".into(),
                SanitizedError::new(
                    "The container image could not be pulled.",
                    "Verify the image exists and is accessible from the cluster.",
                    "IMG-002",
                ),
            ),
            (
                "InvalidImageName".into(),
                SanitizedError::new(
                    "The container image reference is not valid.",
                    "Fix the image reference and redeploy.",
                    "IMG-003",
                ),
            ),
            (
                "ImageInspectError".into(),
                SanitizedError::new(
                    "The container image could not be inspected after download.",
                    "The image may be corrupt; push it again and redeploy.",
                    "IMG-004",
                ),
            ),
            (
                DEFAULT_KEY.into(),
                SanitizedError::new(
                    "The container image could not be retrieved.",
                    "Verify the image reference and registry access.",
                    "IMG-000",
                ),
            ),
        ],
    );

    tables.insert(
        FailureType::ContainerCrash,
        vec![
            (
                "CrashLoopBackOff".into(),
                SanitizedError::new(
                    "The worker keeps crashing shortly after start.",
                    "Check the endpoint logs for a startup error.",
                    "CRASH-001",
                ),
            ),
            (
                "OOMKilled".into(),
                SanitizedError::new(
                    "The worker was killed for exceeding its memory limit.",
                    "Use a resource spec with more memory or reduce the model footprint.",
                    "CRASH-003",
                ),
            ),
            (
                "ContainerCannotRun".into(),
                SanitizedError::new(
                    "The worker container could not be started.",
                    "Check the image entrypoint and command.",
                    "CRASH-004",
                ),
            ),
            (
                "CreateContainerError".into(),
                SanitizedError::new(
                    "The worker container could not be created.",
                    "Check volume mounts and the security settings of the deployment.",
                    "CRASH-005",
                ),
            ),
            (
                "Error".into(),
                SanitizedError::new(
                    "The worker exited with an error.",
                    "Check the endpoint logs for the exit cause.",
                    "CRASH-002",
                ),
            ),
            (
                DEFAULT_KEY.into(),
                SanitizedError::new(
                    "The worker terminated unexpectedly.",
                    "Check the endpoint logs.",
                    "CRASH-000",
                ),
            ),
        ],
    );

    tables.insert(
        FailureType::ResourceLimit,
        vec![
            (
                "OutOfMemory".into(),
                SanitizedError::new(
                    "The cluster has no node with enough free memory for this worker.",
                    "Scale down other endpoints or use a smaller resource spec.",
                    "RES-001",
                ),
            ),
            (
                "OutOfCpu".into(),
                SanitizedError::new(
                    "The cluster has no node with enough free CPU for this worker.",
                    "Scale down other endpoints or use a smaller resource spec.",
                    "RES-002",
                ),
            ),
            (
                "Unschedulable".into(),
                SanitizedError::new(
                    "No cluster node can currently host this worker.",
                    "Check the resource spec against the available node pools.",
                    "RES-003",
                ),
            ),
            (
                "FailedScheduling".into(),
                SanitizedError::new(
                    "The worker could not be scheduled onto a node.",
                    "Check the resource spec against the available node pools.",
                    "RES-004",
                ),
            ),
            (
                DEFAULT_KEY.into(),
                SanitizedError::new(
                    "The worker hit a cluster resource limit.",
                    "Reduce the requested resources or free up capacity.",
                    "RES-000",
                ),
            ),
        ],
    );

    tables.insert(
        FailureType::Timeout,
        vec![
            (
                "ImagePullTimeout".into(),
                SanitizedError::new(
                    "Pulling the container image timed out.",
                    "Large images can exceed the pull deadline; retry or use a smaller image.",
                    "TMO-001",
                ),
            ),
            (
                "StartupTimeout".into(),
                SanitizedError::new(
                    "The worker did not become ready in time.",
                    "Increase the task timeout or speed up worker startup.",
                    "TMO-002",
                ),
            ),
            (
                "HealthCheckTimeout".into(),
                SanitizedError::new(
                    "The worker stopped answering health checks in time.",
                    "Check for long-running requests blocking the worker.",
                    "TMO-003",
                ),
            ),
            (
                DEFAULT_KEY.into(),
                SanitizedError::new(
                    "The operation timed out.",
                    "Retry; if the problem persists, check worker startup time.",
                    "TMO-000",
                ),
            ),
        ],
    );

    tables.insert(
        FailureType::Unknown,
        vec![(
            DEFAULT_KEY.into(),
            SanitizedError::new(
                "The worker failed for an unrecognized reason.",
                "Inspect the endpoint logs for details.",
                "UNK-000",
            ),
        )],
    );

    tables
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus,
        PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

    use super::*;

    fn pod_with_waiting(reason: &str, message: &str) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "img-worker".to_string(),
                    state: Some(ContainerState {
                        waiting: Some(ContainerStateWaiting {
                            reason: Some(reason.to_string()),
                            message: Some(message.to_string()),
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn known_reasons_classify_regardless_of_message() {
        let cases = [
            ("ImagePullBackOff", FailureType::ImagePullFailed),
            ("ErrImagePull", FailureType::ImagePullFailed),
            ("InvalidImageName", FailureType::ImagePullFailed),
            ("ImageInspectError", FailureType::ImagePullFailed),
            ("CrashLoopBackOff", FailureType::ContainerCrash),
            ("Error", FailureType::ContainerCrash),
            ("OOMKilled", FailureType::ContainerCrash),
            ("ContainerCannotRun", FailureType::ContainerCrash),
            ("CreateContainerError", FailureType::ContainerCrash),
            ("OutOfMemory", FailureType::ResourceLimit),
            ("OutOfcpu", FailureType::ResourceLimit),
            ("Unschedulable", FailureType::ResourceLimit),
            ("FailedScheduling", FailureType::ResourceLimit),
            ("ImagePullTimeout", FailureType::Timeout),
            ("StartupTimeout", FailureType::Timeout),
            ("HealthCheckTimeout", FailureType::Timeout),
        ];
        for (reason, expected) in cases {
            for message in ["", "timeout", "insufficient memory"] {
                assert_eq!(classify(reason, message), expected, "{reason} / {message}");
            }
        }
    }

    #[test]
    fn message_fallbacks_apply_only_for_unknown_reasons() {
        assert_eq!(
            classify("Strange", "0/5 nodes available: insufficient cpu"),
            FailureType::ResourceLimit
        );
        assert_eq!(
            classify("Strange", "no nodes available to schedule pods"),
            FailureType::ResourceLimit
        );
        assert_eq!(
            classify("Strange", "context deadline exceeded: timeout"),
            FailureType::Timeout
        );
        assert_eq!(classify("Strange", "who knows"), FailureType::Unknown);
    }

    #[test]
    fn lookup_order_walks_exact_then_fuzzy_then_default() {
        let sanitizer = StatusSanitizer::default();

        let exact = sanitizer.map_failure(FailureType::ImagePullFailed, "ImagePullBackOff", "");
        assert_eq!(exact.error_code, "IMG-001");

        let case_insensitive =
            sanitizer.map_failure(FailureType::ImagePullFailed, "imagepullbackoff", "");
        assert_eq!(case_insensitive.error_code, "IMG-001");

        let reason_substring = sanitizer.map_failure(
            FailureType::ImagePullFailed,
            "Back-off: ErrImagePull on node",
            "",
        );
        assert_eq!(reason_substring.error_code, "IMG-002");

        let message_substring = sanitizer.map_failure(
            FailureType::ImagePullFailed,
            "Waiting",
            "rpc error: ErrImagePull while fetching manifest",
        );
        assert_eq!(message_substring.error_code, "IMG-002");

        let type_default = sanitizer.map_failure(FailureType::ImagePullFailed, "Novel", "");
        assert_eq!(type_default.error_code, "IMG-000");

        let unknown_default = sanitizer.map_failure(FailureType::Unknown, "Novel", "");
        assert_eq!(unknown_default.error_code, "UNK-000");
    }

    #[test]
    fn caller_registered_mappings_are_shadowed_by_existing_entries() {
        let mut sanitizer = StatusSanitizer::default();
        sanitizer.add_mapping(
            FailureType::ImagePullFailed,
            "ImagePullBackOff",
            SanitizedError::new("custom", "custom", "CUSTOM-1"),
        );
        sanitizer.add_mapping(
            FailureType::ImagePullFailed,
            "QuotaExceeded",
            SanitizedError::new("registry quota exceeded", "wait and retry", "CUSTOM-2"),
        );

        // The built-in entry was inserted first and wins.
        let shadowed = sanitizer.map_failure(FailureType::ImagePullFailed, "ImagePullBackOff", "");
        assert_eq!(shadowed.error_code, "IMG-001");

        // Genuinely new reasons resolve to the addition.
        let added = sanitizer.map_failure(FailureType::ImagePullFailed, "QuotaExceeded", "");
        assert_eq!(added.error_code, "CUSTOM-2");
    }

    #[test]
    fn terminating_pods_are_never_failures() {
        let mut pod = pod_with_waiting("CrashLoopBackOff", "boom");
        pod.metadata = ObjectMeta {
            deletion_timestamp: Some(Time(Utc::now())),
            ..Default::default()
        };
        assert!(StatusSanitizer::default().detect_failure(&pod).is_none());
    }

    #[test]
    fn waiting_and_terminated_states_are_detected() {
        let sanitizer = StatusSanitizer::default();

        let failure = sanitizer
            .detect_failure(&pod_with_waiting("ImagePullBackOff", "pull failed"))
            .unwrap();
        assert_eq!(failure.failure_type, FailureType::ImagePullFailed);
        assert_eq!(failure.reason, "ImagePullBackOff");

        let benign = pod_with_waiting("ContainerCreating", "");
        assert!(sanitizer.detect_failure(&benign).is_none());

        let pod = Pod {
            status: Some(PodStatus {
                container_statuses: Some(vec![ContainerStatus {
                    name: "img-worker".to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: 137,
                            reason: Some("OOMKilled".to_string()),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let failure = sanitizer.detect_failure(&pod).unwrap();
        assert_eq!(failure.failure_type, FailureType::ContainerCrash);
        assert_eq!(failure.reason, "OOMKilled");
    }

    #[test]
    fn unschedulable_pending_pods_are_resource_failures() {
        let pod = Pod {
            status: Some(PodStatus {
                phase: Some("Pending".to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "PodScheduled".to_string(),
                    status: "False".to_string(),
                    reason: Some("Unschedulable".to_string()),
                    message: Some("0/3 nodes are available: insufficient memory".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let failure = StatusSanitizer::default().detect_failure(&pod).unwrap();
        assert_eq!(failure.failure_type, FailureType::ResourceLimit);
    }
}
