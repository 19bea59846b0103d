//! Manager configuration and the reserved label/annotation wire contract.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Identity of this manager; value of the `managed-by` label and the
/// field-manager name on server-side writes.
pub const MANAGER_ID: &str = "orbiter-manager";

/// Reserved prefix for all Orbiter-owned labels and annotations.
/// Keys under this prefix are never sourced from resource specs.
pub const RESERVED_PREFIX: &str = "orbiter.dev/";

/// Reserved prefix for system-injected environment variables. Variables
/// under this prefix are preserved through updates and cannot be
/// overridden by deploy requests.
pub const RESERVED_ENV_PREFIX: &str = "ORBITER_";

/// Label discriminating workloads and pods owned by this manager.
pub const LABEL_MANAGED_BY: &str = "orbiter.dev/managed-by";
/// Label carrying the endpoint name.
pub const LABEL_APP: &str = "orbiter.dev/app";
/// Label tracking the resource spec a workload was rendered from.
pub const LABEL_SPEC: &str = "orbiter.dev/spec";
/// Label marking a replica as draining (scale-down intent).
pub const LABEL_DRAIN: &str = "orbiter.dev/drain";

/// Annotation recording the platform-sourced label keys currently applied.
pub const ANNOTATION_PLATFORM_LABELS: &str = "orbiter.dev/platform-labels";
/// Annotation recording the platform-sourced annotation keys currently applied.
pub const ANNOTATION_PLATFORM_ANNOTATIONS: &str = "orbiter.dev/platform-annotations";
/// Orchestrator-native annotation biasing which replica is culled first.
pub const ANNOTATION_DELETION_COST: &str = "controller.kubernetes.io/pod-deletion-cost";

/// Annotations recording autoscaling hints from the deploy request.
pub const ANNOTATION_MIN_REPLICAS: &str = "orbiter.dev/min-replicas";
pub const ANNOTATION_MAX_REPLICAS: &str = "orbiter.dev/max-replicas";
pub const ANNOTATION_TARGET_INFLIGHT: &str = "orbiter.dev/target-inflight";

/// Worker container port.
pub const CONTAINER_PORT: i32 = 8000;
/// Sidecar proxy port.
pub const PROXY_PORT: i32 = 8001;

/// Name of the optional ConfigMap carrying default environment variables.
pub const GLOBAL_ENV_CONFIGMAP: &str = "orbiter-global-env";

/// Deletion cost written on drained replicas so the orchestrator culls
/// them first on scale-down.
pub const DELETION_COST_DRAINED: i32 = -1000;

/// Platform capability selector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum PlatformKind {
    #[default]
    Generic,
    AliyunAck,
    AwsEks,
}

impl PlatformKind {
    /// The platform key used when resolving per-platform spec configuration.
    pub fn spec_key(&self) -> &'static str {
        match self {
            PlatformKind::Generic => "generic",
            PlatformKind::AliyunAck => "aliyun-ack",
            PlatformKind::AwsEks => "aws-eks",
        }
    }
}

/// Knobs for pre-deployment image validation.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ImageValidationConfig {
    /// Whether existence checks against the registry run at all.
    pub enabled: bool,
    /// Per-request timeout for registry HEAD and token requests.
    #[serde(with = "humantime_seconds")]
    pub timeout: Duration,
    /// How long successful validation results stay cached.
    #[serde(with = "humantime_seconds")]
    pub cache_duration: Duration,
    /// On registry timeout, return a warning result instead of a failure
    /// so deployment proceeds and the pull itself verifies the image.
    pub skip_on_timeout: bool,
}

impl Default for ImageValidationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(30),
            cache_duration: Duration::from_secs(30 * 60),
            skip_on_timeout: false,
        }
    }
}

/// Top-level manager configuration.
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Namespace all managed workloads live in.
    pub namespace: String,
    /// Platform capability selector.
    pub platform: PlatformKind,
    /// Directory holding `specs.yaml`.
    pub config_dir: PathBuf,
    /// Environment variables injected into every workload.
    pub global_env: BTreeMap<String, String>,
    pub image_validation: ImageValidationConfig,
    /// Watch resync interval. Floored to one minute.
    pub resync_period: Duration,
}

impl ManagerConfig {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            platform: PlatformKind::default(),
            config_dir: PathBuf::from("/etc/orbiter"),
            global_env: BTreeMap::new(),
            image_validation: ImageValidationConfig::default(),
            resync_period: Duration::from_secs(5 * 60),
        }
    }

    /// Resync period with the one-minute floor applied.
    pub fn effective_resync_period(&self) -> Duration {
        self.resync_period.max(Duration::from_secs(60))
    }
}

/// Serde helper storing durations as whole seconds in config files.
mod humantime_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
