//! Named resource specs and their registry.
//!
//! A `ResourceSpec` is a named resource envelope plus per-platform scheduling
//! configuration. Specs are loaded once from `specs.yaml` in the config
//! directory; an optional repository can override individual lookups, with
//! the in-memory table as fallback whenever the repository misbehaves.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Toleration;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};
use crate::naming::validate_endpoint_name;

/// Platform key consulted when no entry matches the configured platform.
pub const GENERIC_PLATFORM: &str = "generic";

/// Whether a spec targets CPU or GPU workers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Cpu,
    Gpu,
}

/// The resource envelope of a spec.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEnvelope {
    /// CPU quantity, e.g. "500m". Omitted from the rendered workload
    /// when empty.
    #[serde(default)]
    pub cpu: Option<String>,
    /// Memory quantity, e.g. "1Gi". Always rendered.
    pub memory: String,
    /// GPU count; rendered only for `category = gpu`.
    #[serde(default)]
    pub gpu: Option<i64>,
    /// GPU resource key, e.g. "nvidia.com/gpu".
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default = "default_ephemeral_storage")]
    pub ephemeral_storage: String,
    /// Default /dev/shm size when the request does not override it.
    #[serde(default)]
    pub shm_size: Option<String>,
}

fn default_ephemeral_storage() -> String {
    "10Gi".to_string()
}

/// Per-platform scheduling configuration.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformConfig {
    pub node_selector: BTreeMap<String, String>,
    pub tolerations: Vec<Toleration>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl PlatformConfig {
    pub fn is_empty(&self) -> bool {
        self.node_selector.is_empty()
            && self.tolerations.is_empty()
            && self.labels.is_empty()
            && self.annotations.is_empty()
    }
}

/// A named resource envelope plus per-platform scheduling hints.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub category: Category,
    pub resources: ResourceEnvelope,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformConfig>,
}

impl ResourceSpec {
    /// Resolve the configuration for a platform, falling back to
    /// `generic`, then to an empty configuration.
    pub fn platform(&self, platform_name: &str) -> PlatformConfig {
        self.platforms
            .get(platform_name)
            .or_else(|| self.platforms.get(GENERIC_PLATFORM))
            .cloned()
            .unwrap_or_default()
    }
}

/// On-disk shape of `specs.yaml`.
#[derive(Debug, Deserialize)]
struct SpecFile {
    specs: Vec<ResourceSpec>,
}

/// Override source consulted before the in-memory table. Any error from
/// the repository falls back to the table; the lookup only fails when
/// both sources miss.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SpecRepository: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Option<ResourceSpec>>;
}

/// The loaded spec table plus the optional repository override.
pub struct SpecRegistry {
    specs: HashMap<String, ResourceSpec>,
    repository: Option<Arc<dyn SpecRepository>>,
}

impl SpecRegistry {
    /// Load and validate `specs.yaml` from the config directory.
    pub fn from_config_dir(config_dir: &Path) -> Result<Self> {
        let path = config_dir.join("specs.yaml");
        let raw = std::fs::read_to_string(&path)?;
        let file: SpecFile = serde_yaml::from_str(&raw)
            .map_err(|e| Error::ConfigError(format!("{}: {e}", path.display())))?;
        Self::from_specs(file.specs)
    }

    /// Build a registry from already-parsed specs, validating each entry.
    pub fn from_specs(list: Vec<ResourceSpec>) -> Result<Self> {
        let mut specs = HashMap::with_capacity(list.len());
        for spec in list {
            validate_spec(&spec)?;
            if specs.insert(spec.name.clone(), spec.clone()).is_some() {
                return Err(Error::ConfigError(format!(
                    "duplicate resource spec {:?}",
                    spec.name
                )));
            }
        }
        Ok(Self {
            specs,
            repository: None,
        })
    }

    /// Install a repository override consulted before the table.
    pub fn with_repository(mut self, repository: Arc<dyn SpecRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Look up a spec by name: repository first (errors fall back to the
    /// table with a warning), then the in-memory table.
    pub async fn get_spec(&self, name: &str) -> Result<ResourceSpec> {
        if let Some(repo) = &self.repository {
            match repo.fetch(name).await {
                Ok(Some(spec)) => return Ok(spec),
                Ok(None) => {}
                Err(e) => {
                    warn!(spec = name, error = %e, "spec repository lookup failed, using built-in table");
                }
            }
        }

        self.specs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("resource spec {name:?}")))
    }

    /// All spec names in the table (repository entries are not enumerable).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.specs.keys().cloned().collect();
        names.sort();
        names
    }
}

fn validate_spec(spec: &ResourceSpec) -> Result<()> {
    validate_endpoint_name(&spec.name)
        .map_err(|_| Error::ConfigError(format!("resource spec name {:?} is not a valid DNS label", spec.name)))?;
    if spec.resources.memory.trim().is_empty() {
        return Err(Error::ConfigError(format!(
            "resource spec {:?} has no memory quantity",
            spec.name
        )));
    }
    if spec.category == Category::Gpu && spec.resources.gpu.unwrap_or(0) < 1 {
        return Err(Error::ConfigError(format!(
            "gpu resource spec {:?} must request at least one gpu",
            spec.name
        )));
    }
    Ok(())
}
