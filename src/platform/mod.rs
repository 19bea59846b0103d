//! Per-platform capabilities.
//!
//! A small strategy object parameterized by platform: annotation
//! customization, the NAS CSI driver name, and spot-interruption detection.
//! The generic instance passes everything through.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;

use crate::config::PlatformKind;
use crate::specs::{Category, ResourceSpec};

/// Platform-specific behavior consulted while rendering and while
/// observing pods.
pub trait PlatformCapability: Send + Sync {
    fn name(&self) -> &'static str;

    /// Adjust workload annotations for this platform. The input map is
    /// returned unchanged by the generic implementation.
    fn customize_annotations(
        &self,
        annotations: BTreeMap<String, String>,
        spec: &ResourceSpec,
    ) -> BTreeMap<String, String>;

    /// CSI driver name for network-attached storage on this platform.
    fn nas_driver(&self) -> &'static str;

    /// Detect a vendor-specific spot-instance interruption on a pod.
    /// Returns the interruption reason when one is flagged.
    fn detect_spot_interruption(&self, _pod: &Pod) -> Option<String> {
        None
    }
}

/// Resolve the capability instance for a configured platform.
pub fn capability_for(kind: PlatformKind) -> &'static dyn PlatformCapability {
    match kind {
        PlatformKind::Generic => &GenericPlatform,
        PlatformKind::AliyunAck => &AliyunAckPlatform,
        PlatformKind::AwsEks => &AwsEksPlatform,
    }
}

pub struct GenericPlatform;

impl PlatformCapability for GenericPlatform {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn customize_annotations(
        &self,
        annotations: BTreeMap<String, String>,
        _spec: &ResourceSpec,
    ) -> BTreeMap<String, String> {
        annotations
    }

    fn nas_driver(&self) -> &'static str {
        "nfs.csi.k8s.io"
    }
}

pub struct AliyunAckPlatform;

impl PlatformCapability for AliyunAckPlatform {
    fn name(&self) -> &'static str {
        "aliyun-ack"
    }

    fn customize_annotations(
        &self,
        mut annotations: BTreeMap<String, String>,
        spec: &ResourceSpec,
    ) -> BTreeMap<String, String> {
        // Large GPU images benefit from ACK's on-demand image pulling.
        if spec.category == Category::Gpu {
            annotations.insert(
                "k8s.aliyun.com/image-accelerate-mode".to_string(),
                "on-demand".to_string(),
            );
        }
        annotations
    }

    fn nas_driver(&self) -> &'static str {
        "nasplugin.csi.alibabacloud.com"
    }

    fn detect_spot_interruption(&self, pod: &Pod) -> Option<String> {
        let labels = pod.metadata.labels.as_ref()?;
        if labels.get("alibabacloud.com/spot-instance").map(String::as_str) != Some("true") {
            return None;
        }
        let conditions = pod.status.as_ref()?.conditions.as_ref()?;
        conditions
            .iter()
            .find(|c| c.reason.as_deref() == Some("SpotToBeReleased"))
            .map(|c| {
                c.message
                    .clone()
                    .unwrap_or_else(|| "spot instance flagged for release".to_string())
            })
    }
}

pub struct AwsEksPlatform;

impl PlatformCapability for AwsEksPlatform {
    fn name(&self) -> &'static str {
        "aws-eks"
    }

    fn customize_annotations(
        &self,
        annotations: BTreeMap<String, String>,
        _spec: &ResourceSpec,
    ) -> BTreeMap<String, String> {
        annotations
    }

    fn nas_driver(&self) -> &'static str {
        "efs.csi.aws.com"
    }

    fn detect_spot_interruption(&self, pod: &Pod) -> Option<String> {
        let labels = pod.metadata.labels.as_ref()?;
        if labels
            .get("eks.amazonaws.com/capacityType")
            .map(String::as_str)
            != Some("SPOT")
        {
            return None;
        }
        let conditions = pod.status.as_ref()?.conditions.as_ref()?;
        conditions
            .iter()
            .find(|c| c.type_ == "DisruptionTarget" && c.status == "True")
            .map(|c| {
                c.message
                    .clone()
                    .unwrap_or_else(|| "spot capacity is being reclaimed".to_string())
            })
    }
}
