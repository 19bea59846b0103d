//! End-to-end assertions on workload rendering through the public API.

use std::collections::BTreeMap;

use orbiter_k8s::config::{LABEL_APP, LABEL_MANAGED_BY, LABEL_SPEC, MANAGER_ID};
use orbiter_k8s::platform::{capability_for, GenericPlatform};
use orbiter_k8s::config::PlatformKind;
use orbiter_k8s::specs::{Category, PlatformConfig, ResourceEnvelope, ResourceSpec};
use orbiter_k8s::template;
use orbiter_k8s::types::DeployRequest;

fn cpu_small() -> ResourceSpec {
    ResourceSpec {
        name: "cpu-small".to_string(),
        display_name: "CPU small".to_string(),
        category: Category::Cpu,
        resources: ResourceEnvelope {
            cpu: Some("500m".to_string()),
            memory: "1Gi".to_string(),
            gpu: None,
            gpu_type: None,
            ephemeral_storage: "10Gi".to_string(),
            shm_size: None,
        },
        platforms: BTreeMap::from([("generic".to_string(), PlatformConfig::default())]),
    }
}

fn request() -> DeployRequest {
    let mut request = DeployRequest::new("img", "cpu-small", "nginx:1.25");
    request.replicas = 2;
    request
        .env
        .insert("MODEL".to_string(), "resnet".to_string());
    request
}

#[test]
fn equal_inputs_render_byte_equal_yaml() {
    let global = BTreeMap::from([("REGION".to_string(), "eu".to_string())]);

    let render = || {
        template::render_yaml(&request(), &cpu_small(), &GenericPlatform, "prod", &global).unwrap()
    };
    let first = render();
    for _ in 0..5 {
        assert_eq!(render(), first);
    }
}

#[test]
fn different_inputs_render_differently() {
    let global = BTreeMap::new();
    let base =
        template::render_yaml(&request(), &cpu_small(), &GenericPlatform, "prod", &global).unwrap();

    let mut other_image = request();
    other_image.image = "nginx:1.26".to_string();
    assert_ne!(
        template::render_yaml(&other_image, &cpu_small(), &GenericPlatform, "prod", &global)
            .unwrap(),
        base
    );

    let mut other_replicas = request();
    other_replicas.replicas = 3;
    assert_ne!(
        template::render_yaml(
            &other_replicas,
            &cpu_small(),
            &GenericPlatform,
            "prod",
            &global
        )
        .unwrap(),
        base
    );
}

#[test]
fn first_deploy_renders_the_documented_shape() {
    let workload = template::render_workload(
        &request(),
        &cpu_small(),
        capability_for(PlatformKind::Generic),
        "prod",
        &BTreeMap::new(),
    )
    .unwrap();

    assert_eq!(workload.metadata.name.as_deref(), Some("img"));
    assert_eq!(workload.metadata.namespace.as_deref(), Some("prod"));

    let labels = workload.metadata.labels.as_ref().unwrap();
    assert_eq!(labels.get(LABEL_MANAGED_BY).map(String::as_str), Some(MANAGER_ID));
    assert_eq!(labels.get(LABEL_APP).map(String::as_str), Some("img"));
    assert_eq!(labels.get(LABEL_SPEC).map(String::as_str), Some("cpu-small"));

    let spec = workload.spec.as_ref().unwrap();
    assert_eq!(spec.replicas, Some(2));

    let container = &spec.template.spec.as_ref().unwrap().containers[0];
    assert_eq!(container.name, "img-worker");
    assert_eq!(container.image.as_deref(), Some("nginx:1.25"));

    // Default task timeout of 300s plus the 30s margin.
    assert_eq!(
        spec.template
            .spec
            .as_ref()
            .unwrap()
            .termination_grace_period_seconds,
        Some(330)
    );
}
