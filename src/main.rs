//! Orbiter manager entry point.
//!
//! Starts the deployment manager and the optional REST API server.

use std::collections::BTreeMap;
#[cfg(feature = "rest-api")]
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use orbiter_k8s::config::{ImageValidationConfig, ManagerConfig, PlatformKind};
use orbiter_k8s::DeploymentManager;

#[derive(Parser, Debug)]
#[command(name = "orbiter-manager", version, about = "Deployment manager for inference endpoints")]
struct Args {
    /// Namespace managed workloads live in.
    #[arg(long, env = "ORBITER_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Platform capability selector.
    #[arg(long, env = "ORBITER_PLATFORM", value_enum, default_value_t = PlatformKind::Generic)]
    platform: PlatformKind,

    /// Directory holding specs.yaml.
    #[arg(long, env = "ORBITER_CONFIG_DIR", default_value = "/etc/orbiter")]
    config_dir: PathBuf,

    /// Watch resync interval in seconds (floored to 60).
    #[arg(long, env = "ORBITER_RESYNC_SECONDS", default_value_t = 300)]
    resync_seconds: u64,

    /// Enable pre-deployment image existence checks.
    #[arg(long, env = "ORBITER_IMAGE_VALIDATION")]
    image_validation: bool,

    /// Per-request registry timeout in seconds.
    #[arg(long, env = "ORBITER_IMAGE_TIMEOUT_SECONDS", default_value_t = 30)]
    image_timeout_seconds: u64,

    /// How long successful image validations stay cached, in seconds.
    #[arg(long, env = "ORBITER_IMAGE_CACHE_SECONDS", default_value_t = 1800)]
    image_cache_seconds: u64,

    /// Let deployments proceed when the registry cannot be reached.
    #[arg(long, env = "ORBITER_IMAGE_SKIP_ON_TIMEOUT")]
    image_skip_on_timeout: bool,

    /// Extra KEY=VALUE environment variables injected into every workload.
    #[arg(long = "global-env", value_parser = parse_key_value)]
    global_env: Vec<(String, String)>,

    /// Listen address for the REST API.
    #[cfg(feature = "rest-api")]
    #[arg(long, env = "ORBITER_API_ADDR", default_value = "0.0.0.0:8080")]
    api_addr: SocketAddr,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {raw:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into())
        .from_env_lossy();
    let fmt_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    // Only enable OTLP export when an endpoint is configured.
    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer =
            orbiter_k8s::telemetry::init_telemetry().context("initializing telemetry")?;
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
    }

    info!("Starting orbiter-manager v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default()
        .await
        .context("connecting to the Kubernetes API")?;
    info!("Connected to Kubernetes cluster");

    let config = ManagerConfig {
        namespace: args.namespace,
        platform: args.platform,
        config_dir: args.config_dir,
        global_env: args.global_env.into_iter().collect::<BTreeMap<_, _>>(),
        image_validation: ImageValidationConfig {
            enabled: args.image_validation,
            timeout: Duration::from_secs(args.image_timeout_seconds),
            cache_duration: Duration::from_secs(args.image_cache_seconds),
            skip_on_timeout: args.image_skip_on_timeout,
        },
        resync_period: Duration::from_secs(args.resync_seconds),
    };

    let manager = DeploymentManager::new(client, config, None)
        .await
        .context("starting the deployment manager")?;

    #[cfg(feature = "rest-api")]
    {
        let api_manager = manager.clone();
        let addr = args.api_addr;
        tokio::spawn(async move {
            if let Err(e) = orbiter_k8s::rest_api::run_server(api_manager, addr).await {
                tracing::error!("REST API server error: {e}");
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutdown signal received");

    manager.close();
    orbiter_k8s::telemetry::shutdown_telemetry();
    Ok(())
}
