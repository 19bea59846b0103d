//! OpenTelemetry wiring.
//!
//! Builds the optional OTLP tracing layer used when an exporter endpoint
//! is configured, and flushes it on shutdown.

use opentelemetry::KeyValue;
use opentelemetry_sdk::trace as sdktrace;
use opentelemetry_sdk::Resource;
use tracing_opentelemetry::OpenTelemetryLayer;

use crate::error::{Error, Result};

/// Build the OTLP tracing layer. Callers gate this on
/// `OTEL_EXPORTER_OTLP_ENDPOINT` being present; the exporter reads the
/// endpoint from the environment.
pub fn init_telemetry<S>() -> Result<OpenTelemetryLayer<S, sdktrace::Tracer>>
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    let tracer = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
            KeyValue::new("service.name", "orbiter-manager"),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ])))
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .map_err(|e| Error::ConfigError(format!("failed to initialize OTLP exporter: {e}")))?;

    Ok(tracing_opentelemetry::layer().with_tracer(tracer))
}

/// Flush any remaining spans. Safe to call when telemetry was never
/// initialized.
pub fn shutdown_telemetry() {
    opentelemetry::global::shutdown_tracer_provider();
}
