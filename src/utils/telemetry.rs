//! Observability
//!
//! Installs the global tracing subscriber: an env-driven filter, console
//! output, an optional rolling log file, and an optional OTLP span exporter.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{propagation::TraceContextPropagator, runtime, trace as sdktrace, Resource};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

const DEFAULT_FILTER: &str = "rust_conclave=info";

#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Directory for a daily-rolling log file. Console only when unset.
    pub log_dir: Option<PathBuf>,
    /// OTLP gRPC endpoint; spans are exported only when set.
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Reads `CONCLAVE_LOG_DIR` and `CONCLAVE_OTLP_ENDPOINT`.
    pub fn from_env() -> Self {
        Self {
            log_dir: std::env::var_os("CONCLAVE_LOG_DIR").map(PathBuf::from),
            otlp_endpoint: std::env::var("CONCLAVE_OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
        }
    }
}

/// Flushes the file writer and span exporter when dropped.
pub struct TelemetryGuard {
    _file: Option<WorkerGuard>,
    otel: bool,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if self.otel {
            global::shutdown_tracer_provider();
        }
    }
}

pub fn init_telemetry(service_name: &str, config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let (file_layer, file_guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, format!("{}.log", service_name));
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());

            let exporter = opentelemetry_otlp::new_exporter()
                .tonic()
                .with_endpoint(endpoint.clone())
                .build_span_exporter()?;

            let trace_config = sdktrace::Config::default().with_resource(Resource::new(vec![KeyValue::new(
                "service.name",
                service_name.to_string(),
            )]));

            let provider = sdktrace::TracerProvider::builder()
                .with_batch_exporter(exporter, runtime::Tokio)
                .with_config(trace_config)
                .build();

            global::set_tracer_provider(provider.clone());
            let tracer = provider.tracer(service_name.to_string());
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    let otel = otel_layer.is_some();

    Registry::default()
        .with(filter)
        .with(otel_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(file_layer)
        .try_init()?;

    Ok(TelemetryGuard {
        _file: file_guard,
        otel,
    })
}
