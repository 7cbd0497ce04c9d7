//! Telemetry setup for structured logging, OpenTelemetry tracing and Prometheus metrics.
//!
//! # Features
//! - `otlp` (default): OpenTelemetry OTLP exporter
//! - `prometheus` (default): Prometheus metrics exporter

#[cfg(feature = "otlp")]
use std::time::Duration;

use tracing::{Level, warn};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "prometheus")]
pub use metrics_exporter_prometheus::PrometheusHandle;

#[cfg(feature = "otlp")]
use opentelemetry::KeyValue;
#[cfg(feature = "otlp")]
use opentelemetry::trace::TracerProvider as _;
#[cfg(feature = "otlp")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otlp")]
use opentelemetry_sdk::{
    Resource,
    trace::{Sampler, SdkTracerProvider},
};

/// Transport crates are chatty at debug level; keep them at info unless overridden.
const TRANSPORT_DIRECTIVES: [&str; 5] = [
    "tower=info",
    "h2=info",
    "hyper=info",
    "tonic=info",
    "opentelemetry=warn",
];

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported as `service.name` to the trace backend.
    pub service_name: String,
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    pub log_level: String,
    /// Use JSON log format
    pub json_logs: bool,
    /// OpenTelemetry OTLP endpoint (optional)
    pub otlp_endpoint: Option<String>,
    /// Extra filter directives, e.g. `svc_gateway::admission=debug`.
    /// Applied after the transport defaults, so they can override them.
    pub directives: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "svc-gateway".to_string(),
            log_level: "INFO".to_string(),
            json_logs: true,
            otlp_endpoint: None,
            directives: Vec::new(),
        }
    }
}

/// Active telemetry handles that need graceful shutdown.
pub struct TelemetryGuard {
    #[cfg(feature = "otlp")]
    otel_provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Shutdown telemetry providers gracefully.
    pub fn shutdown(self) {
        #[cfg(feature = "otlp")]
        if let Some(provider) = self.otel_provider
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry provider: {e}");
        }
    }
}

/// Initialize Prometheus metrics exporter and return the handle for the /metrics endpoint.
///
/// # Panics
/// Panics if the Prometheus recorder fails to install.
#[cfg(feature = "prometheus")]
#[must_use]
pub fn init_metrics() -> PrometheusHandle {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder")
}

/// Initialize OpenTelemetry tracing with OTLP exporter.
///
/// Returns `None` if OTLP endpoint is not configured.
#[cfg(feature = "otlp")]
fn init_opentelemetry(service_name: &str, otlp_endpoint: Option<&str>) -> Option<SdkTracerProvider> {
    let endpoint = otlp_endpoint?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .with_timeout(Duration::from_secs(5))
        .build()
        .inspect_err(|e| eprintln!("Failed to create OTLP exporter, tracing export disabled: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", service_name.to_string())])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_batch_exporter(exporter)
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());

    Some(provider)
}

fn parse_level(level: &str) -> Level {
    match level.to_uppercase().as_str() {
        "TRACE" => Level::TRACE,
        "DEBUG" => Level::DEBUG,
        "WARN" => Level::WARN,
        "ERROR" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Build the log filter. Returns the directives that failed to parse.
fn env_filter(config: &TelemetryConfig) -> (EnvFilter, Vec<String>) {
    let mut filter =
        EnvFilter::from_default_env().add_directive(parse_level(&config.log_level).into());
    let mut rejected = Vec::new();

    let directives = TRANSPORT_DIRECTIVES
        .iter()
        .copied()
        .chain(config.directives.iter().map(String::as_str));
    for raw in directives {
        match raw.trim().parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(_) => rejected.push(raw.to_string()),
        }
    }

    (filter, rejected)
}

/// Setup complete logging/tracing stack.
///
/// - Console logging (JSON or human-readable)
/// - `OpenTelemetry` tracing (if OTLP endpoint configured)
///
/// Returns a guard that should be kept alive for the application lifetime.
/// Call `shutdown()` on the guard for graceful shutdown.
///
/// # Panics
/// Panics if the tracing subscriber cannot be initialized.
#[must_use]
pub fn setup_telemetry(config: &TelemetryConfig) -> TelemetryGuard {
    let (env_filter, rejected) = env_filter(config);

    #[cfg(feature = "otlp")]
    let otel_provider =
        init_opentelemetry(&config.service_name, config.otlp_endpoint.as_deref());

    let fmt_layer = if config.json_logs {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_timer(ChronoLocal::new("%H:%M:%S%.3f".to_string()))
            .compact()
            .boxed()
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    #[cfg(feature = "otlp")]
    {
        if let Some(provider) = &otel_provider {
            let tracer = provider.tracer(config.service_name.clone());
            registry
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        } else {
            registry.init();
        }
    }

    #[cfg(not(feature = "otlp"))]
    registry.init();

    for directive in rejected {
        warn!(directive, "Ignoring invalid log directive");
    }

    TelemetryGuard {
        #[cfg(feature = "otlp")]
        otel_provider,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sensible_defaults() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "svc-gateway");
        assert_eq!(config.log_level, "INFO");
        assert!(config.json_logs);
        assert!(config.otlp_endpoint.is_none());
        assert!(config.directives.is_empty());
    }

    #[test]
    fn log_level_parsing_falls_back_to_info() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("verbose"), Level::INFO);
    }

    #[test]
    fn transport_defaults_all_parse() {
        let (filter, rejected) = env_filter(&TelemetryConfig::default());
        assert!(rejected.is_empty());
        let rendered = filter.to_string();
        assert!(rendered.contains("h2=info"), "{rendered}");
        assert!(rendered.contains("opentelemetry=warn"), "{rendered}");
    }

    #[test]
    fn invalid_extra_directives_are_reported_not_fatal() {
        let config = TelemetryConfig {
            directives: vec![
                "svc_gateway::admission=debug".to_string(),
                "svc_gateway=loud".to_string(),
            ],
            ..TelemetryConfig::default()
        };

        let (filter, rejected) = env_filter(&config);

        assert_eq!(rejected, ["svc_gateway=loud"]);
        assert!(filter.to_string().contains("svc_gateway::admission=debug"));
    }
}
