//! Logging and tracing setup
//!
//! Structured logs go to stdout, JSON by default or human-readable text when
//! `LOG_FORMAT=text`. When `OTEL_EXPORTER_OTLP_ENDPOINT` is set, spans and
//! metrics are also exported over OTLP/gRPC with W3C trace-context
//! propagation.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

const DEFAULT_FILTER: &str = "info,seldon=debug,kube=info,tower=warn,hyper=warn";

/// Errors that can occur during telemetry initialization
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize the OTLP span exporter
    #[error("failed to initialize tracer: {0}")]
    TracerInit(String),

    /// Failed to initialize the OTLP metrics exporter
    #[error("failed to initialize metrics exporter: {0}")]
    MetricsInit(String),

    /// A global subscriber was already installed
    #[error("failed to initialize tracing subscriber: {0}")]
    SubscriberInit(String),
}

/// Output format of the log layer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    Json,
    /// Human-readable text
    Text,
}

/// Configuration for telemetry initialization
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to every span and metric
    pub service_name: String,

    /// OTLP collector endpoint; local logging only when `None`
    pub otlp_endpoint: Option<String>,

    /// Log line format
    pub log_format: LogFormat,

    /// Kubernetes resource attributes (pod, namespace, node)
    pub resource_attributes: Vec<(String, String)>,
}

impl TelemetryConfig {
    /// Build the configuration from an environment lookup function
    pub fn from_lookup(service_name: &str, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let log_format = match lookup("LOG_FORMAT").as_deref() {
            Some("text") => LogFormat::Text,
            _ => LogFormat::Json,
        };
        let resource_attributes = [
            ("POD_NAME", "k8s.pod.name"),
            ("POD_NAMESPACE", "k8s.namespace.name"),
            ("NODE_NAME", "k8s.node.name"),
        ]
        .into_iter()
        .filter_map(|(env, attr)| lookup(env).map(|v| (attr.to_string(), v)))
        .collect();

        Self {
            service_name: service_name.to_string(),
            otlp_endpoint: lookup("OTEL_EXPORTER_OTLP_ENDPOINT").filter(|e| !e.is_empty()),
            log_format,
            resource_attributes,
        }
    }

    /// Build the configuration from the process environment
    pub fn from_env(service_name: &str) -> Self {
        Self::from_lookup(service_name, |k| std::env::var(k).ok())
    }
}

/// Keeps exporters alive; flushes pending spans when dropped
pub struct TelemetryGuard {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
        if let Some(provider) = self.meter_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global tracing subscriber and optional OTLP exporters
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let resource = build_resource(&config);
    let mut guard = TelemetryGuard {
        tracer_provider: None,
        meter_provider: None,
    };

    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            guard.meter_provider = Some(init_otlp_metrics(endpoint, resource.clone())?);
            let provider = init_otlp_tracer(endpoint, resource)?;
            let tracer = provider.tracer(config.service_name.clone());
            guard.tracer_provider = Some(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::SubscriberInit(e.to_string()))?;

    Ok(guard)
}

fn build_resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_NAME,
            config.service_name.clone(),
        ),
        KeyValue::new(
            opentelemetry_semantic_conventions::resource::SERVICE_VERSION,
            env!("CARGO_PKG_VERSION"),
        ),
    ];
    attributes.extend(
        config
            .resource_attributes
            .iter()
            .map(|(k, v)| KeyValue::new(k.clone(), v.clone())),
    );
    Resource::new(attributes)
}

fn init_otlp_tracer(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::TracerInit(e.to_string()))?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider)
}

fn init_otlp_metrics(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    let provider = SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build();

    global::set_meter_provider(provider.clone());
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_to_json_without_exporter() {
        let config = TelemetryConfig::from_lookup("seldon-operator", lookup(&[]));
        assert_eq!(config.service_name, "seldon-operator");
        assert_eq!(config.log_format, LogFormat::Json);
        assert!(config.otlp_endpoint.is_none());
        assert!(config.resource_attributes.is_empty());
    }

    #[test]
    fn reads_endpoint_format_and_pod_identity() {
        let config = TelemetryConfig::from_lookup(
            "seldon-operator",
            lookup(&[
                ("OTEL_EXPORTER_OTLP_ENDPOINT", "http://otel:4317"),
                ("LOG_FORMAT", "text"),
                ("POD_NAME", "seldon-controller-abc"),
                ("POD_NAMESPACE", "seldon-system"),
            ]),
        );
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://otel:4317"));
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.resource_attributes.len(), 2);
    }

    #[test]
    fn empty_endpoint_disables_export() {
        let config = TelemetryConfig::from_lookup(
            "seldon-operator",
            lookup(&[("OTEL_EXPORTER_OTLP_ENDPOINT", "")]),
        );
        assert!(config.otlp_endpoint.is_none());
    }

    #[test]
    fn resource_carries_service_name() {
        let config = TelemetryConfig::from_lookup("seldon-operator", lookup(&[]));
        let resource = build_resource(&config);
        assert!(!resource.is_empty());
    }
}
