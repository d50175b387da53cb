//! Tracing and OpenTelemetry setup for processes hosting work lists.
//!
//! Library code only emits `tracing` spans and events plus the instruments
//! in [`metrics`]. A binary calls [`init_telemetry`] once. Logs always go to
//! stderr; with an OTLP endpoint the work list spans, counters and log
//! records are exported as well, each tagged with the service, the crate
//! version and the names of the work lists the process runs.

pub mod metrics;
pub mod work;

use std::fmt::Display;
use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::{ExporterBuildError, WithExportConfig as _};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::logs::SdkLoggerProvider;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::error::{Error, Result};

pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Settings for [`init_telemetry`].
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint, e.g. `http://localhost:4317`. `None` keeps
    /// everything local.
    pub endpoint: Option<String>,
    pub service_name: String,
    /// Work lists hosted by this process. Exported as the
    /// `workq.worklists` resource attribute.
    pub worklists: Vec<String>,
    /// Filter directive used when `RUST_LOG` is unset.
    pub default_filter: String,
    pub metrics_interval: Duration,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            endpoint: None,
            service_name: service_name.into(),
            worklists: Vec::new(),
            default_filter: "info".to_string(),
            metrics_interval: DEFAULT_METRICS_INTERVAL,
        }
    }

    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_worklists<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worklists = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_default_filter(mut self, filter: impl Into<String>) -> Self {
        self.default_filter = filter.into();
        self
    }

    pub fn with_metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Attributes shared by every exported signal.
    pub fn resource_attributes(&self) -> Vec<KeyValue> {
        let mut attributes = vec![KeyValue::new("service.version", env!("CARGO_PKG_VERSION"))];
        if !self.worklists.is_empty() {
            attributes.push(KeyValue::new("workq.worklists", self.worklists.join(",")));
        }
        attributes
    }

    fn resource(&self) -> Resource {
        Resource::builder()
            .with_service_name(self.service_name.clone())
            .with_attributes(self.resource_attributes())
            .build()
    }
}

/// OTLP pipelines for traces, metrics and logs.
struct Exporters {
    tracer: SdkTracerProvider,
    meter: SdkMeterProvider,
    logger: SdkLoggerProvider,
}

impl Exporters {
    fn build(endpoint: &str, config: &TelemetryConfig) -> Result<Self> {
        let resource = config.resource();

        let spans = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("span"))?;
        let tracer = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();

        let metrics = opentelemetry_otlp::MetricExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("metric"))?;
        let reader = PeriodicReader::builder(metrics)
            .with_interval(config.metrics_interval)
            .build();
        let meter = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(resource.clone())
            .build();

        let logs = opentelemetry_otlp::LogExporter::builder()
            .with_tonic()
            .with_endpoint(endpoint)
            .build()
            .map_err(exporter_error("log"))?;
        let logger = SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build();

        Ok(Self {
            tracer,
            meter,
            logger,
        })
    }
}

fn exporter_error(signal: &'static str) -> impl FnOnce(ExporterBuildError) -> Error {
    move |e| Error::Other(format!("failed to create OTLP {signal} exporter: {e}"))
}

fn report<E: Display>(signal: &str, action: &str, result: std::result::Result<(), E>) {
    if let Err(err) = result {
        warn!(signal, error = %err, "telemetry {action} failed");
    }
}

/// Keeps the exporters alive. Flushes and shuts them down on drop, so hold
/// it until the work lists have been shut down.
pub struct TelemetryGuard {
    exporters: Option<Exporters>,
}

impl TelemetryGuard {
    /// Whether signals leave the process.
    pub fn is_exporting(&self) -> bool {
        self.exporters.is_some()
    }

    pub fn force_flush(&self) {
        if let Some(exporters) = &self.exporters {
            report("traces", "flush", exporters.tracer.force_flush());
            report("metrics", "flush", exporters.meter.force_flush());
            report("logs", "flush", exporters.logger.force_flush());
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(exporters) = self.exporters.take() {
            report("logs", "shutdown", exporters.logger.shutdown());
            report("metrics", "shutdown", exporters.meter.shutdown());
            report("traces", "shutdown", exporters.tracer.shutdown());
        }
    }
}

/// Install the global subscriber and, with an endpoint, the OTLP pipelines.
///
/// # Errors
///
/// Fails if an exporter cannot be built or a global subscriber is already
/// set (e.g. by another test in the same process).
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));

    let exporters = config
        .endpoint
        .as_deref()
        .map(|endpoint| Exporters::build(endpoint, &config))
        .transpose()?;

    let trace_layer = exporters.as_ref().map(|e| {
        tracing_opentelemetry::layer().with_tracer(e.tracer.tracer("workq"))
    });
    let log_layer = exporters
        .as_ref()
        .map(|e| OpenTelemetryTracingBridge::new(&e.logger));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().compact())
        .with(trace_layer)
        .with(log_layer)
        .try_init()
        .map_err(|e| Error::Other(format!("failed to init tracing subscriber: {e}")))?;

    if let Some(e) = &exporters {
        opentelemetry::global::set_meter_provider(e.meter.clone());
    }
    info!(
        service = %config.service_name,
        worklists = ?config.worklists,
        exporting = exporters.is_some(),
        "telemetry initialized"
    );

    Ok(TelemetryGuard { exporters })
}
