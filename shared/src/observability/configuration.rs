use anyhow::Result;

use opentelemetry::{global, trace::TracerProvider};
use opentelemetry_appender_tracing::layer;
use opentelemetry_aws::detector::LambdaResourceDetector;
use opentelemetry_otlp::{LogExporter, MetricExporter, SpanExporter};
use opentelemetry_resource_detectors::{OsResourceDetector, ProcessResourceDetector};
use opentelemetry_sdk::{
    logs::SdkLoggerProvider,
    metrics::SdkMeterProvider,
    propagation::TraceContextPropagator,
    resource::ResourceDetector,
    trace::{RandomIdGenerator, SdkTracerProvider},
    Resource,
};
use tracing_opentelemetry::{MetricsLayer, OpenTelemetryLayer};
use tracing_subscriber::{filter::Directive, prelude::*, EnvFilter};

use crate::configuration::AgentConfig;

// Crates whose own logs would feed back into the exporters.
const SILENCED_TARGETS: [&str; 6] = [
    "hyper=off",
    "opentelemetry=off",
    "tonic=off",
    "h2=off",
    "reqwest=off",
    "aws_smithy_runtime=off",
];

// The SDK defaults (service name from env, SDK and telemetry attributes)
// plus what can be learned about the host and the Lambda function.
fn resource(service_name: &str) -> Resource {
    let detectors: Vec<Box<dyn ResourceDetector>> = vec![
        Box::new(OsResourceDetector),
        Box::new(ProcessResourceDetector),
        Box::new(LambdaResourceDetector {}),
    ];

    Resource::builder()
        .with_service_name(service_name.to_string())
        .with_detectors(&detectors)
        .build()
}

// A Tracer Provider is a factory for Tracers
fn init_tracer(resource: Resource) -> Result<SdkTracerProvider> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = SpanExporter::builder().with_tonic().build()?;

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_id_generator(RandomIdGenerator::default())
        .with_batch_exporter(exporter)
        .build())
}

// A Meter Provider is a factory for Meters
fn init_meter_provider(resource: Resource) -> Result<SdkMeterProvider> {
    let exporter = MetricExporter::builder().with_tonic().build()?;

    let meter_provider = SdkMeterProvider::builder()
        .with_periodic_exporter(exporter)
        .with_resource(resource)
        .build();

    global::set_meter_provider(meter_provider.clone());

    Ok(meter_provider)
}

// A Logger Provider bridges `tracing` events to OpenTelemetry log records.
fn init_logger_provider(resource: Resource) -> Result<SdkLoggerProvider> {
    let exporter = LogExporter::builder().with_tonic().build()?;

    Ok(SdkLoggerProvider::builder()
        .with_resource(resource)
        .with_simple_exporter(exporter)
        .build())
}

fn filter(level: &str) -> Result<EnvFilter> {
    let mut filter = EnvFilter::try_new(level)?;
    for directive in SILENCED_TARGETS {
        filter = filter.add_directive(directive.parse::<Directive>()?);
    }
    Ok(filter)
}

/// Installs the global subscriber: JSON log lines on stdout (carrying the
/// active transaction's `trace.id`), OpenTelemetry traces, metrics and logs.
pub fn init_otel(config: &AgentConfig) -> Result<OtelGuard> {
    let resource = resource(&config.app_name);
    let logger = init_logger_provider(resource.clone())?;
    let trace_provider = init_tracer(resource.clone())?;
    let meter = init_meter_provider(resource)?;

    let tracer = trace_provider.tracer("invocation-tracing");

    let otel_logs =
        layer::OpenTelemetryTracingBridge::new(&logger).with_filter(filter(&config.log_level)?);
    let json_logs = tracing_subscriber::fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(false)
        .with_filter(filter(&config.log_level)?);

    tracing_subscriber::registry()
        .with(otel_logs)
        .with(json_logs)
        .with(MetricsLayer::new(meter.clone()))
        .with(OpenTelemetryLayer::new(tracer))
        .try_init()?;

    Ok(OtelGuard {
        tracer_provider: trace_provider,
        meter_provider: meter,
        logger_provider: logger,
    })
}

pub struct OtelGuard {
    tracer_provider: SdkTracerProvider,
    meter_provider: SdkMeterProvider,
    logger_provider: SdkLoggerProvider,
}

impl OtelGuard {
    pub fn flush(&self) {
        if let Err(err) = self.tracer_provider.force_flush() {
            eprintln!("{err:?}");
        }
        if let Err(err) = self.meter_provider.force_flush() {
            eprintln!("{err:?}");
        }
        if let Err(err) = self.logger_provider.force_flush() {
            eprintln!("{err:?}");
        }
    }
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        if let Err(err) = self.tracer_provider.shutdown() {
            eprintln!("{err:?}");
        }
        if let Err(err) = self.meter_provider.shutdown() {
            eprintln!("{err:?}");
        }
        if let Err(err) = self.logger_provider.shutdown() {
            eprintln!("{err:?}");
        }
    }
}
