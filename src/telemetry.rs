//! Logging and distributed tracing.
//!
//! Standard structured logging is always on. When `TELEMETRY_TRACES` is set
//! (any non-empty value), spans are additionally exported over OTLP to the
//! endpoint named by `OTEL_ENDPOINT`. The gateway injects the active trace
//! context into bus-message headers and the dispatch loop extracts it, so a
//! request is one trace across the HTTP hop, the bus and the executors.

use opentelemetry::propagation::{Extractor, Injector};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

const SERVICE_NAME: &str = "msgscript";
const DEFAULT_OTEL_ENDPOINT: &str = "http://localhost:4317";

fn env_filter() -> EnvFilter {
    // DEBUG (any non-empty value) raises verbosity across the board.
    if std::env::var("DEBUG").is_ok_and(|v| !v.is_empty()) {
        return EnvFilter::new("debug");
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Initializes the tracing subscriber, with OTLP span export when
/// `TELEMETRY_TRACES` is set. Returns the provider so the caller can shut it
/// down and flush pending spans.
pub fn init() -> Option<TracerProvider> {
    let traces_enabled = std::env::var("TELEMETRY_TRACES").is_ok_and(|v| !v.is_empty());

    if !traces_enabled {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer())
            .init();
        return None;
    }

    let endpoint =
        std::env::var("OTEL_ENDPOINT").unwrap_or_else(|_| DEFAULT_OTEL_ENDPOINT.to_string());

    let exporter = match opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&endpoint)
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            eprintln!("failed to create OTLP exporter: {e}. Falling back to logging only.");
            tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer())
                .init();
            return None;
        }
    };

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new(vec![KeyValue::new("service.name", SERVICE_NAME)]))
        .build();

    let tracer = provider.tracer(SERVICE_NAME);
    let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter())
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();

    global::set_text_map_propagator(TraceContextPropagator::new());

    tracing::info!(endpoint = %endpoint, "trace export enabled");
    Some(provider)
}

/// Flushes and shuts down the span exporter.
pub fn shutdown(provider: Option<TracerProvider>) {
    if let Some(provider) = provider {
        if let Err(e) = provider.shutdown() {
            eprintln!("error shutting down tracer provider: {e:?}");
        }
    }
}

struct HeaderInjector<'a>(&'a mut async_nats::HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value.as_str());
    }
}

struct HeaderExtractor<'a>(&'a async_nats::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|value| value.as_str())
    }

    fn keys(&self) -> Vec<&str> {
        // The trace-context propagator never enumerates keys.
        Vec::new()
    }
}

/// Injects the current span's trace context into bus-message headers.
pub fn inject_context(headers: &mut async_nats::HeaderMap) {
    let context = tracing::Span::current().context();
    global::get_text_map_propagator(|propagator| {
        propagator.inject_context(&context, &mut HeaderInjector(headers));
    });
}

/// Extracts a trace context from bus-message headers; an empty context when
/// the message carries none.
pub fn extract_context(headers: Option<&async_nats::HeaderMap>) -> opentelemetry::Context {
    match headers {
        Some(headers) => {
            global::get_text_map_propagator(|propagator| propagator.extract(&HeaderExtractor(headers)))
        }
        None => opentelemetry::Context::new(),
    }
}
