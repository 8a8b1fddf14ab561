use opentelemetry::trace::TracerProvider as TracerProviderTrait;
use opentelemetry::KeyValue;
use opentelemetry_otlp::{WithExportConfig, WithHttpConfig};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Extra layers installed alongside the formatter (for example an in-memory
/// capture of events).
pub type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Initialize tracing with optional OTLP export.
///
/// - `service_name`: identifies this component (e.g. "vantage-node")
/// - `log_format`: `json` for structured output, anything else for text
/// - `otlp_endpoint`: if `Some`, spans are exported via OTLP/HTTP to this base URL.
///   The exporter appends `/v1/traces`.
/// - `otlp_token`: bearer token for the collector
/// - `extra`: additional layers, installed after the filter
///
/// Returns the tracer provider when OTLP is enabled; keep it alive and call
/// `shutdown()` on it before exit.
pub fn init_tracing(
    service_name: &str,
    log_format: &str,
    otlp_endpoint: Option<&str>,
    otlp_token: Option<&str>,
    extra: Vec<BoxedLayer>,
) -> Option<TracerProvider> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers = extra;
    if log_format.eq_ignore_ascii_case("json") {
        layers.push(tracing_subscriber::fmt::layer().json().boxed());
    } else {
        layers.push(tracing_subscriber::fmt::layer().boxed());
    }

    let provider = otlp_endpoint.and_then(|endpoint| {
        let mut headers = std::collections::HashMap::new();
        if let Some(token) = otlp_token.filter(|t| !t.is_empty()) {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }

        let exporter = match opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(endpoint)
            .with_headers(headers)
            .build()
        {
            Ok(e) => e,
            Err(err) => {
                eprintln!("failed to create OTLP exporter: {err}, falling back to stdout only");
                return None;
            }
        };

        Some(
            TracerProvider::builder()
                .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
                .with_resource(Resource::new([KeyValue::new(
                    "service.name",
                    service_name.to_string(),
                )]))
                .build(),
        )
    });

    if let Some(provider) = &provider {
        layers.push(
            tracing_opentelemetry::layer()
                .with_tracer(provider.tracer(service_name.to_string()))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .init();

    if let Some(endpoint) = otlp_endpoint.filter(|_| provider.is_some()) {
        tracing::info!(endpoint, service_name, "OTLP tracing enabled");
    }
    provider
}
