// Process-wide telemetry: tracing (with optional OTLP export) and the
// Prometheus recorder behind the metrics/health listener.
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::KeyValue;
use opentelemetry::global;
use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::Resource;
use std::net::SocketAddr;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialise logging and metrics for the proxy process.
///
/// Spans are exported over OTLP only when a collector endpoint is
/// configured; a proxy with no collector logs locally and skips the batch
/// pipeline entirely. Every metric carries the `cluster` label so one
/// scrape job can tell co-located proxies apart.
pub fn init_observability(service_name: &str, cluster_name: &str) -> PrometheusHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    match otlp_tracer(service_name, cluster_name) {
        Some(tracer) => registry
            .with(tracing_opentelemetry::layer().with_tracer(tracer))
            .init(),
        None => registry.init(),
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("cluster", cluster_name)
        .install_recorder()
        .expect("install metrics recorder");
    describe_metrics();
    handle
}

/// Recorder-only initialisation for tests that exercise the metrics surface
/// without touching the global tracing subscriber.
pub fn init_test_recorder() -> PrometheusHandle {
    PrometheusBuilder::new()
        .install_recorder()
        .expect("install metrics recorder")
}

fn describe_metrics() {
    metrics::describe_gauge!(
        "pulsar_proxy_active_connections",
        "Number of connections currently active in the proxy"
    );
    metrics::describe_counter!(
        "pulsar_proxy_new_connections",
        "Counter of connections being opened in the proxy"
    );
    metrics::describe_counter!(
        "pulsar_proxy_rejected_connections",
        "Counter for connections rejected due to throttling"
    );
    metrics::describe_counter!("pulsar_proxy_binary_ops", "Counter of proxy operations");
    metrics::describe_counter!("pulsar_proxy_binary_bytes", "Counter of proxy bytes");
    metrics::describe_counter!(
        "pulsar_proxy_topic_bytes_in",
        "Bytes received per topic through the proxy"
    );
    metrics::describe_counter!(
        "pulsar_proxy_topic_msg_in",
        "Messages received per topic through the proxy"
    );
}

/// Build the OTLP span exporter when a collector is reachable.
///
/// Resource identity is the proxy's: the service name, the cluster it
/// fronts, and which instance this is. Topology labels beyond that belong
/// to the scrape/collector config, not to the process.
fn otlp_tracer(
    service_name: &str,
    cluster_name: &str,
) -> Option<opentelemetry_sdk::trace::Tracer> {
    // No collector endpoint means nothing is listening for spans; skip the
    // batch pipeline instead of exporting into the void.
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    global::set_text_map_propagator(opentelemetry_sdk::propagation::TraceContextPropagator::new());

    let mut attrs = vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("messaging.cluster", cluster_name.to_string()),
    ];
    if let Ok(instance) =
        std::env::var("EGRET_SERVICE_INSTANCE_ID").or_else(|_| std::env::var("HOSTNAME"))
    {
        attrs.push(KeyValue::new("service.instance.id", instance));
    }

    let provider = opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_exporter(opentelemetry_otlp::new_exporter().tonic())
        .with_trace_config(
            opentelemetry_sdk::trace::Config::default().with_resource(Resource::new(attrs)),
        )
        .install_batch(opentelemetry_sdk::runtime::Tokio)
        .ok()?;
    Some(provider.tracer(service_name.to_string()))
}

pub async fn serve_metrics(handle: PrometheusHandle, addr: SocketAddr) -> std::io::Result<()> {
    let app = axum::Router::new()
        .route(
            "/metrics",
            axum::routing::get(move || async move { handle.render() }),
        )
        .route("/health", axum::routing::get(|| async { "ok" }));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await
}
