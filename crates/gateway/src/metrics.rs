use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static PURCHASES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CASE_TRANSITIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static DOCUMENT_OPS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static PERMISSION_CACHE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn register_collector<T>(collector: T) -> T
where
    T: prometheus::core::Collector + Clone + 'static,
{
    let _ = registry().register(Box::new(collector.clone()));
    collector
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "lexlead_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create lexlead_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "lexlead_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create lexlead_gateway_http_request_duration_seconds"),
        )
    })
}

fn purchases_total() -> &'static IntCounterVec {
    PURCHASES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "lexlead_gateway_purchases_total",
                    "Lead purchase attempts by outcome.",
                ),
                &["outcome"],
            )
            .expect("create lexlead_gateway_purchases_total"),
        )
    })
}

fn case_transitions_total() -> &'static IntCounterVec {
    CASE_TRANSITIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "lexlead_gateway_case_transitions_total",
                    "Case status transitions applied.",
                ),
                &["to_status"],
            )
            .expect("create lexlead_gateway_case_transitions_total"),
        )
    })
}

fn document_ops_total() -> &'static IntCounterVec {
    DOCUMENT_OPS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "lexlead_gateway_document_ops_total",
                    "Document operations by collection, op and outcome.",
                ),
                &["collection", "op", "outcome"],
            )
            .expect("create lexlead_gateway_document_ops_total"),
        )
    })
}

fn permission_cache_total() -> &'static IntCounterVec {
    PERMISSION_CACHE_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "lexlead_gateway_permission_cache_total",
                    "Permission cache lookups by result.",
                ),
                &["result"],
            )
            .expect("create lexlead_gateway_permission_cache_total"),
        )
    })
}

pub fn observe_http_request(route: &str, method: &str, status: u16, duration: Duration) {
    let status_str = status.to_string();
    http_requests_total()
        .with_label_values(&[route, method, status_str.as_str()])
        .inc();

    let outcome = if (200..400).contains(&status) {
        "success"
    } else {
        "error"
    };
    http_request_duration_seconds()
        .with_label_values(&[route, method, outcome])
        .observe(duration.as_secs_f64());
}

pub fn observe_purchase(outcome: &str) {
    purchases_total().with_label_values(&[outcome]).inc();
}

pub fn observe_case_transition(to_status: &str) {
    case_transitions_total()
        .with_label_values(&[to_status])
        .inc();
}

pub fn observe_document_op(collection: &str, op: &str, outcome: &str) {
    document_ops_total()
        .with_label_values(&[collection, op, outcome])
        .inc();
}

pub fn observe_permission_cache(result: &str) {
    permission_cache_total().with_label_values(&[result]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
