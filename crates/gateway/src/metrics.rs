use std::sync::OnceLock;
use std::time::Duration;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static SERVICE_CACHE_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static UPSTREAM_CALLS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static CALL_RECORDS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

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
                    "dag_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create dag_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "dag_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create dag_gateway_http_request_duration_seconds"),
        )
    })
}

fn service_cache_total() -> &'static IntCounterVec {
    SERVICE_CACHE_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "dag_gateway_service_cache_total",
                    "Service cache lookups by result.",
                ),
                &["result"],
            )
            .expect("create dag_gateway_service_cache_total"),
        )
    })
}

fn upstream_calls_total() -> &'static IntCounterVec {
    UPSTREAM_CALLS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "dag_gateway_upstream_calls_total",
                    "Outbound calls by target and outcome.",
                ),
                &["target", "outcome"],
            )
            .expect("create dag_gateway_upstream_calls_total"),
        )
    })
}

fn call_records_total() -> &'static IntCounterVec {
    CALL_RECORDS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "dag_gateway_call_records_total",
                    "Call records by persistence outcome.",
                ),
                &["outcome"],
            )
            .expect("create dag_gateway_call_records_total"),
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

pub fn observe_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    service_cache_total().with_label_values(&[result]).inc();
}

pub fn observe_upstream_call(target: &str, outcome: &str) {
    upstream_calls_total()
        .with_label_values(&[target, outcome])
        .inc();
}

/// `outcome` is one of `written`, `failed`, `dropped` or `skipped`.
pub fn observe_call_record(outcome: &str) {
    call_records_total().with_label_values(&[outcome]).inc();
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = service_cache_total();
    let _ = call_records_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rendered_text_names_gateway_metrics() {
        observe_http_request("/healthz", "GET", 200, Duration::from_millis(3));
        observe_cache_lookup(true);
        observe_upstream_call("engine", "ok");
        observe_call_record("written");

        let (body, content_type) = render().expect("metrics should render");
        let text = String::from_utf8(body).expect("utf8");
        assert!(content_type.starts_with("text/plain"));
        assert!(text.contains("dag_gateway_http_requests_total"));
        assert!(text.contains("dag_gateway_service_cache_total"));
        assert!(text.contains("dag_gateway_upstream_calls_total"));
        assert!(text.contains("dag_gateway_call_records_total"));
    }
}
