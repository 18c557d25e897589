use std::sync::OnceLock;
use std::time::Duration;

use airlock_events::DispatchReport;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();
static ACCESS_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static OBJECTS_SEALED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static EVENT_DELIVERIES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

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
                    "airlock_gateway_http_requests_total",
                    "Gateway HTTP request count.",
                ),
                &["route", "method", "status"],
            )
            .expect("create airlock_gateway_http_requests_total"),
        )
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        register_collector(
            HistogramVec::new(
                HistogramOpts::new(
                    "airlock_gateway_http_request_duration_seconds",
                    "Gateway HTTP request duration in seconds.",
                )
                .buckets(vec![
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ]),
                &["route", "method", "outcome"],
            )
            .expect("create airlock_gateway_http_request_duration_seconds"),
        )
    })
}

fn access_decisions_total() -> &'static IntCounterVec {
    ACCESS_DECISIONS_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "airlock_gateway_access_decisions_total",
                    "Access gate decisions by route and outcome.",
                ),
                &["route", "outcome"],
            )
            .expect("create airlock_gateway_access_decisions_total"),
        )
    })
}

fn objects_sealed_total() -> &'static IntCounter {
    OBJECTS_SEALED_TOTAL.get_or_init(|| {
        register_collector(
            IntCounter::new(
                "airlock_gateway_objects_sealed_total",
                "Objects sealed under a new policy.",
            )
            .expect("create airlock_gateway_objects_sealed_total"),
        )
    })
}

fn event_deliveries_total() -> &'static IntCounterVec {
    EVENT_DELIVERIES_TOTAL.get_or_init(|| {
        register_collector(
            IntCounterVec::new(
                Opts::new(
                    "airlock_gateway_event_deliveries_total",
                    "Notification bus handler invocations by event name and result.",
                ),
                &["event_name", "result"],
            )
            .expect("create airlock_gateway_event_deliveries_total"),
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

pub fn observe_access_decision(route: &str, outcome: &str) {
    access_decisions_total()
        .with_label_values(&[route, outcome])
        .inc();
}

pub fn inc_objects_sealed() {
    objects_sealed_total().inc();
}

pub fn observe_event_dispatch(event_name: &str, report: &DispatchReport) {
    if report.delivered > 0 {
        event_deliveries_total()
            .with_label_values(&[event_name, "delivered"])
            .inc_by(report.delivered as u64);
    }
    if report.failed > 0 {
        event_deliveries_total()
            .with_label_values(&[event_name, "failed"])
            .inc_by(report.failed as u64);
    }
}

pub fn render() -> Result<(Vec<u8>, String), prometheus::Error> {
    let _ = objects_sealed_total();

    let encoder = TextEncoder::new();
    let metric_families = registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}
