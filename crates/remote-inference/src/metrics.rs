// remote-inference/crates/remote-inference/src/metrics.rs

use prometheus::{Encoder, TextEncoder, Registry, IntCounterVec, IntGauge, HistogramVec};
use lazy_static::lazy_static;
use std::sync::OnceLock;
use axum::response::IntoResponse;
use axum::http::StatusCode;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static REQ_COUNTER: OnceLock<IntCounterVec> = OnceLock::new();
static IN_FLIGHT: OnceLock<IntGauge> = OnceLock::new();
static DURATION: OnceLock<HistogramVec> = OnceLock::new();

pub fn init_metrics() {
    let req_counter = REQ_COUNTER.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("inference_requests_total", "Total inference requests per route"),
            &["route", "status"]
        ).expect("valid counter definition")
    });

    let in_flight = IN_FLIGHT.get_or_init(|| {
        IntGauge::new("inference_in_flight", "Inference requests currently executing")
            .expect("valid gauge definition")
    });

    let duration = DURATION.get_or_init(|| {
        HistogramVec::new(
            prometheus::histogram_opts!(
                "inference_duration_seconds",
                "Engine call latency per route",
                vec![0.005, 0.025, 0.1, 0.5, 1.0, 5.0, 30.0, 120.0]
            ),
            &["route"]
        ).expect("valid histogram definition")
    });

    REGISTRY.register(Box::new(req_counter.clone())).ok();
    REGISTRY.register(Box::new(in_flight.clone())).ok();
    REGISTRY.register(Box::new(duration.clone())).ok();
}

pub fn inc_request(route: &str, status: u16) {
    if let Some(counter) = REQ_COUNTER.get() {
        counter.with_label_values(&[route, &status.to_string()]).inc();
    }
}

pub fn inc_in_flight() {
    if let Some(gauge) = IN_FLIGHT.get() {
        gauge.inc();
    }
}

pub fn dec_in_flight() {
    if let Some(gauge) = IN_FLIGHT.get() {
        gauge.dec();
    }
}

pub fn observe_duration(route: &str, seconds: f64) {
    if let Some(histogram) = DURATION.get() {
        histogram.with_label_values(&[route]).observe(seconds);
    }
}

pub fn render() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    buffer
}

pub async fn get_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        render(),
    )
}
