use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use once_cell::sync::Lazy;
use prometheus::{opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Registry, TextEncoder};

use crate::crd::Alpine;
use crate::owner_index::OwnerIndex;

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static RECONCILE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("alpine_reconcile_total", "Reconcile passes by outcome"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONCILE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("alpine_reconcile_errors_total", "Failed reconcile passes by error kind"), &["kind"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static PODS_CREATED: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("alpine_pods_created_total", "Worker pods created").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static RECONCILE_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(
        HistogramOpts::new("alpine_reconcile_duration_seconds", "Reconcile pass latency")
            .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
    )
    .unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});

/// Touches every metric so they are exported before the first pass.
pub fn init() {
    Lazy::force(&RECONCILE_TOTAL);
    Lazy::force(&RECONCILE_ERRORS);
    Lazy::force(&PODS_CREATED);
    Lazy::force(&RECONCILE_DURATION);
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response()
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(index): State<OwnerIndex<Alpine>>) -> impl IntoResponse {
    if index.is_synced() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "pod cache not synced")
    }
}

/// `/metrics`, `/healthz` and `/readyz`; ready once the pod index has synced.
pub fn router(index: OwnerIndex<Alpine>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(index)
}
