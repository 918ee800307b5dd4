//! Observability endpoints (spec.md §6): Prometheus text exposition plus
//! the `/api/*` JSON envelopes and the performance Server-Sent-Events
//! stream, all reading from the same [`relay_observability::Aggregator`]
//! the data-plane workers write into.

use crate::server::AdminState;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Wrap a payload in the `{ success, data, timestamp }` envelope every
/// `/api/*` JSON endpoint in spec.md §6 shares.
fn envelope(data: Value) -> Json<Value> {
    Json(json!({
        "success": true,
        "data": data,
        "timestamp": now_ms(),
    }))
}

/// `GET /metrics` — Prometheus text exposition, names prefixed `gateway_*`.
pub async fn prometheus_metrics(State(state): State<Arc<AdminState>>) -> Response {
    let body = state.metrics.gather_text();
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// `GET /api/metrics/summary` — gateway-wide request/error/latency summary.
pub async fn metrics_summary(State(state): State<Arc<AdminState>>) -> Json<Value> {
    envelope(json!(state.metrics.summary()))
}

/// `GET /api/routes` — per-route request/error/latency roll-ups.
pub async fn route_metrics(State(state): State<Arc<AdminState>>) -> Json<Value> {
    envelope(json!(state.metrics.all_route_snapshots()))
}

/// `GET /api/upstreams` — per-upstream request/error/latency roll-ups.
pub async fn upstream_metrics(State(state): State<Arc<AdminState>>) -> Json<Value> {
    envelope(json!(state.metrics.all_upstream_snapshots()))
}

/// `GET /api/errors` — error counts broken down by category.
pub async fn error_metrics(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let summary = state.metrics.summary();
    envelope(json!({
        "total_errors": summary.total_errors,
        "by_category": summary.errors_by_category,
    }))
}

/// `GET /api/workers` — data-plane worker thread count and live connections.
///
/// The aggregator's counters are process-wide, not labeled per worker
/// thread (every monoio core shares the same `Aggregator`), so this
/// reports the configured worker count alongside the process-wide
/// connection gauge rather than a synthetic per-worker breakdown.
pub async fn worker_metrics(State(state): State<Arc<AdminState>>) -> Json<Value> {
    envelope(json!({
        "worker_count": state.num_workers,
        "active_connections": state.metrics.active_connections(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default = "default_window_minutes")]
    window: u64,
}

fn default_window_minutes() -> u64 {
    15
}

/// `GET /api/history?window=<minutes>` — rolling metrics snapshots.
pub async fn history(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<HistoryQuery>,
) -> Json<Value> {
    let samples = state.history.window(now_ms() as u64, query.window);
    envelope(json!({
        "window_minutes": query.window,
        "samples": samples,
    }))
}

/// `GET /api/health` — gateway-wide health, distinct from the plain
/// `/health` liveness probe: reports route/upstream counts and current
/// error rate so an operator can tell "admin API is up" from "gateway is
/// actually serving traffic cleanly".
pub async fn health(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let summary = state.metrics.summary();
    let error_rate = if summary.total_requests > 0 {
        summary.total_errors as f64 / summary.total_requests as f64
    } else {
        0.0
    };
    envelope(json!({
        "status": "ok",
        "routes": state.cache.routes.len(),
        "upstreams": state.cache.upstreams.len(),
        "total_requests": summary.total_requests,
        "error_rate": error_rate,
    }))
}

/// `GET /api/trace/stats` — request-sampling stats. Full distributed-trace
/// export is an out-of-scope external collaborator (spec.md §1); this
/// reports the counters the aggregator already has rather than a
/// synthetic trace store.
pub async fn trace_stats(State(state): State<Arc<AdminState>>) -> Json<Value> {
    let summary = state.metrics.summary();
    envelope(json!({
        "sampled_requests": summary.total_requests,
        "p50_ms": summary.p50_ms,
        "p95_ms": summary.p95_ms,
        "p99_ms": summary.p99_ms,
    }))
}

/// `GET /api/performance/realtime` — Server-Sent-Events stream of metric
/// snapshots, tagged `metrics`, `worker`, and `alert` in rotation. `alert`
/// fires only when the error rate over the last snapshot exceeds 5%; the
/// other two tags always carry a fresh snapshot.
pub async fn performance_realtime(
    State(state): State<Arc<AdminState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = stream::unfold((state, 0u64), |(state, tick)| async move {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let summary = state.metrics.summary();

        let event = if tick % 2 == 0 {
            Event::default()
                .event("metrics")
                .json_data(json!({"tag": "metrics", "data": summary}))
        } else {
            Event::default().event("worker").json_data(json!({
                "tag": "worker",
                "data": {
                    "worker_count": state.num_workers,
                    "active_connections": summary.active_connections,
                },
            }))
        };
        let mut event = event.unwrap_or_else(|_| Event::default().data("{}"));

        if summary.total_requests > 0
            && summary.total_errors as f64 / summary.total_requests as f64 > 0.05
        {
            event = Event::default()
                .event("alert")
                .json_data(json!({
                    "tag": "alert",
                    "message": "error rate above 5%",
                    "total_errors": summary.total_errors,
                    "total_requests": summary.total_requests,
                }))
                .unwrap_or(event);
        }

        Some((Ok(event), (state, tick + 1)))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}
