use crate::handlers;
use relay_core::config::AdminConfig;
use relay_core::router::Router;
use relay_plugin::registry::PluginRegistry;
use relay_store::cache::ConfigCache;
use relay_observability::Aggregator;
use arc_swap::ArcSwap;
use axum::routing::{delete, get, put};
use axum::Router as AxumRouter;
use std::time::Duration;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::info;

/// Shared state for the Admin API.
///
/// `router_swap` is the same `ArcSwap<Router>` the data-plane workers read —
/// a successful write here is visible to every worker thread on its next
/// atomic load, no separate config-push step required.
pub struct AdminState {
    pub cache: ConfigCache,
    pub router_swap: Arc<ArcSwap<Router>>,
    pub plugin_registry: Arc<PluginRegistry>,
    /// Notified after every route mutation; workers can await this instead
    /// of polling if they want to react to config changes eagerly.
    pub config_changed: Arc<Notify>,
    /// Where standalone-mode state (routes/services/upstreams/consumers) is
    /// persisted. `None` disables persistence (used by tests).
    pub state_file: Option<PathBuf>,
    /// Shared with every data-plane worker thread; source of truth for the
    /// `/metrics` and `/api/metrics/*` endpoints.
    pub metrics: Arc<Aggregator>,
    /// Rolling history of periodic metrics snapshots, for `/api/metrics/history`.
    pub history: Arc<crate::history::MetricsHistory>,
    /// Number of data-plane worker threads, for `/api/metrics/workers`.
    pub num_workers: usize,
}

/// Build the Axum router with all admin routes, given a fully constructed
/// `AdminState`. Split out from `start_admin` so tests can drive the router
/// directly with `tower::ServiceExt::oneshot` without binding a socket.
pub fn build_admin_router(state: Arc<AdminState>) -> AxumRouter {
    let admin_api = AxumRouter::new()
        .route("/health", get(handlers::health::health_check))
        // Routes
        .route("/routes", get(handlers::routes::list_routes))
        .route("/routes/{id}", put(handlers::routes::put_route))
        .route("/routes/{id}", get(handlers::routes::get_route))
        .route("/routes/{id}", delete(handlers::routes::delete_route))
        // Services
        .route("/services", get(handlers::services::list_services))
        .route("/services/{id}", put(handlers::services::put_service))
        .route("/services/{id}", get(handlers::services::get_service))
        .route("/services/{id}", delete(handlers::services::delete_service))
        // Upstreams
        .route("/upstreams", get(handlers::upstreams::list_upstreams))
        .route("/upstreams/{id}", put(handlers::upstreams::put_upstream))
        .route("/upstreams/{id}", get(handlers::upstreams::get_upstream))
        .route("/upstreams/{id}", delete(handlers::upstreams::delete_upstream))
        // Consumers
        .route("/consumers", get(handlers::consumers::list_consumers))
        .route("/consumers/{username}", put(handlers::consumers::put_consumer))
        .route("/consumers/{username}", get(handlers::consumers::get_consumer))
        .route("/consumers/{username}", delete(handlers::consumers::delete_consumer))
        // Plugins
        .route("/plugins/list", get(handlers::plugins::list_plugins));

    let observability_api = AxumRouter::new()
        .route("/metrics/summary", get(handlers::observability::metrics_summary))
        .route("/routes", get(handlers::observability::route_metrics))
        .route("/upstreams", get(handlers::observability::upstream_metrics))
        .route("/errors", get(handlers::observability::error_metrics))
        .route("/workers", get(handlers::observability::worker_metrics))
        .route("/history", get(handlers::observability::history))
        .route("/health", get(handlers::observability::health))
        .route("/trace/stats", get(handlers::observability::trace_stats))
        .route(
            "/performance/realtime",
            get(handlers::observability::performance_realtime),
        );

    AxumRouter::new()
        .nest("/apisix/admin", admin_api)
        .nest("/api", observability_api)
        .route("/metrics", get(handlers::observability::prometheus_metrics))
        .route("/dashboard", get(handlers::dashboard::dashboard_index))
        .route("/dashboard/{*path}", get(handlers::dashboard::dashboard_assets))
        .with_state(state)
}

/// Background sampler: pushes a `MetricsSummary` into `state.history`
/// roughly once every `interval`, so `GET /api/history` has something to
/// return beyond the single current instant.
pub fn spawn_history_sampler(state: Arc<AdminState>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let summary = state.metrics.summary();
            let ts = chrono::Utc::now().timestamp_millis().max(0) as u64;
            state.history.push(ts, summary);
        }
    });
}

/// Start the admin API server, binding `config.addr` and serving until the
/// process is killed (the caller runs this on its own dedicated tokio
/// runtime; see relay-server's main.rs).
pub async fn start_admin(config: AdminConfig, state: Arc<AdminState>) -> anyhow::Result<()> {
    if !config.enabled {
        info!("Admin API disabled");
        return Ok(());
    }

    let addr = config.addr;
    spawn_history_sampler(Arc::clone(&state), Duration::from_secs(10));
    let app = build_admin_router(state);

    info!(addr = %addr, "Starting Admin API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
