//! Health and stats surface for external polling, plus the admin reload
//! trigger. The Prometheus exposition lives on its own router in
//! `metrics` and is merged in here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::CorsLayer;

use crate::scheduler::HotReload;
use crate::store::Store;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue_depth: Arc<AtomicUsize>,
    pub started_at: std::time::Instant,
    pub reload: Arc<HotReload>,
}

pub fn router(state: AppState, metrics_router: Router) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/stats", get(stats))
        .route("/admin/reload", post(admin_reload))
        .with_state(state)
        .merge(metrics_router)
        .layer(CorsLayer::very_permissive())
}

#[derive(serde::Serialize)]
struct StatsOut {
    uptime_seconds: u64,
    queue_depth: usize,
    sources: usize,
    active_sources: usize,
    deliveries: usize,
    price_tracks: usize,
    logs: usize,
}

async fn stats(State(state): State<AppState>) -> Json<StatsOut> {
    let store_stats = state.store.stats().await.unwrap_or_default();
    Json(StatsOut {
        uptime_seconds: state.started_at.elapsed().as_secs(),
        queue_depth: state.queue_depth.load(Ordering::SeqCst),
        sources: store_stats.sources,
        active_sources: store_stats.active_sources,
        deliveries: store_stats.deliveries,
        price_tracks: store_stats.price_tracks,
        logs: store_stats.logs,
    })
}

async fn admin_reload(State(state): State<AppState>) -> &'static str {
    state.reload.fire().await;
    "reloaded"
}
