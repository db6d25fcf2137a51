use axum::{routing::get, Router};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("radar_scrapes_total", "Completed scrape cycles.");
        describe_counter!("radar_items_found_total", "Items parsed from the upstream.");
        describe_counter!("radar_items_sent_total", "New-listing alerts delivered.");
        describe_counter!("radar_price_drops_total", "Price-drop alerts delivered.");
        describe_counter!("radar_errors_total", "Fetch, detect and delivery errors.");
        describe_counter!(
            "radar_duplicates_skipped_total",
            "Sends skipped by the durable idempotency gate."
        );
        describe_counter!("radar_fetch_attempts_total", "Upstream fetch attempts.");
        describe_counter!(
            "radar_fetch_soft_blocks_total",
            "200 responses with empty/non-JSON bodies."
        );
        describe_counter!("radar_fetch_auth_failures_total", "Upstream 401/403 responses.");
        describe_counter!("radar_fetch_throttled_total", "Upstream 429 responses.");
        describe_counter!(
            "radar_price_tracks_seeded_total",
            "Price tracks created on first observation."
        );
        describe_gauge!("radar_queue_depth", "Entries currently in the delivery queue.");
        describe_gauge!("radar_last_cycle_ts", "Unix ts when a scrape cycle last ran.");
        describe_histogram!("radar_cycle_ms", "Scrape cycle wall time in milliseconds.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder and register series descriptions.
    pub fn init() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus: install recorder");
        ensure_metrics_described();
        Self { handle }
    }

    /// Returns a router exposing `/metrics` with the Prometheus exposition format.
    pub fn router(&self) -> Router {
        let handle = self.handle.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let h = handle.clone();
                async move { h.render() }
            }),
        )
    }
}
