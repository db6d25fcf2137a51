//! # Scheduling
//! Two independent loops drive the pipeline: the scrape loop fires fetch
//! cycles at a jittered interval, the sender loop (see `sender`) drains
//! the delivery queue at a fast fixed cadence. They communicate only
//! through the bounded queue and the durable store, and both exit at
//! their next suspension point when the stop signal flips.

use std::sync::Arc;

use metrics::{counter, gauge, histogram};
use tokio::sync::watch;

use crate::config::{keys, ConfigCache};
use crate::fetch::{self, ScrapeDeps};
use crate::proxy::ProxyPool;
use crate::session::SessionPool;
use crate::store::Store;
use crate::timing;

/// Invalidation fan-out for the hot-reload signal (SIGHUP or the admin
/// endpoint): configuration, proxies and sessions all start fresh without
/// a process restart.
pub struct HotReload {
    pub config: Arc<ConfigCache>,
    pub proxies: Arc<ProxyPool>,
    pub sessions: Arc<SessionPool>,
}

impl HotReload {
    pub async fn fire(&self) {
        self.config.invalidate();
        self.proxies.invalidate().await;
        self.sessions.invalidate_all().await;
        tracing::info!("configuration reloaded");
    }
}

pub struct ScrapeLoop {
    pub store: Arc<dyn Store>,
    pub config: Arc<ConfigCache>,
    pub sessions: Arc<SessionPool>,
    pub deps: ScrapeDeps,
}

impl ScrapeLoop {
    /// Runs scrape cycles until the stop signal flips. Every per-cycle
    /// failure is contained here; the loop itself never dies.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        tracing::info!("scraper started");
        loop {
            let interval = self.config.get_u64(keys::SCAN_INTERVAL).await;
            self.run_cycle().await;

            let sleep_for = timing::scan_jitter(interval as f64);
            tracing::debug!(secs = sleep_for.as_secs(), "next scan");
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }
        }
        tracing::info!("scraper stopped");
    }

    async fn run_cycle(&self) {
        let started = std::time::Instant::now();

        let sources = match self.store.active_sources().await {
            Ok(sources) => sources,
            Err(e) => {
                counter!("radar_errors_total").increment(1);
                tracing::error!(error = %e, "reading sources failed, skipping cycle");
                return;
            }
        };
        if sources.is_empty() {
            tracing::debug!("no active sources");
            return;
        }

        let items_per_query = self.config.get_u64(keys::ITEMS_PER_QUERY).await as u32;
        let fresh_window_min = self.config.get_i64(keys::FRESH_WINDOW_MIN).await;

        let urls: usize = sources.iter().map(|s| s.urls.len()).sum();
        tracing::info!(sources = sources.len(), urls, window_min = fresh_window_min, "scan starting");

        let outcome =
            fetch::scrape_all(&self.deps, &sources, items_per_query, fresh_window_min).await;

        counter!("radar_scrapes_total").increment(1);
        gauge!("radar_last_cycle_ts").set(chrono::Utc::now().timestamp() as f64);
        histogram!("radar_cycle_ms").record(started.elapsed().as_secs_f64() * 1_000.0);

        if outcome.enqueued > 0 || outcome.price_drops > 0 {
            tracing::info!(
                fetched = outcome.fetched,
                enqueued = outcome.enqueued,
                price_drops = outcome.price_drops,
                failures = outcome.failures,
                "scan finished"
            );
            self.store
                .append_log(
                    "INFO",
                    "scraper",
                    &format!(
                        "scan: {} fetched, {} queued, {} price drops",
                        outcome.fetched, outcome.enqueued, outcome.price_drops
                    ),
                )
                .await
                .ok();
        } else {
            tracing::debug!(fetched = outcome.fetched, failures = outcome.failures, "scan finished");
        }

        self.sessions.cleanup_stale().await;
    }
}

/// Listens for SIGHUP (where available) and fires the hot reload.
pub fn spawn_reload_signal(reload: Arc<HotReload>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "SIGHUP handler unavailable");
                    return;
                }
            };
            while hup.recv().await.is_some() {
                tracing::info!("SIGHUP received");
                reload.fire().await;
            }
        }
        #[cfg(not(unix))]
        {
            let _ = reload;
        }
    })
}
