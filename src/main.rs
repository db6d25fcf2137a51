//! listing-radar — Binary Entrypoint
//! Boots the two pipeline loops (scraper + sender), the hot-reload signal
//! handler and the Axum health/stats/metrics server, then waits for
//! Ctrl+C and lets everything wind down at its next suspension point.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use listing_radar::api::{self, AppState};
use listing_radar::config::{keys, AppConfig, ConfigCache};
use listing_radar::detect::ChangeDetector;
use listing_radar::fetch::{FetchOrchestrator, ScrapeDeps};
use listing_radar::identity::IdentityPool;
use listing_radar::metrics::Metrics;
use listing_radar::notify::NotifierMux;
use listing_radar::proxy::ProxyPool;
use listing_radar::queue;
use listing_radar::rate_limit::RateLimiter;
use listing_radar::ratings::RatingCache;
use listing_radar::scheduler::{spawn_reload_signal, HotReload, ScrapeLoop};
use listing_radar::sender::Sender;
use listing_radar::session::SessionPool;
use listing_radar::store::{FileStore, Store};

const QUEUE_CAPACITY: usize = 200;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("listing_radar=info,warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op in prod environments.
    let _ = dotenvy::dotenv();
    init_tracing();

    let app_config = AppConfig::load().context("loading configuration")?;
    let metrics = Metrics::init();

    let store: Arc<dyn Store> = Arc::new(
        FileStore::open(&app_config.state_path, &app_config.sources_path)
            .await
            .context("opening state store")?,
    );
    store
        .append_log("INFO", "main", "listing-radar starting")
        .await
        .ok();

    let config = Arc::new(ConfigCache::new(Arc::clone(&store)));
    let timeout = Duration::from_secs(app_config.request_timeout_secs);

    let identities = Arc::new(IdentityPool::new());
    let rate_per_min = config.get_u64(keys::RATE_LIMIT_PER_MIN).await as usize;
    let limiter = Arc::new(RateLimiter::new(rate_per_min, Duration::from_secs(60)));
    let sessions = Arc::new(SessionPool::new(
        Arc::clone(&identities) as _,
        Arc::clone(&limiter),
        timeout,
    ));

    // Proxy health probes target the first configured source host; with
    // no sources yet, probing is skipped.
    let probe_host = store.active_sources().await.ok().and_then(|sources| {
        sources.iter().flat_map(|s| s.urls.iter()).find_map(|u| {
            url::Url::parse(&u.url)
                .ok()
                .and_then(|p| p.host_str().map(str::to_string))
        })
    });
    let proxies = Arc::new(ProxyPool::new(Arc::clone(&store), probe_host));

    let ratings = Arc::new(RatingCache::with_defaults());
    let fetcher = Arc::new(FetchOrchestrator::new(
        Arc::clone(&sessions),
        Arc::clone(&proxies) as _,
        Arc::clone(&identities) as _,
        ratings,
        timeout,
    ));
    let detector = Arc::new(ChangeDetector::new(Arc::clone(&store)));
    let notifier = Arc::new(NotifierMux::new(app_config.bot_token.clone()));

    let (queue_tx, queue_rx) = queue::bounded(QUEUE_CAPACITY);
    let queue_depth = queue_tx.depth_handle();

    let (stop_tx, stop_rx) = watch::channel(false);

    let scraper = ScrapeLoop {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
        sessions: Arc::clone(&sessions),
        deps: ScrapeDeps {
            fetcher,
            detector,
            queue: queue_tx,
        },
    };
    let scraper_task = tokio::spawn(scraper.run(stop_rx.clone()));

    let sender = Sender::new(Arc::clone(&store), notifier);
    let sender_task = tokio::spawn(sender.run(queue_rx, stop_rx.clone()));

    let reload = Arc::new(HotReload {
        config,
        proxies,
        sessions,
    });
    let _reload_task = spawn_reload_signal(Arc::clone(&reload));

    let state = AppState {
        store: Arc::clone(&store),
        queue_depth,
        started_at: std::time::Instant::now(),
        reload,
    };
    let router = api::router(state, metrics.router());
    let listener = tokio::net::TcpListener::bind(&app_config.listen_addr)
        .await
        .with_context(|| format!("binding {}", app_config.listen_addr))?;
    tracing::info!(addr = %app_config.listen_addr, "api listening");

    let server = axum::serve(listener, router).with_graceful_shutdown({
        let mut stop = stop_rx.clone();
        async move {
            let _ = stop.changed().await;
        }
    });
    let server_task = tokio::spawn(server.into_future());

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    store
        .append_log("INFO", "main", "listing-radar stopping")
        .await
        .ok();
    let _ = stop_tx.send(true);

    let _ = scraper_task.await;
    let _ = sender_task.await;
    let _ = server_task.await;
    tracing::info!("bye");
    Ok(())
}
