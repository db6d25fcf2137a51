//! # Fetch Orchestration
//! One fetch task per configured (source, url), run concurrently under a
//! bounded worker cap. Each task maps the stored UI URL to API parameters,
//! executes up to three classified attempts (soft block / auth failure /
//! throttle / hard failure / transport failure), enriches parsed items
//! with seller ratings, and hands novelty decisions to the change
//! detector at the call site.

pub mod params;
pub mod parse;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use metrics::counter;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;

use crate::detect::{ChangeDetector, Verdict};
use crate::identity::ChooseIdentity;
use crate::proxy::ChooseProxy;
use crate::queue::{QueueEntry, QueueTx};
use crate::ratings::RatingCache;
use crate::session::{SessionManager, SessionPool};
use crate::store::Source;
use crate::timing;

pub use types::{CycleOutcome, Item, ItemFetcher, Price, SellerRef};

const MAX_ATTEMPTS: u32 = 3;
/// Consecutive 429s do not consume attempts, but they cannot spin forever.
const MAX_THROTTLES: u32 = 5;
const ENRICH_WORKERS: usize = 5;

pub struct FetchOrchestrator {
    sessions: Arc<SessionPool>,
    proxies: Arc<dyn ChooseProxy>,
    identities: Arc<dyn ChooseIdentity>,
    ratings: Arc<RatingCache>,
    timeout: Duration,
}

impl FetchOrchestrator {
    pub fn new(
        sessions: Arc<SessionPool>,
        proxies: Arc<dyn ChooseProxy>,
        identities: Arc<dyn ChooseIdentity>,
        ratings: Arc<RatingCache>,
        timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            proxies,
            identities,
            ratings,
            timeout,
        }
    }

    /// One HTTP attempt: through a proxy with a one-off client when one is
    /// configured, through the rotating session otherwise.
    async fn execute(
        &self,
        request: &params::ApiRequest,
        session: &SessionManager,
    ) -> Result<reqwest::Response> {
        let Some(proxy) = self.proxies.get_proxy().await else {
            return session.get(&request.endpoint, &request.params).await;
        };

        session.throttle().await;
        let identity = self.identities.next_identity(&request.host);
        let client = reqwest::Client::builder()
            .default_headers(identity.header_map(&request.host))
            .proxy(proxy.to_reqwest()?)
            .timeout(self.timeout)
            .build()
            .context("building proxied client")?;

        let started = std::time::Instant::now();
        match client
            .get(&request.endpoint)
            .query(&request.params)
            .send()
            .await
        {
            Ok(response) => {
                if response.status().is_success() {
                    self.proxies.report_success(&proxy, started.elapsed()).await;
                }
                Ok(response)
            }
            Err(e) => {
                self.proxies.report_error(&proxy).await;
                Err(e).with_context(|| format!("proxied request to {}", request.endpoint))
            }
        }
    }

    /// Fills missing seller ratings through the TTL cache, a handful of
    /// lookups at a time. Individual failures leave the default rating.
    async fn enrich(&self, items: &mut [Item], session: &Arc<SessionManager>) {
        let mut pending: Vec<i64> = items
            .iter()
            .filter(|it| it.seller.feedback_count == 0)
            .filter_map(|it| it.seller.id)
            .collect();
        pending.sort_unstable();
        pending.dedup();
        if pending.is_empty() {
            return;
        }

        let sem = Arc::new(Semaphore::new(pending.len().min(ENRICH_WORKERS)));
        let mut set = JoinSet::new();
        for seller_id in pending {
            let sem = Arc::clone(&sem);
            let ratings = Arc::clone(&self.ratings);
            let session = Arc::clone(session);
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                ratings
                    .get_or_fetch(seller_id, &session)
                    .await
                    .map(|rating| (seller_id, rating))
            });
        }

        let mut fetched = std::collections::HashMap::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some((seller_id, rating))) = joined {
                fetched.insert(seller_id, rating);
            }
        }

        for item in items.iter_mut() {
            let Some(rating) = item.seller.id.and_then(|id| fetched.get(&id)) else {
                continue;
            };
            if rating.feedback_count > 0 {
                item.seller.feedback_count = rating.feedback_count;
                item.seller.feedback_score = rating.score;
            }
            if !rating.country.is_empty() && item.seller.country.is_none() {
                item.seller.country = Some(rating.country.clone());
            }
        }
    }
}

#[async_trait::async_trait]
impl ItemFetcher for FetchOrchestrator {
    async fn fetch(&self, query_url: &str, per_page: u32) -> Result<Vec<Item>> {
        let request = params::build_api_request(query_url, per_page)?;
        let session = self.sessions.get_or_create(&request.host).await;

        let mut attempt: u32 = 0;
        let mut throttles: u32 = 0;
        loop {
            counter!("radar_fetch_attempts_total").increment(1);
            let response = match self.execute(&request, &session).await {
                Ok(r) => r,
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_ATTEMPTS {
                        return Err(e.context("transport failure, attempts exhausted"));
                    }
                    tracing::warn!(url = query_url, attempt, error = %e, "transport failure");
                    sleep(timing::fetch_backoff(attempt)).await;
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 {
                throttles += 1;
                if throttles > MAX_THROTTLES {
                    bail!("upstream throttled {throttles} times in a row");
                }
                let wait = crate::notify::retry_after_secs(&response, 20.0)
                    + rand::rng().random_range(1.0..5.0);
                counter!("radar_fetch_throttled_total").increment(1);
                tracing::warn!(wait_secs = wait, "upstream rate limit, honoring retry delay");
                sleep(Duration::from_secs_f64(wait)).await;
                continue;
            }

            if matches!(status.as_u16(), 401 | 403) {
                counter!("radar_fetch_auth_failures_total").increment(1);
                session.invalidate().await;
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    bail!("auth failure ({status}), attempts exhausted");
                }
                tracing::warn!(url = query_url, attempt, %status, "auth failure, rotating session");
                sleep(timing::fetch_backoff(attempt)).await;
                continue;
            }

            if !status.is_success() {
                // Non-retryable: abort this URL for the cycle.
                bail!("upstream returned {status}");
            }

            let body = response.text().await.context("reading response body")?;
            let parsed = if body.trim().is_empty() {
                None
            } else {
                serde_json::from_str::<serde_json::Value>(&body).ok()
            };
            let Some(json) = parsed else {
                // A 200 with an empty or non-JSON body is a soft block:
                // the session got flagged, not the request shape.
                counter!("radar_fetch_soft_blocks_total").increment(1);
                session.invalidate().await;
                attempt += 1;
                if attempt >= MAX_ATTEMPTS {
                    bail!("soft-blocked (empty/non-JSON body), attempts exhausted");
                }
                tracing::warn!(url = query_url, attempt, "soft block, rotating session");
                sleep(timing::fetch_backoff(attempt)).await;
                continue;
            };

            let now_ts = chrono::Utc::now().timestamp();
            let mut items = parse::parse_items(&json, &request.host, now_ts);
            self.enrich(&mut items, &session).await;
            return Ok(items);
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct TaskOutcome {
    fetched: usize,
    enqueued: usize,
    price_drops: usize,
    failures: usize,
}

/// Everything a scrape cycle needs, injected so tests can swap the fetcher
/// and the store behind the detector.
#[derive(Clone)]
pub struct ScrapeDeps {
    pub fetcher: Arc<dyn ItemFetcher>,
    pub detector: Arc<ChangeDetector>,
    pub queue: QueueTx,
}

/// Fans out one task per (active source, url) with a bounded worker count
/// and funnels accepted items into the delivery queue. Per-task failures
/// are logged and counted, never propagated.
pub async fn scrape_all(
    deps: &ScrapeDeps,
    sources: &[Source],
    items_per_query: u32,
    fresh_window_min: i64,
) -> CycleOutcome {
    let mut tasks = Vec::new();
    for source in sources.iter().filter(|s| s.active) {
        for url in &source.urls {
            tasks.push((source.clone(), url.clone()));
        }
    }

    let mut outcome = CycleOutcome {
        tasks: tasks.len(),
        ..Default::default()
    };
    if tasks.is_empty() {
        return outcome;
    }

    let sem = Arc::new(Semaphore::new(tasks.len().min(8)));
    let mut set = JoinSet::new();
    for (source, url) in tasks {
        let deps = deps.clone();
        let sem = Arc::clone(&sem);
        set.spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return TaskOutcome {
                    failures: 1,
                    ..Default::default()
                };
            };
            run_task(&deps, &source, &url, items_per_query, fresh_window_min).await
        });
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(task) => {
                outcome.fetched += task.fetched;
                outcome.enqueued += task.enqueued;
                outcome.price_drops += task.price_drops;
                outcome.failures += task.failures;
            }
            Err(e) => {
                tracing::error!(error = %e, "fetch task panicked");
                outcome.failures += 1;
            }
        }
    }
    outcome
}

async fn run_task(
    deps: &ScrapeDeps,
    source: &Source,
    url: &crate::store::SourceUrl,
    items_per_query: u32,
    fresh_window_min: i64,
) -> TaskOutcome {
    let mut outcome = TaskOutcome::default();

    let items = match deps.fetcher.fetch(&url.url, items_per_query).await {
        Ok(items) => items,
        Err(e) => {
            counter!("radar_errors_total").increment(1);
            tracing::warn!(source = %source.name, url = %url.url, error = %e, "fetch failed, skipping this cycle");
            outcome.failures += 1;
            return outcome;
        }
    };
    outcome.fetched = items.len();
    counter!("radar_items_found_total").increment(items.len() as u64);

    let now_ts = chrono::Utc::now().timestamp();
    // Oldest first, so the high-water mark advances in order.
    for item in items.iter().rev() {
        let verdict = deps
            .detector
            .process(
                item,
                source.id,
                &url.url,
                url.last_seen_ts,
                fresh_window_min,
                now_ts,
            )
            .await;
        match verdict {
            Ok(Verdict::Fresh) => {
                let entry = QueueEntry::NewItem {
                    item: item.clone(),
                    source_id: source.id,
                    source_name: source.name.clone(),
                    url: url.url.clone(),
                    sink: source.sink.clone(),
                };
                if deps.queue.send(entry).await.is_ok() {
                    outcome.enqueued += 1;
                }
            }
            Ok(Verdict::PriceDrop(event)) => {
                let entry = QueueEntry::PriceDrop {
                    item: item.clone(),
                    event,
                    source_id: source.id,
                    source_name: source.name.clone(),
                    sink: source.sink.clone(),
                };
                if deps.queue.send(entry).await.is_ok() {
                    outcome.price_drops += 1;
                }
            }
            Ok(_) => {}
            Err(e) => {
                counter!("radar_errors_total").increment(1);
                tracing::warn!(id = %item.external_id, error = %e, "detector failed for item");
                outcome.failures += 1;
            }
        }
    }
    outcome
}
