//! # Session Management
//! One rotating HTTP session per target domain. A session is a reqwest
//! client bound to one identity with its own cookie jar; it simulates a
//! browser being opened, used for a while, and closed. Rotation triggers
//! on a randomized request-count threshold (80–120) or a 90 minute age,
//! and is forced by `invalidate` after an upstream auth failure.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::identity::{self, ChooseIdentity};
use crate::rate_limit::RateLimiter;
use crate::timing;

const MAX_AGE: Duration = Duration::from_secs(90 * 60);
const STALE_AFTER: Duration = Duration::from_secs(30 * 60);

struct SessionState {
    client: Option<reqwest::Client>,
    created_at: Instant,
    request_count: u32,
    max_requests: u32,
}

fn due_for_rotation(state: &SessionState, now: Instant) -> bool {
    match state.client {
        None => true,
        Some(_) => {
            state.request_count >= state.max_requests
                || now.duration_since(state.created_at) >= MAX_AGE
        }
    }
}

pub struct SessionManager {
    host: String,
    domain_key: String,
    identities: Arc<dyn ChooseIdentity>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    state: Mutex<SessionState>,
}

impl SessionManager {
    pub fn new(
        host: String,
        identities: Arc<dyn ChooseIdentity>,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Self {
        let domain_key = crate::fetch::params::domain_key(&host);
        Self {
            host,
            domain_key,
            identities,
            limiter,
            timeout,
            state: Mutex::new(SessionState {
                client: None,
                created_at: Instant::now(),
                request_count: 0,
                max_requests: 100,
            }),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Rate-limit admission for callers that bypass the session client
    /// (proxied one-off requests still count against the domain budget).
    pub async fn throttle(&self) {
        self.limiter.acquire(&self.domain_key).await;
    }

    /// GET through the current session: rate-limited, auto-rotating, with
    /// a freshly chosen referer on every request. The rotation decision is
    /// taken under the state mutex; the request itself runs on a cloned
    /// client handle outside it.
    pub async fn get(&self, url: &str, params: &[(String, String)]) -> Result<reqwest::Response> {
        self.limiter.acquire(&self.domain_key).await;

        let client = {
            let mut state = self.state.lock().await;
            if due_for_rotation(&state, Instant::now()) {
                if state.client.is_some() {
                    tracing::info!(
                        host = %self.host,
                        requests = state.request_count,
                        age_min = Instant::now().duration_since(state.created_at).as_secs() / 60,
                        "rotating session"
                    );
                    // Pause between "closing" and "opening" a browser so
                    // rotation doesn't leave a burst signature.
                    tokio::time::sleep(timing::human_delay(4.0, 0.25)).await;
                }
                state.client = Some(self.create_session().await?);
                state.created_at = Instant::now();
                state.request_count = 0;
                state.max_requests = rand::rng().random_range(80..=120);
            }
            state.request_count += 1;
            state
                .client
                .clone()
                .context("session client missing after init")?
        };

        let request = client
            .get(url)
            .query(params)
            .header("referer", identity::random_referer(&self.host))
            .timeout(self.timeout);

        match request.send().await {
            Ok(response) => Ok(response),
            Err(e) => {
                // Transport failures poison the session; the next request
                // starts from a fresh identity.
                self.invalidate().await;
                Err(e).with_context(|| format!("request to {url} failed"))
            }
        }
    }

    /// Builds a client bound to a fresh identity and warms it up with a
    /// full GET on the site root to acquire cookies. A failed warm-up is
    /// logged but not fatal — the first real request will tell.
    async fn create_session(&self) -> Result<reqwest::Client> {
        let chosen = self.identities.next_identity(&self.host);
        let client = reqwest::Client::builder()
            .default_headers(chosen.header_map(&self.host))
            .cookie_store(true)
            .timeout(self.timeout)
            .build()
            .context("building session client")?;

        match client.get(format!("https://{}/", self.host)).send().await {
            Ok(r) if r.status().is_success() => {
                tracing::info!(host = %self.host, ua = chosen.user_agent, "session warmed up");
            }
            Ok(r) => {
                tracing::warn!(host = %self.host, status = %r.status(), "session warm-up status");
            }
            Err(e) => {
                tracing::warn!(host = %self.host, error = %e, "session warm-up failed");
            }
        }
        Ok(client)
    }

    /// Forces re-initialization on the next request (401/403 handling).
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.client = None;
        state.request_count = 0;
        tracing::info!(host = %self.host, "session invalidated");
    }
}

struct PoolEntry {
    manager: Arc<SessionManager>,
    last_used: Instant,
}

/// Owns one `SessionManager` per target host, evicting managers that have
/// not been used for 30 minutes. Hot reload clears the whole map.
pub struct SessionPool {
    identities: Arc<dyn ChooseIdentity>,
    limiter: Arc<RateLimiter>,
    timeout: Duration,
    inner: Mutex<HashMap<String, PoolEntry>>,
}

impl SessionPool {
    pub fn new(
        identities: Arc<dyn ChooseIdentity>,
        limiter: Arc<RateLimiter>,
        timeout: Duration,
    ) -> Self {
        Self {
            identities,
            limiter,
            timeout,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_create(&self, host: &str) -> Arc<SessionManager> {
        let mut inner = self.inner.lock().await;
        let entry = inner.entry(host.to_string()).or_insert_with(|| PoolEntry {
            manager: Arc::new(SessionManager::new(
                host.to_string(),
                Arc::clone(&self.identities),
                Arc::clone(&self.limiter),
                self.timeout,
            )),
            last_used: Instant::now(),
        });
        entry.last_used = Instant::now();
        Arc::clone(&entry.manager)
    }

    /// Drops managers unused for more than 30 minutes.
    pub async fn cleanup_stale(&self) {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let before = inner.len();
        inner.retain(|_, e| now.duration_since(e.last_used) <= STALE_AFTER);
        let evicted = before - inner.len();
        if evicted > 0 {
            tracing::info!(evicted, "evicted stale sessions");
        }
    }

    /// Hot reload: every domain re-initializes from scratch.
    pub async fn invalidate_all(&self) {
        let mut inner = self.inner.lock().await;
        let count = inner.len();
        inner.clear();
        if count > 0 {
            tracing::info!(count, "cleared all sessions");
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityPool;

    fn state(client: Option<reqwest::Client>, count: u32, max: u32) -> SessionState {
        SessionState {
            client,
            created_at: Instant::now(),
            request_count: count,
            max_requests: max,
        }
    }

    #[tokio::test]
    async fn rotation_triggers_on_missing_client_and_request_count() {
        let now = Instant::now();
        assert!(due_for_rotation(&state(None, 0, 100), now));

        let client = reqwest::Client::new();
        assert!(!due_for_rotation(&state(Some(client.clone()), 50, 100), now));
        assert!(due_for_rotation(&state(Some(client), 100, 100), now));
    }

    #[tokio::test(start_paused = true)]
    async fn rotation_triggers_on_age() {
        let client = reqwest::Client::new();
        let st = state(Some(client), 1, 100);
        tokio::time::advance(MAX_AGE + Duration::from_secs(1)).await;
        assert!(due_for_rotation(&st, Instant::now()));
    }

    #[tokio::test]
    async fn pool_reuses_managers_per_host() {
        let pool = SessionPool::new(
            Arc::new(IdentityPool::new()),
            Arc::new(RateLimiter::new(25, Duration::from_secs(60))),
            Duration::from_secs(10),
        );
        let a = pool.get_or_create("www.example.pl").await;
        let b = pool.get_or_create("www.example.pl").await;
        let c = pool.get_or_create("www.example.de").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(pool.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_managers_are_evicted() {
        let pool = SessionPool::new(
            Arc::new(IdentityPool::new()),
            Arc::new(RateLimiter::new(25, Duration::from_secs(60))),
            Duration::from_secs(10),
        );
        pool.get_or_create("www.example.pl").await;
        tokio::time::advance(STALE_AFTER + Duration::from_secs(1)).await;
        pool.get_or_create("www.example.de").await;
        pool.cleanup_stale().await;
        assert_eq!(pool.len().await, 1);
    }
}
