//! # Proxy Pool
//! Optional upstream egress paths. The list comes from configuration (a
//! semicolon-separated value and/or a remote list URL), is cached for a
//! TTL (default 6h), and can optionally be health-probed before use. When
//! nothing is configured, `get_proxy` yields `None` — direct connection.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::store::Store;

const DEFAULT_TTL: Duration = Duration::from_secs(6 * 60 * 60);
const PROBE_WORKERS: usize = 10;
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One proxy endpoint, normalized to a full URL (`http://host:port`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint(String);

impl ProxyEndpoint {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if raw.contains("://") {
            Some(Self(raw.to_string()))
        } else {
            Some(Self(format!("http://{raw}")))
        }
    }

    pub fn as_url(&self) -> &str {
        &self.0
    }

    pub fn to_reqwest(&self) -> Result<reqwest::Proxy> {
        reqwest::Proxy::all(&self.0).with_context(|| format!("invalid proxy url {}", self.0))
    }
}

/// Strategy seam mirroring `ChooseIdentity`: selection policy is swappable
/// without touching the fetch path.
#[async_trait]
pub trait ChooseProxy: Send + Sync {
    async fn get_proxy(&self) -> Option<ProxyEndpoint>;
    async fn report_success(&self, _proxy: &ProxyEndpoint, _latency: Duration) {}
    async fn report_error(&self, _proxy: &ProxyEndpoint) {}
}

#[derive(Default)]
struct Cache {
    endpoints: Option<Vec<ProxyEndpoint>>,
    loaded: bool,
    refreshed_at: Option<Instant>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Score {
    successes: u64,
    errors: u64,
}

pub struct ProxyPool {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    /// Host to probe candidates against; `None` disables probing.
    probe_host: Option<String>,
    ttl: Duration,
    cache: Mutex<Cache>,
    scores: Mutex<std::collections::HashMap<ProxyEndpoint, Score>>,
}

impl ProxyPool {
    pub fn new(store: Arc<dyn Store>, probe_host: Option<String>) -> Self {
        Self {
            store,
            client: reqwest::Client::new(),
            probe_host,
            ttl: DEFAULT_TTL,
            cache: Mutex::new(Cache::default()),
            scores: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Drop the cached list; the next `get_proxy` reloads from config.
    pub async fn invalidate(&self) {
        let mut cache = self.cache.lock().await;
        *cache = Cache::default();
        tracing::info!("proxy cache invalidated");
    }

    pub async fn count(&self) -> usize {
        let cache = self.cache.lock().await;
        cache.endpoints.as_ref().map(Vec::len).unwrap_or(0)
    }

    async fn load(&self) -> Option<Vec<ProxyEndpoint>> {
        let mut all: Vec<ProxyEndpoint> = Vec::new();

        // Source 1: inline list, semicolon-separated.
        if let Ok(raw) = self.store.get_config("proxy_list", "").await {
            all.extend(raw.split(';').filter_map(ProxyEndpoint::parse));
        }

        // Source 2: remote list URL, one host:port per line.
        if let Ok(url) = self.store.get_config("proxy_list_url", "").await {
            let url = url.trim().to_string();
            if !url.is_empty() {
                let fetched = self.fetch_from_url(&url).await;
                tracing::info!(count = fetched.len(), "fetched proxy list from url");
                all.extend(fetched);
            }
        }

        if all.is_empty() {
            tracing::debug!("no proxies configured, using direct connection");
            return None;
        }

        let check = self
            .store
            .get_config("proxy_check_enabled", "false")
            .await
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if check {
            if let Some(host) = self.probe_host.clone() {
                tracing::info!(candidates = all.len(), "probing proxy candidates");
                let working = self.probe_parallel(all.clone(), &host).await;
                tracing::info!(working = working.len(), total = all.len(), "proxy probe done");
                if !working.is_empty() {
                    return Some(working);
                }
                // An empty probe result must not cut all egress paths.
            }
        }
        Some(all)
    }

    async fn fetch_from_url(&self, url: &str) -> Vec<ProxyEndpoint> {
        let response = match self
            .client
            .get(url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "proxy list fetch failed");
                return Vec::new();
            }
        };
        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(error = %e, "proxy list body unreadable");
                return Vec::new();
            }
        };
        body.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#') && l.contains(':'))
            .filter_map(ProxyEndpoint::parse)
            .collect()
    }

    async fn probe_parallel(
        &self,
        candidates: Vec<ProxyEndpoint>,
        probe_host: &str,
    ) -> Vec<ProxyEndpoint> {
        let sem = Arc::new(Semaphore::new(PROBE_WORKERS));
        let probe_url = format!("https://{probe_host}/");
        let mut set = JoinSet::new();
        for proxy in candidates {
            let sem = Arc::clone(&sem);
            let probe_url = probe_url.clone();
            set.spawn(async move {
                let _permit = sem.acquire_owned().await.ok()?;
                probe_one(&proxy, &probe_url).await.then_some(proxy)
            });
        }
        let mut working = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(proxy)) = joined {
                working.push(proxy);
            }
        }
        working
    }
}

/// HEAD request through the candidate; any 2xx/3xx (redirects included)
/// counts as alive.
async fn probe_one(proxy: &ProxyEndpoint, probe_url: &str) -> bool {
    let Ok(reqwest_proxy) = proxy.to_reqwest() else {
        return false;
    };
    let Ok(client) = reqwest::Client::builder()
        .proxy(reqwest_proxy)
        .redirect(reqwest::redirect::Policy::none())
        .timeout(PROBE_TIMEOUT)
        .build()
    else {
        return false;
    };
    match client.head(probe_url).send().await {
        Ok(r) => r.status().is_success() || r.status().is_redirection(),
        Err(_) => false,
    }
}

#[async_trait]
impl ChooseProxy for ProxyPool {
    async fn get_proxy(&self) -> Option<ProxyEndpoint> {
        let mut cache = self.cache.lock().await;
        let expired = cache
            .refreshed_at
            .map(|t| t.elapsed() > self.ttl)
            .unwrap_or(false);
        if !cache.loaded || expired {
            cache.endpoints = self.load().await;
            cache.loaded = true;
            cache.refreshed_at = Some(Instant::now());
        }
        cache
            .endpoints
            .as_deref()
            .and_then(|list| list.choose(&mut rand::rng()).cloned())
    }

    async fn report_success(&self, proxy: &ProxyEndpoint, latency: Duration) {
        let mut scores = self.scores.lock().await;
        scores.entry(proxy.clone()).or_default().successes += 1;
        tracing::trace!(proxy = proxy.as_url(), ms = latency.as_millis() as u64, "proxy ok");
    }

    async fn report_error(&self, proxy: &ProxyEndpoint) {
        let mut scores = self.scores.lock().await;
        scores.entry(proxy.clone()).or_default().errors += 1;
    }
}

/// Always-direct strategy for deployments without proxies and for tests.
pub struct DirectOnly;

#[async_trait]
impl ChooseProxy for DirectOnly {
    async fn get_proxy(&self) -> Option<ProxyEndpoint> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[test]
    fn endpoint_normalization_adds_scheme() {
        assert_eq!(
            ProxyEndpoint::parse("1.2.3.4:8080").unwrap().as_url(),
            "http://1.2.3.4:8080"
        );
        assert_eq!(
            ProxyEndpoint::parse("socks5://1.2.3.4:9050").unwrap().as_url(),
            "socks5://1.2.3.4:9050"
        );
        assert!(ProxyEndpoint::parse("  ").is_none());
    }

    #[tokio::test]
    async fn empty_config_means_direct_connection() {
        let store = Arc::new(MemStore::new());
        let pool = ProxyPool::new(store, Some("www.example.pl".into()));
        assert!(pool.get_proxy().await.is_none());
    }

    #[tokio::test]
    async fn inline_list_is_cached_and_selected() {
        let store = Arc::new(MemStore::new());
        store
            .set_config("proxy_list", "1.2.3.4:8080;user:pass@5.6.7.8:3128;")
            .await
            .unwrap();
        let pool = ProxyPool::new(store, Some("www.example.pl".into()));
        let picked = pool.get_proxy().await.expect("proxy expected");
        assert!(picked.as_url().starts_with("http://"));
        assert_eq!(pool.count().await, 2);
    }

    #[tokio::test]
    async fn invalidate_forces_reload() {
        let store = Arc::new(MemStore::new());
        store.set_config("proxy_list", "1.2.3.4:8080").await.unwrap();
        let pool = ProxyPool::new(Arc::clone(&store) as Arc<dyn Store>, Some("www.example.pl".into()));
        assert!(pool.get_proxy().await.is_some());

        store.set_config("proxy_list", "").await.unwrap();
        // Cache still serves the old list until invalidated.
        assert!(pool.get_proxy().await.is_some());
        pool.invalidate().await;
        assert!(pool.get_proxy().await.is_none());
    }
}
