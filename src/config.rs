//! # Configuration
//! Two layers, mirroring who owns what:
//! - `AppConfig`: process-level settings (paths, listen address, token)
//!   from an optional TOML file plus env overrides, read once at startup.
//! - `ConfigCache`: runtime settings owned by the admin surface and held
//!   in the durable store, read through a short TTL cache so edits apply
//!   within seconds without hammering the store. `invalidate` is the hot
//!   reload hook.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::time::Instant;

use crate::store::Store;

pub const ENV_CONFIG_PATH: &str = "RADAR_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/radar.toml";

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_state_path() -> PathBuf {
    PathBuf::from("state/radar_state.json")
}

fn default_sources_path() -> PathBuf {
    PathBuf::from("config/sources.toml")
}

fn default_request_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_sources_path")]
    pub sources_path: PathBuf,
    #[serde(default)]
    pub bot_token: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            state_path: default_state_path(),
            sources_path: default_sources_path(),
            bot_token: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl AppConfig {
    /// `$RADAR_CONFIG_PATH` (or `config/radar.toml`) if present, defaults
    /// otherwise, env vars last so they win.
    pub fn load() -> Result<Self> {
        let path = std::env::var(ENV_CONFIG_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        if let Ok(addr) = std::env::var("RADAR_LISTEN_ADDR") {
            config.listen_addr = addr;
        }
        if let Ok(p) = std::env::var("RADAR_STATE_PATH") {
            config.state_path = PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("RADAR_SOURCES_PATH") {
            config.sources_path = PathBuf::from(p);
        }
        if let Ok(token) = std::env::var("DISCORD_BOT_TOKEN") {
            if !token.trim().is_empty() {
                config.bot_token = Some(token);
            }
        }
        Ok(config)
    }
}

/// Runtime settings the pipeline re-reads each cycle.
pub mod keys {
    pub const SCAN_INTERVAL: (&str, &str) = ("scan_interval", "60");
    pub const ITEMS_PER_QUERY: (&str, &str) = ("items_per_query", "20");
    pub const FRESH_WINDOW_MIN: (&str, &str) = ("fresh_window_min", "2");
    pub const RATE_LIMIT_PER_MIN: (&str, &str) = ("rate_limit_per_min", "25");
}

const CACHE_TTL: Duration = Duration::from_secs(10);

struct CacheState {
    map: HashMap<String, String>,
    /// `None` marks the cache dirty (startup or explicit invalidation).
    refreshed_at: Option<Instant>,
}

pub struct ConfigCache {
    store: Arc<dyn Store>,
    inner: Mutex<CacheState>,
}

impl ConfigCache {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            inner: Mutex::new(CacheState {
                map: HashMap::new(),
                refreshed_at: None,
            }),
        }
    }

    pub async fn get(&self, key: &str, default: &str) -> String {
        {
            let mut guard = self.inner.lock().expect("config cache mutex poisoned");
            let expired = guard
                .refreshed_at
                .map(|t| t.elapsed() > CACHE_TTL)
                .unwrap_or(true);
            if expired {
                guard.map.clear();
                guard.refreshed_at = Some(Instant::now());
            } else if let Some(hit) = guard.map.get(key) {
                return hit.clone();
            }
        }

        let value = match self.store.get_config(key, default).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(key, error = %e, "config read failed, using default");
                default.to_string()
            }
        };

        let mut guard = self.inner.lock().expect("config cache mutex poisoned");
        guard.map.insert(key.to_string(), value.clone());
        value
    }

    pub async fn get_u64(&self, key: (&str, &str)) -> u64 {
        let raw = self.get(key.0, key.1).await;
        raw.parse().unwrap_or_else(|_| key.1.parse().unwrap_or(0))
    }

    pub async fn get_i64(&self, key: (&str, &str)) -> i64 {
        let raw = self.get(key.0, key.1).await;
        raw.parse().unwrap_or_else(|_| key.1.parse().unwrap_or(0))
    }

    /// Hot reload: the next read goes back to the store.
    pub fn invalidate(&self) {
        let mut guard = self.inner.lock().expect("config cache mutex poisoned");
        guard.map.clear();
        guard.refreshed_at = None;
        tracing::info!("config cache invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStore;

    #[serial_test::serial]
    #[test]
    fn env_overrides_beat_the_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("radar.toml");
        std::fs::write(&path, "listen_addr = \"127.0.0.1:9999\"\n").unwrap();
        std::env::set_var(ENV_CONFIG_PATH, path.display().to_string());
        std::env::set_var("RADAR_LISTEN_ADDR", "127.0.0.1:7777");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:7777");
        assert_eq!(config.request_timeout_secs, 10);

        std::env::remove_var(ENV_CONFIG_PATH);
        std::env::remove_var("RADAR_LISTEN_ADDR");
    }

    #[serial_test::serial]
    #[test]
    fn missing_file_falls_back_to_defaults() {
        std::env::remove_var(ENV_CONFIG_PATH);
        std::env::remove_var("RADAR_LISTEN_ADDR");
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var(ENV_CONFIG_PATH, tmp.path().join("absent.toml").display().to_string());

        let config = AppConfig::load().unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.sources_path, PathBuf::from("config/sources.toml"));

        std::env::remove_var(ENV_CONFIG_PATH);
    }

    #[tokio::test]
    async fn cache_serves_store_values_with_defaults() {
        let store = Arc::new(MemStore::new());
        store.set_config("scan_interval", "45").await.unwrap();
        let cache = ConfigCache::new(store);
        assert_eq!(cache.get_u64(keys::SCAN_INTERVAL).await, 45);
        assert_eq!(cache.get_u64(keys::ITEMS_PER_QUERY).await, 20);
    }

    #[tokio::test]
    async fn stale_values_persist_until_invalidated() {
        let store = Arc::new(MemStore::new());
        store.set_config("scan_interval", "45").await.unwrap();
        let cache = ConfigCache::new(Arc::clone(&store) as Arc<dyn Store>);
        assert_eq!(cache.get_u64(keys::SCAN_INTERVAL).await, 45);

        store.set_config("scan_interval", "90").await.unwrap();
        // Within the TTL the cached value still wins.
        assert_eq!(cache.get_u64(keys::SCAN_INTERVAL).await, 45);

        cache.invalidate();
        assert_eq!(cache.get_u64(keys::SCAN_INTERVAL).await, 90);
    }

    #[tokio::test]
    async fn unparseable_values_fall_back_to_default() {
        let store = Arc::new(MemStore::new());
        store.set_config("items_per_query", "lots").await.unwrap();
        let cache = ConfigCache::new(store);
        assert_eq!(cache.get_u64(keys::ITEMS_PER_QUERY).await, 20);
    }
}
