//! In-memory store. Primarily for tests; also usable as a throwaway
//! backend when persistence across restarts is not wanted.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use super::{
    DeliveryRecord, LogEntry, PriceTrack, Source, Store, StoreStats, LOG_CAP,
};

#[derive(Default)]
struct State {
    sources: Vec<Source>,
    deliveries: HashMap<String, DeliveryRecord>,
    price_tracks: HashMap<String, PriceTrack>,
    config: HashMap<String, String>,
    logs: VecDeque<LogEntry>,
}

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sources(sources: Vec<Source>) -> Self {
        let store = Self::new();
        store
            .state
            .lock()
            .expect("store mutex poisoned")
            .sources = sources;
        store
    }

    /// Replace the configured sources (what the admin surface would do).
    pub fn set_sources(&self, sources: Vec<Source>) {
        self.state.lock().expect("store mutex poisoned").sources = sources;
    }

    /// Current high-water mark of `(source_id, url)`, for assertions.
    pub fn high_water_mark(&self, source_id: i64, url: &str) -> i64 {
        let state = self.state.lock().expect("store mutex poisoned");
        state
            .sources
            .iter()
            .filter(|s| s.id == source_id)
            .flat_map(|s| s.urls.iter())
            .find(|u| u.url == url)
            .map(|u| u.last_seen_ts)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemStore {
    async fn active_sources(&self) -> Result<Vec<Source>> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state.sources.iter().filter(|s| s.active).cloned().collect())
    }

    async fn delivery_exists(&self, external_id: &str) -> Result<bool> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state.deliveries.contains_key(external_id))
    }

    async fn record_delivery(&self, record: DeliveryRecord) -> Result<()> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state
            .deliveries
            .entry(record.external_id.clone())
            .or_insert(record);
        Ok(())
    }

    async fn advance_high_water_mark(&self, source_id: i64, url: &str, ts: i64) -> Result<()> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        for source in state.sources.iter_mut().filter(|s| s.id == source_id) {
            for u in source.urls.iter_mut().filter(|u| u.url == url) {
                u.last_seen_ts = u.last_seen_ts.max(ts);
            }
        }
        Ok(())
    }

    async fn price_track(&self, fingerprint: &str) -> Result<Option<PriceTrack>> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state.price_tracks.get(fingerprint).cloned())
    }

    async fn upsert_price_track(&self, track: PriceTrack) -> Result<()> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.price_tracks.insert(track.fingerprint.clone(), track);
        Ok(())
    }

    async fn get_config(&self, key: &str, default: &str) -> Result<String> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(state
            .config
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string()))
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.config.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn append_log(&self, level: &str, source: &str, message: &str) -> Result<()> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        state.logs.push_back(LogEntry {
            ts: chrono::Utc::now().timestamp(),
            level: level.to_string(),
            source: source.to_string(),
            message: message.to_string(),
        });
        while state.logs.len() > LOG_CAP {
            state.logs.pop_front();
        }
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let state = self.state.lock().expect("store mutex poisoned");
        Ok(StoreStats {
            sources: state.sources.len(),
            active_sources: state.sources.iter().filter(|s| s.active).count(),
            deliveries: state.deliveries.len(),
            price_tracks: state.price_tracks.len(),
            logs: state.logs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> DeliveryRecord {
        DeliveryRecord {
            external_id: id.to_string(),
            title: "cap".into(),
            price_minor: 1500,
            currency: "PLN".into(),
            source_id: 1,
            item_ts: 100,
            delivered_at: 200,
        }
    }

    #[tokio::test]
    async fn delivery_insert_is_idempotent() {
        let store = MemStore::new();
        store.record_delivery(record("a1")).await.unwrap();
        store.record_delivery(record("a1")).await.unwrap();
        assert!(store.delivery_exists("a1").await.unwrap());
        assert_eq!(store.stats().await.unwrap().deliveries, 1);
    }

    #[tokio::test]
    async fn high_water_mark_is_monotonic() {
        let store = MemStore::with_sources(vec![Source {
            id: 7,
            name: "caps".into(),
            urls: vec![super::super::SourceUrl {
                url: "https://www.example.pl/catalog?search_text=cap".into(),
                last_seen_ts: 0,
            }],
            sink: Default::default(),
            active: true,
        }]);
        let url = "https://www.example.pl/catalog?search_text=cap";
        store.advance_high_water_mark(7, url, 100).await.unwrap();
        assert_eq!(store.high_water_mark(7, url), 100);
        store.advance_high_water_mark(7, url, 50).await.unwrap();
        assert_eq!(store.high_water_mark(7, url), 100);
    }

    #[tokio::test]
    async fn log_tail_is_bounded() {
        let store = MemStore::new();
        for i in 0..(LOG_CAP + 40) {
            store.append_log("INFO", "test", &format!("line {i}")).await.unwrap();
        }
        assert_eq!(store.stats().await.unwrap().logs, LOG_CAP);
    }
}
