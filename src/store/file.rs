//! JSON-file store. Pipeline state (deliveries, price tracks, high-water
//! marks, runtime config overrides, the log tail) lives in one JSON file
//! rewritten on every mutation; source definitions come from a TOML file
//! owned by the admin surface and are re-read on each `active_sources`.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;

use super::{
    DeliveryRecord, LogEntry, PriceTrack, Sink, Source, SourceUrl, Store, StoreStats, LOG_CAP,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistState {
    /// `(source id, url)` → latest processed item timestamp.
    #[serde(default)]
    high_water: HashMap<String, i64>,
    #[serde(default)]
    deliveries: HashMap<String, DeliveryRecord>,
    #[serde(default)]
    price_tracks: HashMap<String, PriceTrack>,
    #[serde(default)]
    config: HashMap<String, String>,
    #[serde(default)]
    logs: VecDeque<LogEntry>,
}

#[derive(Debug, Deserialize)]
struct SourcesFile {
    #[serde(default)]
    sources: Vec<SourceDef>,
}

#[derive(Debug, Deserialize)]
struct SourceDef {
    id: i64,
    name: String,
    urls: Vec<String>,
    #[serde(default)]
    webhook_url: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    embed_color: Option<String>,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

/// Accepts `"5763719"`, `"57F287"` or `"#57F287"`; falls back to green.
fn parse_color(raw: &str) -> u32 {
    let raw = raw.trim();
    if let Ok(n) = raw.parse::<u32>() {
        return n;
    }
    u32::from_str_radix(raw.trim_start_matches('#'), 16).unwrap_or(0x57F287)
}

fn hwm_key(source_id: i64, url: &str) -> String {
    format!("{source_id}\n{url}")
}

pub struct FileStore {
    state_path: PathBuf,
    sources_path: PathBuf,
    state: Mutex<PersistState>,
}

impl FileStore {
    /// Loads existing state from `state_path` if present; a missing or
    /// unreadable file starts empty (first run).
    pub async fn open(state_path: &Path, sources_path: &Path) -> Result<Self> {
        let state = match fs::read_to_string(state_path).await {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, path = %state_path.display(), "state file unreadable, starting empty");
                PersistState::default()
            }),
            Err(_) => PersistState::default(),
        };
        Ok(Self {
            state_path: state_path.to_path_buf(),
            sources_path: sources_path.to_path_buf(),
            state: Mutex::new(state),
        })
    }

    async fn flush(&self, state: &PersistState) -> Result<()> {
        if let Some(dir) = self.state_path.parent() {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }
        let raw = serde_json::to_vec_pretty(state).context("serializing state")?;
        fs::write(&self.state_path, raw)
            .await
            .with_context(|| format!("writing {}", self.state_path.display()))?;
        Ok(())
    }

    async fn read_source_defs(&self) -> Result<Vec<SourceDef>> {
        let raw = match fs::read_to_string(&self.sources_path).await {
            Ok(raw) => raw,
            Err(_) => return Ok(Vec::new()),
        };
        let parsed: SourcesFile = toml::from_str(&raw)
            .with_context(|| format!("parsing {}", self.sources_path.display()))?;
        Ok(parsed.sources)
    }
}

#[async_trait]
impl Store for FileStore {
    async fn active_sources(&self) -> Result<Vec<Source>> {
        let defs = self.read_source_defs().await?;
        let state = self.state.lock().await;
        let sources = defs
            .into_iter()
            .filter(|d| d.active)
            .map(|d| Source {
                urls: d
                    .urls
                    .iter()
                    .map(|u| SourceUrl {
                        last_seen_ts: state
                            .high_water
                            .get(&hwm_key(d.id, u))
                            .copied()
                            .unwrap_or(0),
                        url: u.clone(),
                    })
                    .collect(),
                sink: Sink {
                    webhook_url: d.webhook_url,
                    channel_id: d.channel_id,
                    embed_color: d
                        .embed_color
                        .as_deref()
                        .map(parse_color)
                        .unwrap_or(0x57F287),
                },
                id: d.id,
                name: d.name,
                active: true,
            })
            .collect();
        Ok(sources)
    }

    async fn delivery_exists(&self, external_id: &str) -> Result<bool> {
        let state = self.state.lock().await;
        Ok(state.deliveries.contains_key(external_id))
    }

    async fn record_delivery(&self, record: DeliveryRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.deliveries.contains_key(&record.external_id) {
            return Ok(());
        }
        state
            .deliveries
            .insert(record.external_id.clone(), record);
        self.flush(&state).await
    }

    async fn advance_high_water_mark(&self, source_id: i64, url: &str, ts: i64) -> Result<()> {
        let mut state = self.state.lock().await;
        let key = hwm_key(source_id, url);
        let current = state.high_water.get(&key).copied().unwrap_or(0);
        if ts <= current {
            return Ok(());
        }
        state.high_water.insert(key, ts);
        self.flush(&state).await
    }

    async fn price_track(&self, fingerprint: &str) -> Result<Option<PriceTrack>> {
        let state = self.state.lock().await;
        Ok(state.price_tracks.get(fingerprint).cloned())
    }

    async fn upsert_price_track(&self, track: PriceTrack) -> Result<()> {
        let mut state = self.state.lock().await;
        state.price_tracks.insert(track.fingerprint.clone(), track);
        self.flush(&state).await
    }

    async fn get_config(&self, key: &str, default: &str) -> Result<String> {
        let state = self.state.lock().await;
        Ok(state
            .config
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string()))
    }

    async fn set_config(&self, key: &str, value: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.config.insert(key.to_string(), value.to_string());
        self.flush(&state).await
    }

    async fn append_log(&self, level: &str, source: &str, message: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.logs.push_back(LogEntry {
            ts: chrono::Utc::now().timestamp(),
            level: level.to_string(),
            source: source.to_string(),
            message: message.to_string(),
        });
        while state.logs.len() > LOG_CAP {
            state.logs.pop_front();
        }
        self.flush(&state).await
    }

    async fn stats(&self) -> Result<StoreStats> {
        let defs = self.read_source_defs().await.unwrap_or_default();
        let state = self.state.lock().await;
        Ok(StoreStats {
            sources: defs.len(),
            active_sources: defs.iter().filter(|d| d.active).count(),
            deliveries: state.deliveries.len(),
            price_tracks: state.price_tracks.len(),
            logs: state.logs.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCES_TOML: &str = r##"
[[sources]]
id = 1
name = "nike caps"
urls = ["https://www.example.pl/catalog?search_text=nike+cap"]
webhook_url = "https://discord.example/webhook"
embed_color = "#3498DB"

[[sources]]
id = 2
name = "paused"
urls = ["https://www.example.pl/catalog?search_text=x"]
active = false
"##;

    async fn fixture() -> (tempfile::TempDir, FileStore) {
        let dir = tempfile::tempdir().unwrap();
        let sources = dir.path().join("sources.toml");
        tokio::fs::write(&sources, SOURCES_TOML).await.unwrap();
        let store = FileStore::open(&dir.path().join("state.json"), &sources)
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn reads_active_sources_with_high_water_overlay() {
        let (_dir, store) = fixture().await;
        let url = "https://www.example.pl/catalog?search_text=nike+cap";
        store.advance_high_water_mark(1, url, 123).await.unwrap();

        let sources = store.active_sources().await.unwrap();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].urls[0].last_seen_ts, 123);
        assert_eq!(sources[0].sink.embed_color, 0x3498DB);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let state_path = dir.path().join("state.json");
        let sources_path = dir.path().join("sources.toml");
        tokio::fs::write(&sources_path, SOURCES_TOML).await.unwrap();

        {
            let store = FileStore::open(&state_path, &sources_path).await.unwrap();
            store
                .record_delivery(DeliveryRecord {
                    external_id: "z9".into(),
                    title: "cap".into(),
                    price_minor: 900,
                    currency: "PLN".into(),
                    source_id: 1,
                    item_ts: 10,
                    delivered_at: 20,
                })
                .await
                .unwrap();
        }

        let reopened = FileStore::open(&state_path, &sources_path).await.unwrap();
        assert!(reopened.delivery_exists("z9").await.unwrap());
    }

    #[test]
    fn color_parsing_accepts_decimal_and_hex() {
        assert_eq!(parse_color("5763719"), 5_763_719);
        assert_eq!(parse_color("57F287"), 0x57F287);
        assert_eq!(parse_color("#E74C3C"), 0xE74C3C);
        assert_eq!(parse_color("not-a-color"), 0x57F287);
    }
}
