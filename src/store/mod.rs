//! # Durable Store Contract
//! The pipeline reasons about persistence only through this trait; each
//! operation is individually atomic. The storage engine behind it is a
//! collaborator: a JSON-file store ships for the binary and an in-memory
//! store for tests, and nothing in the pipeline assumes either.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod file;
pub mod mem;

pub use file::FileStore;
pub use mem::MemStore;

/// One upstream search URL of a source, with its own high-water mark.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceUrl {
    pub url: String,
    /// Latest item timestamp already processed for this URL.
    pub last_seen_ts: i64,
}

/// Where a source's alerts go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Sink {
    pub webhook_url: Option<String>,
    pub channel_id: Option<String>,
    pub embed_color: u32,
}

/// A configured polling target. Created by the external admin surface;
/// the pipeline consumes it read-only each cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub urls: Vec<SourceUrl>,
    pub sink: Sink,
    pub active: bool,
}

/// Durable fact: this external id has been delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub external_id: String,
    pub title: String,
    pub price_minor: i64,
    pub currency: String,
    pub source_id: i64,
    pub item_ts: i64,
    pub delivered_at: i64,
}

/// Price history of what is semantically "the same listing", keyed by a
/// content fingerprint rather than the external id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTrack {
    pub fingerprint: String,
    pub first_price: i64,
    pub last_price: i64,
    pub lowest_price: i64,
    pub drops: u32,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: i64,
    pub level: String,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub sources: usize,
    pub active_sources: usize,
    pub deliveries: usize,
    pub price_tracks: usize,
    pub logs: usize,
}

/// Retained log tail; older entries are discarded.
pub(crate) const LOG_CAP: usize = 500;

#[async_trait]
pub trait Store: Send + Sync {
    /// Sources with `active = true`, high-water marks included.
    async fn active_sources(&self) -> Result<Vec<Source>>;

    async fn delivery_exists(&self, external_id: &str) -> Result<bool>;

    /// Idempotent insert: recording an id twice is a no-op, not an error.
    async fn record_delivery(&self, record: DeliveryRecord) -> Result<()>;

    /// Raises the mark monotonically; a lower `ts` never regresses it.
    async fn advance_high_water_mark(&self, source_id: i64, url: &str, ts: i64) -> Result<()>;

    async fn price_track(&self, fingerprint: &str) -> Result<Option<PriceTrack>>;

    async fn upsert_price_track(&self, track: PriceTrack) -> Result<()>;

    async fn get_config(&self, key: &str, default: &str) -> Result<String>;

    async fn set_config(&self, key: &str, value: &str) -> Result<()>;

    async fn append_log(&self, level: &str, source: &str, message: &str) -> Result<()>;

    async fn stats(&self) -> Result<StoreStats>;
}
