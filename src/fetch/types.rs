// src/fetch/types.rs
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Listing price in minor units (cents/grosze), parsed once at the
/// ingestion boundary from whatever shape the upstream sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub amount_minor: i64,
    pub currency: String,
}

impl Price {
    pub fn display(&self) -> String {
        format!(
            "{}.{:02} {}",
            self.amount_minor / 100,
            (self.amount_minor % 100).abs(),
            self.currency
        )
    }
}

/// Seller summary as embedded in the catalog payload; the rating fields
/// are often empty there and get enriched from the seller detail API.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SellerRef {
    pub id: Option<i64>,
    pub login: Option<String>,
    pub country: Option<String>,
    pub feedback_count: u32,
    pub feedback_score: f32,
}

/// Immutable snapshot of a listing at fetch time. Compared by
/// `external_id`; never mutated after parsing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub external_id: String,
    pub title: String,
    pub brand: String,
    pub size: String,
    pub status: String,
    pub price: Price,
    pub url: String,
    /// At most three photo references.
    pub photos: Vec<String>,
    /// Creation timestamp owned by the upstream (unix seconds).
    pub created_at_ts: i64,
    pub hidden: bool,
    pub seller: SellerRef,
}

impl Item {
    /// Whether the listing was created within the last `minutes`.
    pub fn is_within_window(&self, now_ts: i64, minutes: i64) -> bool {
        now_ts.saturating_sub(self.created_at_ts) < minutes * 60
    }
}

/// Seam between the orchestrator fan-out and the HTTP machinery, so the
/// pipeline can be driven by a scripted fetcher in tests.
#[async_trait::async_trait]
pub trait ItemFetcher: Send + Sync {
    async fn fetch(&self, query_url: &str, per_page: u32) -> Result<Vec<Item>>;
}

/// Per-cycle aggregate counts, logged and exported as metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    pub tasks: usize,
    pub fetched: usize,
    pub enqueued: usize,
    pub price_drops: usize,
    pub failures: usize,
}
