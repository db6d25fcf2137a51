//! # Seller Rating Cache
//! TTL-bounded enrichment cache keyed by seller id. The catalog payload
//! usually ships empty rating fields; the seller detail API fills them in.
//! Lookup failures are never fatal — the listing just keeps its default
//! "no ratings" state.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::time::Instant;

use crate::session::SessionManager;

#[derive(Debug, Clone, PartialEq)]
pub struct SellerRating {
    pub feedback_count: u32,
    /// Normalized to a 0–5 scale regardless of the upstream raw scale.
    pub score: f32,
    pub country: String,
}

/// Upstream reputation comes on three different scales; fold them all
/// onto 0–5: fractions (≤1) scale up, percent-like values (>5) scale down.
pub fn normalize_score(raw: f32) -> f32 {
    if raw > 0.0 && raw <= 1.0 {
        raw * 5.0
    } else if raw > 5.0 {
        raw / 20.0
    } else {
        raw
    }
}

struct CacheEntry {
    rating: SellerRating,
    expires_at: Instant,
}

pub struct RatingCache {
    inner: Mutex<HashMap<i64, CacheEntry>>,
    ttl: Duration,
    cap: usize,
}

impl RatingCache {
    pub fn new(ttl: Duration, cap: usize) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            ttl,
            cap: cap.max(1),
        }
    }

    /// Default sizing: 1h TTL, 500 sellers.
    pub fn with_defaults() -> Self {
        Self::new(Duration::from_secs(3600), 500)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("rating cache mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cached(&self, seller_id: i64) -> Option<SellerRating> {
        let map = self.inner.lock().expect("rating cache mutex poisoned");
        map.get(&seller_id).and_then(|e| {
            if Instant::now() < e.expires_at {
                Some(e.rating.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, seller_id: i64, rating: SellerRating) {
        let mut map = self.inner.lock().expect("rating cache mutex poisoned");
        map.insert(
            seller_id,
            CacheEntry {
                rating,
                expires_at: Instant::now() + self.ttl,
            },
        );
        if map.len() > self.cap {
            // Evict the fifth of entries closest to expiry.
            let mut by_expiry: Vec<(i64, Instant)> =
                map.iter().map(|(k, e)| (*k, e.expires_at)).collect();
            by_expiry.sort_by_key(|(_, exp)| *exp);
            for (key, _) in by_expiry.into_iter().take(self.cap / 5) {
                map.remove(&key);
            }
        }
    }

    /// Cache-through lookup via the seller detail API. Errors degrade to
    /// `None` and are logged at debug level only.
    pub async fn get_or_fetch(
        &self,
        seller_id: i64,
        session: &SessionManager,
    ) -> Option<SellerRating> {
        if let Some(hit) = self.cached(seller_id) {
            return Some(hit);
        }
        match fetch_rating(seller_id, session).await {
            Ok(rating) => {
                self.insert(seller_id, rating.clone());
                Some(rating)
            }
            Err(e) => {
                tracing::debug!(seller_id, error = %e, "seller rating lookup failed");
                None
            }
        }
    }
}

async fn fetch_rating(seller_id: i64, session: &SessionManager) -> Result<SellerRating> {
    let url = format!("https://{}/api/v2/users/{seller_id}", session.host());
    let response = session.get(&url, &[]).await?;
    let status = response.status();
    anyhow::ensure!(status.is_success(), "seller api returned {status}");
    let body: Value = response.json().await.context("decoding seller payload")?;
    let user = body.get("user").cloned().unwrap_or(Value::Null);

    let feedback_count = user
        .get("feedback_count")
        .or_else(|| user.get("positive_feedback_count"))
        .and_then(Value::as_u64)
        .unwrap_or(0) as u32;
    let raw_score = user
        .get("feedback_reputation")
        .or_else(|| user.get("reputation"))
        .and_then(Value::as_f64)
        .unwrap_or(0.0) as f32;
    let country = user
        .get("country_iso_code")
        .or_else(|| user.get("country_code"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            user.get("city")
                .and_then(|c| c.get("country_iso_code"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default()
        .to_uppercase();

    Ok(SellerRating {
        feedback_count,
        score: normalize_score(raw_score),
        country,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_normalization_covers_all_three_scales() {
        assert!((normalize_score(0.9) - 4.5).abs() < 1e-6);
        assert!((normalize_score(96.0) - 4.8).abs() < 1e-6);
        assert!((normalize_score(4.2) - 4.2).abs() < 1e-6);
        assert_eq!(normalize_score(0.0), 0.0);
    }

    #[test]
    fn cache_evicts_oldest_when_over_capacity() {
        let cache = RatingCache::new(Duration::from_secs(3600), 10);
        for id in 0..14 {
            cache.insert(
                id,
                SellerRating {
                    feedback_count: 1,
                    score: 5.0,
                    country: "PL".into(),
                },
            );
        }
        assert!(cache.len() <= 12, "eviction batch should have run");
    }

    #[tokio::test(start_paused = true)]
    async fn cache_entries_expire_after_ttl() {
        let cache = RatingCache::new(Duration::from_secs(60), 10);
        cache.insert(
            1,
            SellerRating {
                feedback_count: 3,
                score: 4.0,
                country: "PL".into(),
            },
        );
        assert!(cache.cached(1).is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(cache.cached(1).is_none());
    }
}
