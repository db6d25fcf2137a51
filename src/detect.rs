//! # Change Detection
//! The dedup + price-drop decision logic. Given one fetched item and the
//! durable store, decides whether it is new, already known, or a price
//! reduction of something already seen. Price history keys on a content
//! fingerprint of (title, brand, size) rather than the external id, so a
//! relisted item with a fresh id still maps onto its own track.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::fetch::types::Item;
use crate::store::{PriceTrack, Store};

/// Bounded recency set. Two near-simultaneous fetch tasks can discover the
/// same external id before either delivery hits the durable store; this
/// in-process set closes that window. Entries are inserted optimistically
/// at queuing time and evicted oldest-first.
#[derive(Debug)]
pub struct RecentIds {
    inner: Mutex<(VecDeque<String>, HashSet<String>)>,
    cap: usize,
}

impl RecentIds {
    pub fn new(cap: usize) -> Self {
        Self {
            inner: Mutex::new((VecDeque::new(), HashSet::new())),
            cap: cap.max(1),
        }
    }

    /// Returns `true` when `id` was newly inserted, `false` when it was
    /// already present (a duplicate in flight).
    pub fn insert(&self, id: &str) -> bool {
        let mut guard = self.inner.lock().expect("recent ids mutex poisoned");
        let (order, set) = &mut *guard;
        if !set.insert(id.to_string()) {
            return false;
        }
        order.push_back(id.to_string());
        while order.len() > self.cap {
            if let Some(oldest) = order.pop_front() {
                set.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        let guard = self.inner.lock().expect("recent ids mutex poisoned");
        guard.1.contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("recent ids mutex poisoned").1.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collapse whitespace and lowercase, so cosmetic retitling doesn't break
/// the correlation.
fn normalize_part(s: &str) -> String {
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").expect("static regex"));
    re_ws.replace_all(s.trim(), " ").to_lowercase()
}

/// Content fingerprint correlating repeated observations of "the same"
/// listing across different external ids.
pub fn fingerprint(title: &str, brand: &str, size: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [title, brand, size] {
        hasher.update(normalize_part(part).as_bytes());
        hasher.update(b"|");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Outcome of a price observation against the durable track.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceDropEvent {
    pub fingerprint: String,
    pub previous_minor: i64,
    pub current_minor: i64,
    /// `previous - current`, always positive.
    pub drop_minor: i64,
    pub drops_so_far: u32,
}

/// What the pipeline should do with one observed item.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Outside the freshness window or below the high-water mark.
    Stale,
    /// Already delivered; nothing further to say this time.
    AlreadySeen,
    /// Already delivered and observed strictly cheaper than last time.
    PriceDrop(PriceDropEvent),
    /// First sighting — candidate for delivery.
    Fresh,
    /// First sighting, but another in-flight task queued it already.
    InFlightDuplicate,
}

pub struct ChangeDetector {
    store: Arc<dyn Store>,
    guard: RecentIds,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            guard: RecentIds::new(500),
        }
    }

    /// Classifies one item observed for `(source_id, url)`.
    ///
    /// Ordering matters: the freshness-window check runs first; delivered
    /// ids then go through the price track (advancing the high-water mark
    /// either way, so re-observed old items stop passing the filter); only
    /// then is the high-water mark applied to first-time candidates, and
    /// last the in-process guard reserves the id at queuing time.
    pub async fn process(
        &self,
        item: &Item,
        source_id: i64,
        url: &str,
        last_seen_ts: i64,
        fresh_window_min: i64,
        now_ts: i64,
    ) -> Result<Verdict> {
        if !item.is_within_window(now_ts, fresh_window_min) {
            return Ok(Verdict::Stale);
        }

        if self.store.delivery_exists(&item.external_id).await? {
            let verdict = self.observe_price(item, now_ts).await?;
            self.store
                .advance_high_water_mark(source_id, url, item.created_at_ts)
                .await?;
            return Ok(verdict);
        }

        if last_seen_ts > 0 && item.created_at_ts <= last_seen_ts {
            return Ok(Verdict::Stale);
        }

        if !self.guard.insert(&item.external_id) {
            return Ok(Verdict::InFlightDuplicate);
        }
        Ok(Verdict::Fresh)
    }

    /// Price bookkeeping for an id that already has a delivery record.
    /// Seeds a missing track silently; alerts only on a strict decrease.
    async fn observe_price(&self, item: &Item, now_ts: i64) -> Result<Verdict> {
        let fp = fingerprint(&item.title, &item.brand, &item.size);
        let current = item.price.amount_minor;

        let Some(track) = self.store.price_track(&fp).await? else {
            self.store
                .upsert_price_track(PriceTrack {
                    fingerprint: fp,
                    first_price: current,
                    last_price: current,
                    lowest_price: current,
                    drops: 0,
                    updated_at: now_ts,
                })
                .await?;
            metrics::counter!("radar_price_tracks_seeded_total").increment(1);
            return Ok(Verdict::AlreadySeen);
        };

        if current < track.last_price {
            let event = PriceDropEvent {
                fingerprint: fp.clone(),
                previous_minor: track.last_price,
                current_minor: current,
                drop_minor: track.last_price - current,
                drops_so_far: track.drops + 1,
            };
            self.store
                .upsert_price_track(PriceTrack {
                    fingerprint: fp,
                    first_price: track.first_price,
                    last_price: current,
                    lowest_price: track.lowest_price.min(current),
                    drops: track.drops + 1,
                    updated_at: now_ts,
                })
                .await?;
            return Ok(Verdict::PriceDrop(event));
        }

        if current != track.last_price {
            self.store
                .upsert_price_track(PriceTrack {
                    last_price: current,
                    updated_at: now_ts,
                    ..track
                })
                .await?;
        }
        Ok(Verdict::AlreadySeen)
    }
}
