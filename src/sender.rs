//! # Sender
//! Drains the delivery queue one entry at a time, paced to respect the
//! sink's own rate limits. Before each send the durable store is checked
//! again — the queue may hold entries enqueued before a crash/restart —
//! and the delivery record is written first thing after a confirmed send.
//! A failed send writes nothing, so the item retries naturally on its
//! next discovery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use metrics::counter;
use tokio::sync::watch;

use crate::notify::{Notification, Notifier};
use crate::queue::{QueueEntry, QueueRx};
use crate::store::{DeliveryRecord, Store};

/// Delay between consecutive sends.
const PACE: Duration = Duration::from_millis(150);

pub struct Sender {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
}

/// What `handle_entry` did, for counters and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    SkippedDuplicate,
    Failed,
}

impl Sender {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// The sender loop: runs until the stop signal flips or the queue
    /// closes. Never returns early on per-entry failures.
    pub async fn run(self, mut rx: QueueRx, mut stop: watch::Receiver<bool>) {
        tracing::info!("sender started");
        loop {
            let entry = tokio::select! {
                entry = rx.recv() => entry,
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                    continue;
                }
            };
            let Some(entry) = entry else {
                break; // queue closed
            };

            match self.handle_entry(entry).await {
                Ok(SendOutcome::Sent) => {}
                Ok(SendOutcome::SkippedDuplicate) => {
                    counter!("radar_duplicates_skipped_total").increment(1);
                }
                Ok(SendOutcome::Failed) | Err(_) => {
                    counter!("radar_errors_total").increment(1);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(PACE) => {}
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("sender stopped");
    }

    /// Processes one queue entry with both idempotency gates applied.
    pub async fn handle_entry(&self, entry: QueueEntry) -> Result<SendOutcome> {
        match entry {
            QueueEntry::NewItem {
                item,
                source_id,
                source_name,
                url,
                sink,
            } => {
                // Second idempotency gate: the durable store may already
                // know this id (enqueued before a restart, or delivered by
                // a racing instance).
                if self.store.delivery_exists(&item.external_id).await? {
                    tracing::debug!(id = %item.external_id, "already delivered, skipping send");
                    self.store
                        .advance_high_water_mark(source_id, &url, item.created_at_ts)
                        .await?;
                    return Ok(SendOutcome::SkippedDuplicate);
                }

                let notification = Notification::NewListing {
                    item: item.clone(),
                    source_name: source_name.clone(),
                    sink,
                };
                if let Err(e) = self.notifier.send(&notification).await {
                    // No record written: the item stays eligible for a
                    // natural retry on the next discovery pass.
                    tracing::warn!(id = %item.external_id, error = %e, "send failed");
                    self.store
                        .append_log("ERROR", "sender", &format!("send failed: {}", item.title))
                        .await
                        .ok();
                    return Ok(SendOutcome::Failed);
                }

                // Record first, bookkeeping after: a crash between the two
                // must never cause a duplicate send.
                self.store
                    .record_delivery(DeliveryRecord {
                        external_id: item.external_id.clone(),
                        title: item.title.clone(),
                        price_minor: item.price.amount_minor,
                        currency: item.price.currency.clone(),
                        source_id,
                        item_ts: item.created_at_ts,
                        delivered_at: chrono::Utc::now().timestamp(),
                    })
                    .await?;
                self.store
                    .advance_high_water_mark(source_id, &url, item.created_at_ts)
                    .await?;
                counter!("radar_items_sent_total").increment(1);
                let hidden_tag = if item.hidden { " [hidden]" } else { "" };
                self.store
                    .append_log(
                        "SUCCESS",
                        "sender",
                        &format!(
                            "{}{} — {} → #{}",
                            item.title,
                            hidden_tag,
                            item.price.display(),
                            source_name
                        ),
                    )
                    .await
                    .ok();
                tracing::info!(id = %item.external_id, title = %item.title, "delivered");
                Ok(SendOutcome::Sent)
            }

            QueueEntry::PriceDrop {
                item,
                event,
                source_name,
                sink,
                ..
            } => {
                // Dedup happened at detection time: the price track was
                // already advanced, so this transition alerts only once.
                let drop_minor = event.drop_minor;
                let notification = Notification::PriceDrop {
                    item: item.clone(),
                    event,
                    source_name: source_name.clone(),
                    sink,
                };
                if let Err(e) = self.notifier.send(&notification).await {
                    tracing::warn!(id = %item.external_id, error = %e, "price-drop send failed");
                    return Ok(SendOutcome::Failed);
                }
                counter!("radar_price_drops_total").increment(1);
                self.store
                    .append_log(
                        "SUCCESS",
                        "sender",
                        &format!(
                            "price drop −{}.{:02} {} on {} → #{}",
                            drop_minor / 100,
                            (drop_minor % 100).abs(),
                            item.price.currency,
                            item.title,
                            source_name
                        ),
                    )
                    .await
                    .ok();
                Ok(SendOutcome::Sent)
            }
        }
    }
}
