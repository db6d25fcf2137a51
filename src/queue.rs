//! # Delivery Queue
//! Bounded in-memory buffer between the fetch orchestrator and the sender.
//! A full queue blocks `send` — that is the backpressure signal; items are
//! never dropped. Depth is tracked for the stats surface and exported as a
//! gauge.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;

use crate::detect::PriceDropEvent;
use crate::fetch::types::Item;
use crate::store::Sink;

/// One unit of outbound work.
#[derive(Debug, Clone)]
pub enum QueueEntry {
    NewItem {
        item: Item,
        source_id: i64,
        source_name: String,
        url: String,
        sink: Sink,
    },
    PriceDrop {
        item: Item,
        event: PriceDropEvent,
        source_id: i64,
        source_name: String,
        sink: Sink,
    },
}

impl QueueEntry {
    pub fn external_id(&self) -> &str {
        match self {
            QueueEntry::NewItem { item, .. } | QueueEntry::PriceDrop { item, .. } => {
                &item.external_id
            }
        }
    }
}

#[derive(Clone)]
pub struct QueueTx {
    tx: mpsc::Sender<QueueEntry>,
    depth: Arc<AtomicUsize>,
}

pub struct QueueRx {
    rx: mpsc::Receiver<QueueEntry>,
    depth: Arc<AtomicUsize>,
}

/// Creates the bounded channel pair. Default capacity in the pipeline is
/// 200 entries.
pub fn bounded(capacity: usize) -> (QueueTx, QueueRx) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueTx {
            tx,
            depth: Arc::clone(&depth),
        },
        QueueRx { rx, depth },
    )
}

impl QueueTx {
    /// Blocks while the queue is full; errors only when the sender side
    /// has shut down.
    pub async fn send(&self, entry: QueueEntry) -> Result<()> {
        self.tx
            .send(entry)
            .await
            .map_err(|_| anyhow!("delivery queue closed"))?;
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("radar_queue_depth").set(depth as f64);
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn depth_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.depth)
    }
}

impl QueueRx {
    pub async fn recv(&mut self) -> Option<QueueEntry> {
        let entry = self.rx.recv().await?;
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("radar_queue_depth").set(depth as f64);
        Some(entry)
    }

    /// Non-blocking variant used by drain-style consumers.
    pub fn try_recv(&mut self) -> Option<QueueEntry> {
        let entry = self.rx.try_recv().ok()?;
        let depth = self.depth.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::gauge!("radar_queue_depth").set(depth as f64);
        Some(entry)
    }
}
