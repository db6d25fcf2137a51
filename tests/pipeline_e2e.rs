// tests/pipeline_e2e.rs
// End-to-end over the in-process pipeline: scripted fetcher → change
// detector → delivery queue → sender → in-memory store.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use listing_radar::detect::ChangeDetector;
use listing_radar::fetch::types::{Price, SellerRef};
use listing_radar::fetch::{self, Item, ItemFetcher, ScrapeDeps};
use listing_radar::notify::{Notification, Notifier};
use listing_radar::queue;
use listing_radar::sender::Sender;
use listing_radar::store::{MemStore, Sink, Source, SourceUrl, Store};

const URL: &str = "https://www.example.pl/catalog?search_text=cap";

struct ScriptedFetcher {
    items: Vec<Item>,
}

#[async_trait]
impl ItemFetcher for ScriptedFetcher {
    async fn fetch(&self, _query_url: &str, _per_page: u32) -> Result<Vec<Item>> {
        Ok(self.items.clone())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push(notification.item().external_id.clone());
        Ok(())
    }
}

fn item(id: &str, ts: i64) -> Item {
    Item {
        external_id: id.to_string(),
        title: format!("Cap {id}"),
        brand: "Acme".into(),
        size: "M".into(),
        status: "Good".into(),
        price: Price {
            amount_minor: 2500,
            currency: "PLN".into(),
        },
        url: format!("https://www.example.pl/items/{id}"),
        photos: vec![],
        created_at_ts: ts,
        hidden: false,
        seller: SellerRef::default(),
    }
}

fn source() -> Source {
    Source {
        id: 1,
        name: "caps".into(),
        urls: vec![SourceUrl {
            url: URL.into(),
            last_seen_ts: 0,
        }],
        sink: Sink {
            webhook_url: Some("https://discord.example/hook".into()),
            channel_id: None,
            embed_color: 0x57F287,
        },
        active: true,
    }
}

async fn drain(sender: &Sender, rx: &mut queue::QueueRx) -> usize {
    let mut handled = 0;
    while let Some(entry) = rx.try_recv() {
        sender.handle_entry(entry).await.unwrap();
        handled += 1;
    }
    handled
}

#[tokio::test]
async fn first_cycle_delivers_rerun_is_quiet() {
    let now = chrono::Utc::now().timestamp();
    let ts_newer = now - 10;
    let ts_older = now - 40;

    let store = Arc::new(MemStore::with_sources(vec![source()]));
    let notifier = Arc::new(RecordingNotifier::default());
    let detector = Arc::new(ChangeDetector::new(Arc::clone(&store) as Arc<dyn Store>));
    let (tx, mut rx) = queue::bounded(16);

    // Upstream answers newest-first.
    let fetcher = Arc::new(ScriptedFetcher {
        items: vec![item("A", ts_newer), item("B", ts_older)],
    });
    let deps = ScrapeDeps {
        fetcher: Arc::clone(&fetcher) as Arc<dyn ItemFetcher>,
        detector,
        queue: tx.clone(),
    };
    let sender = Sender::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    );

    // Cycle 1: both items are inside the freshness window and above the
    // zero high-water mark.
    let sources = store.active_sources().await.unwrap();
    let outcome = fetch::scrape_all(&deps, &sources, 20, 5).await;
    assert_eq!(outcome.enqueued, 2);
    assert_eq!(drain(&sender, &mut rx).await, 2);

    // Oldest first through the queue, so the mark lands on the newest.
    assert_eq!(*notifier.sent.lock().unwrap(), vec!["B".to_string(), "A".to_string()]);
    assert_eq!(store.high_water_mark(1, URL), ts_newer);

    // Cycle 2: identical upstream response. Both ids are already
    // delivered; nothing is enqueued and the mark does not move.
    let sources = store.active_sources().await.unwrap();
    let outcome = fetch::scrape_all(&deps, &sources, 20, 5).await;
    assert_eq!(outcome.enqueued, 0);
    assert_eq!(outcome.price_drops, 0);
    assert_eq!(drain(&sender, &mut rx).await, 0);
    assert_eq!(notifier.sent.lock().unwrap().len(), 2);
    assert_eq!(store.high_water_mark(1, URL), ts_newer);
}

#[tokio::test]
async fn relisted_item_with_lower_price_raises_one_drop_alert() {
    let now = chrono::Utc::now().timestamp();
    let store = Arc::new(MemStore::with_sources(vec![source()]));
    let notifier = Arc::new(RecordingNotifier::default());
    let detector = Arc::new(ChangeDetector::new(Arc::clone(&store) as Arc<dyn Store>));
    let (tx, mut rx) = queue::bounded(16);
    let sender = Sender::new(
        Arc::clone(&store) as Arc<dyn Store>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    );

    let mut first = item("X", now - 10);
    first.price.amount_minor = 10_000;
    let deps = ScrapeDeps {
        fetcher: Arc::new(ScriptedFetcher {
            items: vec![first.clone()],
        }),
        detector: Arc::clone(&detector),
        queue: tx.clone(),
    };
    let sources = store.active_sources().await.unwrap();
    fetch::scrape_all(&deps, &sources, 20, 5).await;
    drain(&sender, &mut rx).await;
    assert!(store.delivery_exists("X").await.unwrap());

    // Same id re-observed: first pass seeds the track, second (cheaper)
    // raises exactly one drop, a later higher price stays quiet.
    for (price, expected_drops) in [(10_000, 0), (8_000, 1), (9_000, 1)] {
        let mut seen_again = first.clone();
        seen_again.price.amount_minor = price;
        let deps = ScrapeDeps {
            fetcher: Arc::new(ScriptedFetcher {
                items: vec![seen_again],
            }),
            detector: Arc::clone(&detector),
            queue: tx.clone(),
        };
        let sources = store.active_sources().await.unwrap();
        let outcome = fetch::scrape_all(&deps, &sources, 20, 5).await;
        assert_eq!(outcome.enqueued, 0);
        drain(&sender, &mut rx).await;
        let drops = notifier.sent.lock().unwrap().len() - 1;
        assert_eq!(drops, expected_drops, "at observed price {price}");
    }
}
