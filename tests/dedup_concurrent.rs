// tests/dedup_concurrent.rs
// Concurrent fetch tasks discovering the same external id must produce
// exactly one queue entry: the in-process guard catches in-flight races,
// the durable re-check catches everything that survived a restart.

use std::sync::Arc;

use listing_radar::detect::{ChangeDetector, Verdict};
use listing_radar::fetch::types::{Price, SellerRef};
use listing_radar::fetch::Item;
use listing_radar::store::{DeliveryRecord, MemStore, Store};

fn item(id: &str, ts: i64) -> Item {
    Item {
        external_id: id.to_string(),
        title: "Jacket".into(),
        brand: "Acme".into(),
        size: "L".into(),
        status: "Good".into(),
        price: Price {
            amount_minor: 7000,
            currency: "PLN".into(),
        },
        url: format!("https://www.example.pl/items/{id}"),
        photos: vec![],
        created_at_ts: ts,
        hidden: false,
        seller: SellerRef::default(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_id_from_many_tasks_is_admitted_once() {
    let now = chrono::Utc::now().timestamp();
    let store = Arc::new(MemStore::new());
    let detector = Arc::new(ChangeDetector::new(store));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let detector = Arc::clone(&detector);
        handles.push(tokio::spawn(async move {
            detector
                .process(&item("same", now - 5), 1, "u", 0, 5, now)
                .await
                .unwrap()
        }));
    }

    let mut fresh = 0;
    let mut duplicates = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Verdict::Fresh => fresh += 1,
            Verdict::InFlightDuplicate => duplicates += 1,
            other => panic!("unexpected verdict {other:?}"),
        }
    }
    assert_eq!(fresh, 1);
    assert_eq!(duplicates, 15);
}

#[tokio::test]
async fn durable_check_survives_a_restart() {
    let now = chrono::Utc::now().timestamp();
    let store = Arc::new(MemStore::new());
    store
        .record_delivery(DeliveryRecord {
            external_id: "known".into(),
            title: "Jacket".into(),
            price_minor: 7000,
            currency: "PLN".into(),
            source_id: 1,
            item_ts: now - 5,
            delivered_at: now - 4,
        })
        .await
        .unwrap();

    // A fresh detector models a restarted process: the ephemeral guard is
    // empty, but the durable record still blocks a second delivery.
    let detector = ChangeDetector::new(Arc::clone(&store) as Arc<dyn Store>);
    let verdict = detector
        .process(&item("known", now - 5), 1, "u", 0, 5, now)
        .await
        .unwrap();
    assert_eq!(verdict, Verdict::AlreadySeen);
}
