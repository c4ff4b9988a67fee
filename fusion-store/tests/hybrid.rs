use std::sync::Arc;

use fusion_core::{Relay, RelayStatus};
use fusion_store::{HybridStore, RelayStore};
use fusion_test::{FaultyStore, MemoryStore};

fn relay(id: &str) -> Relay {
    Relay::new(
        id, "ethereum", "osmosis-1", "0xh1", "alice", "bob", "250", "uatom", "cafe",
        2_000_000_000,
        vec![],
    )
}

#[tokio::test]
async fn read_through_populates_cache() {
    let truth = Arc::new(MemoryStore::default());
    let cache = Arc::new(MemoryStore::default());
    truth.save_relay(&relay("r1")).await.unwrap();

    let hybrid = HybridStore::new(truth, Arc::clone(&cache) as Arc<dyn RelayStore>);
    // First read misses the cache and falls through.
    let found = hybrid.get_relay("r1").await.unwrap().unwrap();
    assert_eq!(found.id, "r1");
    // The miss populated the cache.
    assert!(cache.get_relay("r1").await.unwrap().is_some());

    let stats = hybrid.stats().await.unwrap();
    let relay_rate = stats.cache["relay"];
    assert_eq!((relay_rate.hits, relay_rate.misses), (0, 1));

    // Second read is a hit.
    hybrid.get_relay("r1").await.unwrap().unwrap();
    let stats = hybrid.stats().await.unwrap();
    assert_eq!(stats.cache["relay"].hits, 1);
}

#[tokio::test]
async fn cache_write_failure_still_writes_truth() {
    let truth = Arc::new(MemoryStore::default());
    let cache = Arc::new(FaultyStore::new(MemoryStore::default()));
    cache.fail_writes(true);

    let hybrid = HybridStore::new(
        Arc::clone(&truth) as Arc<dyn RelayStore>,
        Arc::clone(&cache) as Arc<dyn RelayStore>,
    );
    hybrid.save_relay(&relay("r2")).await.unwrap();
    assert!(truth.get_relay("r2").await.unwrap().is_some());
}

#[tokio::test]
async fn transaction_reconciles_cache_after_commit() {
    let truth = Arc::new(MemoryStore::default());
    let cache = Arc::new(MemoryStore::default());
    let hybrid = HybridStore::new(
        Arc::clone(&truth) as Arc<dyn RelayStore>,
        Arc::clone(&cache) as Arc<dyn RelayStore>,
    );

    let mut txn = hybrid.begin_transaction().await.unwrap();
    txn.save_relay(&relay("r3")).await.unwrap();
    txn.commit().await.unwrap();

    assert!(truth.get_relay("r3").await.unwrap().is_some());
    assert!(cache.get_relay("r3").await.unwrap().is_some());
}

#[tokio::test]
async fn rollback_reaches_neither_side() {
    let truth = Arc::new(MemoryStore::default());
    let cache = Arc::new(MemoryStore::default());
    let hybrid = HybridStore::new(
        Arc::clone(&truth) as Arc<dyn RelayStore>,
        Arc::clone(&cache) as Arc<dyn RelayStore>,
    );

    let mut txn = hybrid.begin_transaction().await.unwrap();
    txn.save_relay(&relay("r4")).await.unwrap();
    txn.rollback().await.unwrap();

    assert!(truth.get_relay("r4").await.unwrap().is_none());
    assert!(cache.get_relay("r4").await.unwrap().is_none());
}

#[tokio::test]
async fn range_queries_skip_the_cache() {
    let truth = Arc::new(MemoryStore::default());
    let cache = Arc::new(MemoryStore::default());
    let mut snapshot = fusion_core::MetricsSnapshot::empty();
    snapshot.timestamp = 1_000;
    truth.save_snapshot(&snapshot).await.unwrap();

    let hybrid = HybridStore::new(truth, cache);
    let found = hybrid.snapshots_in_range(0, 2_000).await.unwrap();
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn terminal_status_round_trips_through_save() {
    let truth = Arc::new(MemoryStore::default());
    let cache = Arc::new(MemoryStore::default());
    let hybrid = HybridStore::new(truth, cache);

    let mut record = relay("r5");
    hybrid.save_relay(&record).await.unwrap();
    record.status = RelayStatus::Routing;
    hybrid.save_relay(&record).await.unwrap();
    let found = hybrid.get_relay("r5").await.unwrap().unwrap();
    assert_eq!(found.status, RelayStatus::Routing);
    assert!(found.updated_at >= found.created_at);
}
