//! Hybrid provider: Postgres truth with a Redis read-through cache.
//!
//! Writes land on truth first; a failed cache write never fails the
//! operation, it is re-synced in the background instead. Reads go cache
//! first and fall through to truth, repopulating the cache on a miss.
//! Transactions execute against truth and the cache is reconciled after
//! commit.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use fusion_core::{
    ChainState, CircuitBreakerState, MetricsSnapshot, Relay, RelayAttempt, StoreResult,
};

use crate::{
    CacheCounters, CleanupReport, EntityClass, RelayFilter, RelayStore, RetentionPolicy,
    StoreStats, StoreTransaction,
};

const CACHE_RESYNC_ATTEMPTS: u32 = 3;
const CACHE_RESYNC_DELAY: Duration = Duration::from_millis(500);

/// Truth + cache composition. Both sides are held behind the shared store
/// contract; the hybrid only encodes routing policy.
pub struct HybridStore {
    truth: Arc<dyn RelayStore>,
    cache: Arc<dyn RelayStore>,
    counters: Arc<CacheCounters>,
}

impl std::fmt::Debug for HybridStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridStore").finish_non_exhaustive()
    }
}

impl HybridStore {
    /// Compose a hybrid store from its two sides.
    pub fn new(truth: Arc<dyn RelayStore>, cache: Arc<dyn RelayStore>) -> Self {
        Self {
            truth,
            cache,
            counters: Arc::new(CacheCounters::default()),
        }
    }

    /// Re-run a failed cache write off the hot path until it sticks or the
    /// budget runs out. Truth already holds the value, so the worst case is
    /// a stale cache entry that the next read-through repairs.
    fn resync_relay(&self, relay: Relay) {
        let cache = Arc::clone(&self.cache);
        tokio::spawn(async move {
            for attempt in 1..=CACHE_RESYNC_ATTEMPTS {
                tokio::time::sleep(CACHE_RESYNC_DELAY * attempt).await;
                match cache.save_relay(&relay).await {
                    Ok(()) => {
                        debug!(relay_id = %relay.id, attempt, "cache re-sync succeeded");
                        return;
                    }
                    Err(err) => {
                        warn!(relay_id = %relay.id, attempt, %err, "cache re-sync failed");
                    }
                }
            }
        });
    }
}

#[async_trait]
impl RelayStore for HybridStore {
    async fn save_relay(&self, relay: &Relay) -> StoreResult<()> {
        self.truth.save_relay(relay).await?;
        if let Err(err) = self.cache.save_relay(relay).await {
            warn!(relay_id = %relay.id, %err, "cache write failed; truth holds the value");
            self.resync_relay(relay.clone());
        }
        Ok(())
    }

    async fn get_relay(&self, id: &str) -> StoreResult<Option<Relay>> {
        match self.cache.get_relay(id).await {
            Ok(Some(relay)) => {
                self.counters.hit(EntityClass::Relay);
                return Ok(Some(relay));
            }
            Ok(None) => {}
            Err(err) => warn!(relay_id = id, %err, "cache read failed; falling through"),
        }
        self.counters.miss(EntityClass::Relay);
        let from_truth = self.truth.get_relay(id).await?;
        if let Some(relay) = &from_truth {
            if let Err(err) = self.cache.save_relay(relay).await {
                warn!(relay_id = id, %err, "cache populate failed");
            }
        }
        Ok(from_truth)
    }

    async fn list_relays(&self, filter: &RelayFilter) -> StoreResult<Vec<Relay>> {
        // Listings need a consistent view; always answer from truth.
        self.truth.list_relays(filter).await
    }

    async fn delete_relay(&self, id: &str) -> StoreResult<()> {
        self.truth.delete_relay(id).await?;
        if let Err(err) = self.cache.delete_relay(id).await {
            warn!(relay_id = id, %err, "cache delete failed; entry will age out by TTL");
        }
        Ok(())
    }

    async fn save_attempt(&self, attempt: &RelayAttempt) -> StoreResult<()> {
        // Truth always; the cache side keeps only live attempts.
        self.truth.save_attempt(attempt).await?;
        if let Err(err) = self.cache.save_attempt(attempt).await {
            warn!(relay_id = %attempt.relay_id, %err, "attempt cache write failed");
        }
        Ok(())
    }

    async fn list_attempts(&self, relay_id: &str) -> StoreResult<Vec<RelayAttempt>> {
        // History is a truth-only question.
        self.truth.list_attempts(relay_id).await
    }

    async fn next_attempt_number(&self, relay_id: &str) -> StoreResult<u32> {
        self.truth.next_attempt_number(relay_id).await
    }

    async fn save_chain_state(&self, state: &ChainState) -> StoreResult<()> {
        self.truth.save_chain_state(state).await?;
        if let Err(err) = self.cache.save_chain_state(state).await {
            warn!(chain_id = %state.chain_id, %err, "chain state cache write failed");
        }
        Ok(())
    }

    async fn get_chain_state(&self, chain_id: &str) -> StoreResult<Option<ChainState>> {
        match self.cache.get_chain_state(chain_id).await {
            Ok(Some(state)) => {
                self.counters.hit(EntityClass::ChainState);
                return Ok(Some(state));
            }
            Ok(None) => {}
            Err(err) => warn!(chain_id, %err, "chain state cache read failed"),
        }
        self.counters.miss(EntityClass::ChainState);
        let from_truth = self.truth.get_chain_state(chain_id).await?;
        if let Some(state) = &from_truth {
            if let Err(err) = self.cache.save_chain_state(state).await {
                warn!(chain_id, %err, "chain state cache populate failed");
            }
        }
        Ok(from_truth)
    }

    async fn list_chain_states(&self) -> StoreResult<Vec<ChainState>> {
        self.truth.list_chain_states().await
    }

    async fn save_breaker(&self, state: &CircuitBreakerState) -> StoreResult<()> {
        self.truth.save_breaker(state).await?;
        if let Err(err) = self.cache.save_breaker(state).await {
            warn!(breaker = %state.name, %err, "breaker cache write failed");
        }
        Ok(())
    }

    async fn get_breaker(&self, name: &str) -> StoreResult<Option<CircuitBreakerState>> {
        match self.cache.get_breaker(name).await {
            Ok(Some(state)) => {
                self.counters.hit(EntityClass::Breaker);
                return Ok(Some(state));
            }
            Ok(None) => {}
            Err(err) => warn!(breaker = name, %err, "breaker cache read failed"),
        }
        self.counters.miss(EntityClass::Breaker);
        let from_truth = self.truth.get_breaker(name).await?;
        if let Some(state) = &from_truth {
            if let Err(err) = self.cache.save_breaker(state).await {
                warn!(breaker = name, %err, "breaker cache populate failed");
            }
        }
        Ok(from_truth)
    }

    async fn list_breakers(&self) -> StoreResult<Vec<CircuitBreakerState>> {
        self.truth.list_breakers().await
    }

    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> StoreResult<()> {
        self.truth.save_snapshot(snapshot).await?;
        if let Err(err) = self.cache.save_snapshot(snapshot).await {
            warn!(snapshot_id = %snapshot.id, %err, "snapshot cache write failed");
        }
        Ok(())
    }

    async fn latest_snapshot(&self) -> StoreResult<Option<MetricsSnapshot>> {
        match self.cache.latest_snapshot().await {
            Ok(Some(snapshot)) => {
                self.counters.hit(EntityClass::Snapshot);
                return Ok(Some(snapshot));
            }
            Ok(None) => {}
            Err(err) => warn!(%err, "latest snapshot cache read failed"),
        }
        self.counters.miss(EntityClass::Snapshot);
        self.truth.latest_snapshot().await
    }

    async fn snapshots_in_range(
        &self,
        from_millis: i64,
        to_millis: i64,
    ) -> StoreResult<Vec<MetricsSnapshot>> {
        // Range queries are truth-only by policy.
        self.truth.snapshots_in_range(from_millis, to_millis).await
    }

    async fn lease_next_ready(&self, worker: &str, ttl: Duration) -> StoreResult<Option<Relay>> {
        // Per-relay exclusion must come from the strongly-consistent side.
        self.truth.lease_next_ready(worker, ttl).await
    }

    async fn heartbeat_lease(
        &self,
        relay_id: &str,
        worker: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.truth.heartbeat_lease(relay_id, worker, ttl).await
    }

    async fn release_lease(&self, relay_id: &str, worker: &str) -> StoreResult<()> {
        self.truth.release_lease(relay_id, worker).await
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        let inner = self.truth.begin_transaction().await?;
        Ok(Box::new(HybridTransaction {
            inner,
            cache: Arc::clone(&self.cache),
            staged_relays: Vec::new(),
            staged_attempts: Vec::new(),
        }))
    }

    async fn cleanup(&self, retention: &RetentionPolicy) -> StoreResult<CleanupReport> {
        let report = self.truth.cleanup(retention).await?;
        // Cache entries age out by TTL regardless; an explicit pass keeps the
        // index sets tidy. Its counts are not authoritative.
        if let Err(err) = self.cache.cleanup(retention).await {
            warn!(%err, "cache cleanup failed");
        }
        Ok(report)
    }

    async fn vacuum(&self) -> StoreResult<()> {
        self.truth.vacuum().await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.truth.ping().await?;
        self.cache.ping().await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let mut stats = self.truth.stats().await?;
        stats.provider = "hybrid";
        for class in EntityClass::all() {
            stats.cache.insert(class.label(), self.counters.rate(class));
        }
        Ok(stats)
    }
}

/// Runs against truth; reconciles the cache after a successful commit.
pub struct HybridTransaction {
    inner: Box<dyn StoreTransaction>,
    cache: Arc<dyn RelayStore>,
    staged_relays: Vec<Relay>,
    staged_attempts: Vec<RelayAttempt>,
}

#[async_trait]
impl StoreTransaction for HybridTransaction {
    async fn save_relay(&mut self, relay: &Relay) -> StoreResult<()> {
        self.inner.save_relay(relay).await?;
        self.staged_relays.push(relay.clone());
        Ok(())
    }

    async fn save_attempt(&mut self, attempt: &RelayAttempt) -> StoreResult<()> {
        self.inner.save_attempt(attempt).await?;
        self.staged_attempts.push(attempt.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.inner.commit().await?;
        for relay in &self.staged_relays {
            if let Err(err) = self.cache.save_relay(relay).await {
                warn!(relay_id = %relay.id, %err, "post-commit cache reconcile failed");
            }
        }
        for attempt in &self.staged_attempts {
            if let Err(err) = self.cache.save_attempt(attempt).await {
                warn!(relay_id = %attempt.relay_id, %err, "post-commit cache reconcile failed");
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.inner.rollback().await
    }
}

