use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use fusion_core::{
    ChainState, CircuitBreakerState, MetricsSnapshot, Relay, RelayAttempt, RelayStatus,
    StoreResult,
};

/// Selection criteria for relay listings.
#[derive(Debug, Clone, Default)]
pub struct RelayFilter {
    /// Restrict to one status.
    pub status: Option<RelayStatus>,
    /// Only relays created at or after this time (millis).
    pub created_after: Option<i64>,
    /// Only relays created before this time (millis).
    pub created_before: Option<i64>,
    /// Cap on returned rows; providers apply a sane default when absent.
    pub limit: Option<u64>,
}

impl RelayFilter {
    /// Filter down to a single status.
    pub fn with_status(status: RelayStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

/// Retention windows for [`RelayStore::cleanup`].
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// How long terminal relays (and their attempts) are kept.
    pub relay_retention: Duration,
    /// How long metrics snapshots are kept.
    pub snapshot_retention: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            relay_retention: Duration::from_secs(7 * 86_400),
            snapshot_retention: Duration::from_secs(30 * 86_400),
        }
    }
}

/// What a cleanup pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Terminal relays deleted.
    pub relays_deleted: u64,
    /// Attempts deleted (by cascade or explicitly).
    pub attempts_deleted: u64,
    /// Metrics snapshots deleted.
    pub snapshots_deleted: u64,
}

/// Cache effectiveness for one entity class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HitRate {
    /// Reads served from cache.
    pub hits: u64,
    /// Reads that fell through to truth.
    pub misses: u64,
}

impl HitRate {
    /// Hits over total reads; 0 when nothing was read.
    pub fn rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Aggregate provider statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Provider tag: `postgres`, `redis` or `hybrid`.
    pub provider: &'static str,
    /// Relay counts keyed by status.
    pub relays_by_status: HashMap<RelayStatus, u64>,
    /// Total attempts on record.
    pub attempts_total: u64,
    /// Cache hit rates per entity class, when a cache is in play.
    pub cache: HashMap<&'static str, HitRate>,
}

/// A scoped write set that commits or rolls back together.
///
/// Only the truth backend provides ACID semantics. The Redis implementation
/// is a command pipeline: atomic batching (all commands attempt or all are
/// discarded) but no isolation, and reads inside the transaction are not
/// supported. The hybrid provider runs the transaction against truth and
/// reconciles the cache after commit.
#[async_trait]
pub trait StoreTransaction: Send {
    /// Stage a relay upsert.
    async fn save_relay(&mut self, relay: &Relay) -> StoreResult<()>;

    /// Stage an attempt append or settle.
    async fn save_attempt(&mut self, attempt: &RelayAttempt) -> StoreResult<()>;

    /// Commit the write set.
    async fn commit(self: Box<Self>) -> StoreResult<()>;

    /// Discard the write set.
    async fn rollback(self: Box<Self>) -> StoreResult<()>;
}

/// The capability contract shared by every store provider.
///
/// All operations are suspending; implementations must tolerate cancellation
/// at any await point without leaving partial in-memory state behind.
#[async_trait]
pub trait RelayStore: Send + Sync {
    // ---- relays ----

    /// Upsert a relay. `updated_at` is bumped monotonically: saving the same
    /// relay twice is idempotent up to that field.
    async fn save_relay(&self, relay: &Relay) -> StoreResult<()>;

    /// Fetch one relay.
    async fn get_relay(&self, id: &str) -> StoreResult<Option<Relay>>;

    /// List relays matching `filter`, newest first.
    async fn list_relays(&self, filter: &RelayFilter) -> StoreResult<Vec<Relay>>;

    /// Delete a relay and (by cascade) its attempts.
    async fn delete_relay(&self, id: &str) -> StoreResult<()>;

    // ---- attempts ----

    /// Append or settle an attempt. `(relay_id, attempt_number)` is unique;
    /// appending a duplicate number is a constraint violation.
    async fn save_attempt(&self, attempt: &RelayAttempt) -> StoreResult<()>;

    /// Full per-relay history, ordered by `attempt_number`.
    async fn list_attempts(&self, relay_id: &str) -> StoreResult<Vec<RelayAttempt>>;

    /// `1 + max(attempt_number)` for the relay.
    async fn next_attempt_number(&self, relay_id: &str) -> StoreResult<u32>;

    // ---- chain state ----

    /// Upsert the state of one chain.
    async fn save_chain_state(&self, state: &ChainState) -> StoreResult<()>;

    /// Fetch the state of one chain.
    async fn get_chain_state(&self, chain_id: &str) -> StoreResult<Option<ChainState>>;

    /// All tracked chains.
    async fn list_chain_states(&self) -> StoreResult<Vec<ChainState>>;

    // ---- circuit breakers ----

    /// Upsert one breaker record.
    async fn save_breaker(&self, state: &CircuitBreakerState) -> StoreResult<()>;

    /// Fetch one breaker record.
    async fn get_breaker(&self, name: &str) -> StoreResult<Option<CircuitBreakerState>>;

    /// All persisted breakers.
    async fn list_breakers(&self) -> StoreResult<Vec<CircuitBreakerState>>;

    // ---- metrics snapshots ----

    /// Append a snapshot.
    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> StoreResult<()>;

    /// Most recent snapshot.
    async fn latest_snapshot(&self) -> StoreResult<Option<MetricsSnapshot>>;

    /// Snapshots with `from_millis <= timestamp < to_millis`, ascending.
    /// Range queries are served by truth only.
    async fn snapshots_in_range(
        &self,
        from_millis: i64,
        to_millis: i64,
    ) -> StoreResult<Vec<MetricsSnapshot>>;

    // ---- leasing ----

    /// Atomically claim the next active relay whose lease is absent or
    /// expired. Returns the claimed relay, or `None` when nothing is ready.
    /// This is the crash-recovery path: leases left behind by a dead worker
    /// become claimable once their TTL elapses.
    async fn lease_next_ready(&self, worker: &str, ttl: Duration) -> StoreResult<Option<Relay>>;

    /// Extend a held lease. Returns `false` when the lease is no longer
    /// owned by `worker` (it expired and was reclaimed).
    async fn heartbeat_lease(
        &self,
        relay_id: &str,
        worker: &str,
        ttl: Duration,
    ) -> StoreResult<bool>;

    /// Release a held lease so other workers may claim the relay.
    async fn release_lease(&self, relay_id: &str, worker: &str) -> StoreResult<()>;

    // ---- maintenance ----

    /// Open a scoped write set. See [`StoreTransaction`] for the semantics
    /// each provider offers.
    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>>;

    /// Remove terminal relays and stale snapshots past retention. Never
    /// deletes a non-terminal relay.
    async fn cleanup(&self, retention: &RetentionPolicy) -> StoreResult<CleanupReport>;

    /// Reclaim provider-side space where the backend supports it.
    async fn vacuum(&self) -> StoreResult<()>;

    /// Minimal liveness round-trip.
    async fn ping(&self) -> StoreResult<()>;

    /// Aggregate statistics.
    async fn stats(&self) -> StoreResult<StoreStats>;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hit_rate_division() {
        let rate = HitRate { hits: 3, misses: 1 };
        assert!((rate.rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(HitRate::default().rate(), 0.0);
    }
}
