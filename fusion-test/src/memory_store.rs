use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use fusion_core::{
    time::now_millis, ChainState, CircuitBreakerState, MetricsSnapshot, Relay, RelayAttempt,
    RelayStatus, StoreError, StoreResult,
};
use fusion_store::{
    CleanupReport, RelayFilter, RelayStore, RetentionPolicy, StoreStats, StoreTransaction,
};

#[derive(Default)]
struct Inner {
    relays: HashMap<String, Relay>,
    attempts: HashMap<String, Vec<RelayAttempt>>,
    chains: HashMap<String, ChainState>,
    breakers: HashMap<String, CircuitBreakerState>,
    snapshots: Vec<MetricsSnapshot>,
    // relay_id -> (worker, expiry millis)
    leases: HashMap<String, (String, i64)>,
}

impl Inner {
    fn apply_relay(&mut self, input: &Relay) {
        let mut record = input.clone();
        record.updated_at = record.updated_at.max(now_millis());
        self.relays.insert(record.id.clone(), record);
    }

    fn apply_attempt(&mut self, attempt: &RelayAttempt) {
        let list = self.attempts.entry(attempt.relay_id.clone()).or_default();
        match list.iter_mut().find(|a| a.id == attempt.id) {
            Some(existing) => *existing = attempt.clone(),
            None => {
                list.push(attempt.clone());
                list.sort_by_key(|a| a.attempt_number);
            }
        }
    }
}

/// Fully in-memory store provider with truth-like semantics, including
/// leasing. Backs unit and scenario tests without a database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Attempts recorded for a relay, for white-box assertions.
    pub fn attempt_count(&self, relay_id: &str) -> usize {
        self.inner
            .lock()
            .attempts
            .get(relay_id)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Current lease holder of a relay, if any.
    pub fn lease_holder(&self, relay_id: &str) -> Option<String> {
        self.inner
            .lock()
            .leases
            .get(relay_id)
            .filter(|(_, expiry)| *expiry >= now_millis())
            .map(|(worker, _)| worker.clone())
    }

    /// Force a lease into the past so reclaim paths can be exercised without
    /// waiting out a TTL.
    pub fn expire_lease(&self, relay_id: &str) {
        if let Some(entry) = self.inner.lock().leases.get_mut(relay_id) {
            entry.1 = now_millis() - 1;
        }
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn save_relay(&self, relay: &Relay) -> StoreResult<()> {
        self.inner.lock().apply_relay(relay);
        Ok(())
    }

    async fn get_relay(&self, id: &str) -> StoreResult<Option<Relay>> {
        Ok(self.inner.lock().relays.get(id).cloned())
    }

    async fn list_relays(&self, filter: &RelayFilter) -> StoreResult<Vec<Relay>> {
        let inner = self.inner.lock();
        let mut relays: Vec<Relay> = inner
            .relays
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| filter.created_after.map_or(true, |t| r.created_at >= t))
            .filter(|r| filter.created_before.map_or(true, |t| r.created_at < t))
            .cloned()
            .collect();
        relays.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            relays.truncate(limit as usize);
        }
        Ok(relays)
    }

    async fn delete_relay(&self, id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        inner.relays.remove(id);
        inner.attempts.remove(id);
        inner.leases.remove(id);
        Ok(())
    }

    async fn save_attempt(&self, attempt: &RelayAttempt) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let duplicate = inner
            .attempts
            .get(&attempt.relay_id)
            .map(|list| {
                list.iter()
                    .any(|a| a.attempt_number == attempt.attempt_number && a.id != attempt.id)
            })
            .unwrap_or(false);
        if duplicate {
            return Err(StoreError::Constraint(format!(
                "duplicate attempt number {} for relay {}",
                attempt.attempt_number, attempt.relay_id
            )));
        }
        inner.apply_attempt(attempt);
        Ok(())
    }

    async fn list_attempts(&self, relay_id: &str) -> StoreResult<Vec<RelayAttempt>> {
        Ok(self
            .inner
            .lock()
            .attempts
            .get(relay_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn next_attempt_number(&self, relay_id: &str) -> StoreResult<u32> {
        Ok(self
            .inner
            .lock()
            .attempts
            .get(relay_id)
            .and_then(|list| list.iter().map(|a| a.attempt_number).max())
            .unwrap_or(0)
            + 1)
    }

    async fn save_chain_state(&self, state: &ChainState) -> StoreResult<()> {
        self.inner
            .lock()
            .chains
            .insert(state.chain_id.clone(), state.clone());
        Ok(())
    }

    async fn get_chain_state(&self, chain_id: &str) -> StoreResult<Option<ChainState>> {
        Ok(self.inner.lock().chains.get(chain_id).cloned())
    }

    async fn list_chain_states(&self) -> StoreResult<Vec<ChainState>> {
        Ok(self.inner.lock().chains.values().cloned().collect())
    }

    async fn save_breaker(&self, state: &CircuitBreakerState) -> StoreResult<()> {
        self.inner
            .lock()
            .breakers
            .insert(state.name.clone(), state.clone());
        Ok(())
    }

    async fn get_breaker(&self, name: &str) -> StoreResult<Option<CircuitBreakerState>> {
        Ok(self.inner.lock().breakers.get(name).cloned())
    }

    async fn list_breakers(&self) -> StoreResult<Vec<CircuitBreakerState>> {
        Ok(self.inner.lock().breakers.values().cloned().collect())
    }

    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> StoreResult<()> {
        self.inner.lock().snapshots.push(snapshot.clone());
        Ok(())
    }

    async fn latest_snapshot(&self) -> StoreResult<Option<MetricsSnapshot>> {
        Ok(self
            .inner
            .lock()
            .snapshots
            .iter()
            .max_by_key(|s| s.timestamp)
            .cloned())
    }

    async fn snapshots_in_range(
        &self,
        from_millis: i64,
        to_millis: i64,
    ) -> StoreResult<Vec<MetricsSnapshot>> {
        let mut found: Vec<MetricsSnapshot> = self
            .inner
            .lock()
            .snapshots
            .iter()
            .filter(|s| s.timestamp >= from_millis && s.timestamp < to_millis)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.timestamp);
        Ok(found)
    }

    async fn lease_next_ready(&self, worker: &str, ttl: Duration) -> StoreResult<Option<Relay>> {
        let mut inner = self.inner.lock();
        let now = now_millis();
        let mut candidates: Vec<Relay> = inner
            .relays
            .values()
            .filter(|r| r.status.is_active() || r.status == RelayStatus::Expired)
            .filter(|r| {
                inner
                    .leases
                    .get(&r.id)
                    .map_or(true, |(_, expiry)| *expiry < now)
            })
            .cloned()
            .collect();
        candidates.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let claimed = candidates.into_iter().next();
        if let Some(relay) = &claimed {
            inner.leases.insert(
                relay.id.clone(),
                (worker.to_string(), now + ttl.as_millis() as i64),
            );
        }
        Ok(claimed)
    }

    async fn heartbeat_lease(
        &self,
        relay_id: &str,
        worker: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let mut inner = self.inner.lock();
        let now = now_millis();
        match inner.leases.get_mut(relay_id) {
            Some((owner, expiry)) if owner == worker && *expiry >= now => {
                *expiry = now + ttl.as_millis() as i64;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_lease(&self, relay_id: &str, worker: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if let Some((owner, _)) = inner.leases.get(relay_id) {
            if owner == worker {
                inner.leases.remove(relay_id);
            }
        }
        Ok(())
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        Ok(Box::new(MemoryTransaction {
            inner: Arc::clone(&self.inner),
            staged_relays: Vec::new(),
            staged_attempts: Vec::new(),
        }))
    }

    async fn cleanup(&self, retention: &RetentionPolicy) -> StoreResult<CleanupReport> {
        let mut inner = self.inner.lock();
        let now = now_millis();
        let relay_cutoff = now - retention.relay_retention.as_millis() as i64;
        let snapshot_cutoff = now - retention.snapshot_retention.as_millis() as i64;

        let doomed: Vec<String> = inner
            .relays
            .values()
            .filter(|r| r.status.is_terminal() && r.updated_at < relay_cutoff)
            .map(|r| r.id.clone())
            .collect();
        let mut report = CleanupReport {
            relays_deleted: doomed.len() as u64,
            ..Default::default()
        };
        for id in doomed {
            report.attempts_deleted += inner
                .attempts
                .remove(&id)
                .map(|list| list.len() as u64)
                .unwrap_or(0);
            inner.relays.remove(&id);
            inner.leases.remove(&id);
        }

        let before = inner.snapshots.len();
        inner.snapshots.retain(|s| s.timestamp >= snapshot_cutoff);
        report.snapshots_deleted = (before - inner.snapshots.len()) as u64;
        Ok(report)
    }

    async fn vacuum(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        let inner = self.inner.lock();
        let mut stats = StoreStats {
            provider: "memory",
            ..Default::default()
        };
        for relay in inner.relays.values() {
            *stats.relays_by_status.entry(relay.status).or_insert(0) += 1;
        }
        stats.attempts_total = inner.attempts.values().map(|l| l.len() as u64).sum();
        Ok(stats)
    }
}

struct MemoryTransaction {
    inner: Arc<Mutex<Inner>>,
    staged_relays: Vec<Relay>,
    staged_attempts: Vec<RelayAttempt>,
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn save_relay(&mut self, relay: &Relay) -> StoreResult<()> {
        self.staged_relays.push(relay.clone());
        Ok(())
    }

    async fn save_attempt(&mut self, attempt: &RelayAttempt) -> StoreResult<()> {
        self.staged_attempts.push(attempt.clone());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        for relay in &self.staged_relays {
            inner.apply_relay(relay);
        }
        for attempt in &self.staged_attempts {
            inner.apply_attempt(attempt);
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        Ok(())
    }
}

/// Wraps another store and fails operations on demand. Reads and writes can
/// be toggled independently; failures surface as transient store errors.
pub struct FaultyStore<S> {
    inner: S,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl<S> FaultyStore<S> {
    /// Wrap `inner` with all faults off.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Toggle write failures.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Toggle read failures.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn write_guard(&self) -> StoreResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(StoreError::Transient("injected write failure".into()))
        } else {
            Ok(())
        }
    }

    fn read_guard(&self) -> StoreResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            Err(StoreError::Transient("injected read failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl<S: RelayStore> RelayStore for FaultyStore<S> {
    async fn save_relay(&self, relay: &Relay) -> StoreResult<()> {
        self.write_guard()?;
        self.inner.save_relay(relay).await
    }

    async fn get_relay(&self, id: &str) -> StoreResult<Option<Relay>> {
        self.read_guard()?;
        self.inner.get_relay(id).await
    }

    async fn list_relays(&self, filter: &RelayFilter) -> StoreResult<Vec<Relay>> {
        self.read_guard()?;
        self.inner.list_relays(filter).await
    }

    async fn delete_relay(&self, id: &str) -> StoreResult<()> {
        self.write_guard()?;
        self.inner.delete_relay(id).await
    }

    async fn save_attempt(&self, attempt: &RelayAttempt) -> StoreResult<()> {
        self.write_guard()?;
        self.inner.save_attempt(attempt).await
    }

    async fn list_attempts(&self, relay_id: &str) -> StoreResult<Vec<RelayAttempt>> {
        self.read_guard()?;
        self.inner.list_attempts(relay_id).await
    }

    async fn next_attempt_number(&self, relay_id: &str) -> StoreResult<u32> {
        self.read_guard()?;
        self.inner.next_attempt_number(relay_id).await
    }

    async fn save_chain_state(&self, state: &ChainState) -> StoreResult<()> {
        self.write_guard()?;
        self.inner.save_chain_state(state).await
    }

    async fn get_chain_state(&self, chain_id: &str) -> StoreResult<Option<ChainState>> {
        self.read_guard()?;
        self.inner.get_chain_state(chain_id).await
    }

    async fn list_chain_states(&self) -> StoreResult<Vec<ChainState>> {
        self.read_guard()?;
        self.inner.list_chain_states().await
    }

    async fn save_breaker(&self, state: &CircuitBreakerState) -> StoreResult<()> {
        self.write_guard()?;
        self.inner.save_breaker(state).await
    }

    async fn get_breaker(&self, name: &str) -> StoreResult<Option<CircuitBreakerState>> {
        self.read_guard()?;
        self.inner.get_breaker(name).await
    }

    async fn list_breakers(&self) -> StoreResult<Vec<CircuitBreakerState>> {
        self.read_guard()?;
        self.inner.list_breakers().await
    }

    async fn save_snapshot(&self, snapshot: &MetricsSnapshot) -> StoreResult<()> {
        self.write_guard()?;
        self.inner.save_snapshot(snapshot).await
    }

    async fn latest_snapshot(&self) -> StoreResult<Option<MetricsSnapshot>> {
        self.read_guard()?;
        self.inner.latest_snapshot().await
    }

    async fn snapshots_in_range(
        &self,
        from_millis: i64,
        to_millis: i64,
    ) -> StoreResult<Vec<MetricsSnapshot>> {
        self.read_guard()?;
        self.inner.snapshots_in_range(from_millis, to_millis).await
    }

    async fn lease_next_ready(&self, worker: &str, ttl: Duration) -> StoreResult<Option<Relay>> {
        self.write_guard()?;
        self.inner.lease_next_ready(worker, ttl).await
    }

    async fn heartbeat_lease(
        &self,
        relay_id: &str,
        worker: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        self.write_guard()?;
        self.inner.heartbeat_lease(relay_id, worker, ttl).await
    }

    async fn release_lease(&self, relay_id: &str, worker: &str) -> StoreResult<()> {
        self.write_guard()?;
        self.inner.release_lease(relay_id, worker).await
    }

    async fn begin_transaction(&self) -> StoreResult<Box<dyn StoreTransaction>> {
        self.write_guard()?;
        self.inner.begin_transaction().await
    }

    async fn cleanup(&self, retention: &RetentionPolicy) -> StoreResult<CleanupReport> {
        self.write_guard()?;
        self.inner.cleanup(retention).await
    }

    async fn vacuum(&self) -> StoreResult<()> {
        self.inner.vacuum().await
    }

    async fn ping(&self) -> StoreResult<()> {
        self.read_guard()?;
        self.inner.ping().await
    }

    async fn stats(&self) -> StoreResult<StoreStats> {
        self.inner.stats().await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sample_relay;

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let store = MemoryStore::default();
        let relay = sample_relay("rt-1", 2_000_000_000);
        store.save_relay(&relay).await.unwrap();
        let found = store.get_relay("rt-1").await.unwrap().unwrap();
        assert_eq!(found.id, relay.id);
        assert_eq!(found.hashlock, relay.hashlock);
        assert!(found.updated_at >= relay.created_at);
    }

    #[tokio::test]
    async fn duplicate_attempt_number_is_a_constraint_violation() {
        let store = MemoryStore::default();
        let relay = sample_relay("rt-2", 2_000_000_000);
        store.save_relay(&relay).await.unwrap();
        let a = fusion_core::RelayAttempt::begin("rt-2", 1, fusion_core::AttemptAction::LockTarget);
        let b = fusion_core::RelayAttempt::begin("rt-2", 1, fusion_core::AttemptAction::LockTarget);
        store.save_attempt(&a).await.unwrap();
        let err = store.save_attempt(&b).await.unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn lease_excludes_other_workers_until_expiry() {
        let store = MemoryStore::default();
        store
            .save_relay(&sample_relay("rt-3", 2_000_000_000))
            .await
            .unwrap();

        let ttl = Duration::from_secs(30);
        let claimed = store.lease_next_ready("w1", ttl).await.unwrap();
        assert_eq!(claimed.unwrap().id, "rt-3");
        assert!(store.lease_next_ready("w2", ttl).await.unwrap().is_none());

        store.expire_lease("rt-3");
        let reclaimed = store.lease_next_ready("w2", ttl).await.unwrap();
        assert_eq!(reclaimed.unwrap().id, "rt-3");
        // The original worker can no longer heartbeat.
        assert!(!store.heartbeat_lease("rt-3", "w1", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_spares_non_terminal_relays() {
        let store = MemoryStore::default();
        let mut old_active = sample_relay("rt-4", 2_000_000_000);
        old_active.created_at = 0;
        old_active.updated_at = 0;
        let mut old_done = sample_relay("rt-5", 2_000_000_000);
        old_done.created_at = 0;
        old_done.updated_at = 0;
        old_done.status = RelayStatus::Completed;
        // Bypass the monotonic bump to plant genuinely old rows.
        {
            let mut inner = store.inner.lock();
            inner.relays.insert(old_active.id.clone(), old_active);
            inner.relays.insert(old_done.id.clone(), old_done);
        }

        let report = store.cleanup(&RetentionPolicy::default()).await.unwrap();
        assert_eq!(report.relays_deleted, 1);
        assert!(store.get_relay("rt-4").await.unwrap().is_some());
        assert!(store.get_relay("rt-5").await.unwrap().is_none());
    }
}
