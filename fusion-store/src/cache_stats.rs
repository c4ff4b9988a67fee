use std::sync::atomic::{AtomicU64, Ordering};

use crate::HitRate;

/// Entity classes tracked by the cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityClass {
    /// Relay records.
    Relay,
    /// Relay attempts.
    Attempt,
    /// Chain state records.
    ChainState,
    /// Circuit breaker records.
    Breaker,
    /// Metrics snapshots.
    Snapshot,
}

impl EntityClass {
    /// Stable label used in stats maps.
    pub fn label(self) -> &'static str {
        match self {
            EntityClass::Relay => "relay",
            EntityClass::Attempt => "attempt",
            EntityClass::ChainState => "chain_state",
            EntityClass::Breaker => "circuit_breaker",
            EntityClass::Snapshot => "metrics_snapshot",
        }
    }

    /// Every tracked class.
    pub fn all() -> [EntityClass; 5] {
        [
            EntityClass::Relay,
            EntityClass::Attempt,
            EntityClass::ChainState,
            EntityClass::Breaker,
            EntityClass::Snapshot,
        ]
    }
}

#[derive(Debug, Default)]
struct Counter {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Per-entity-class hit/miss counters. Plain atomics; safe to share across
/// workers without a lock.
#[derive(Debug, Default)]
pub struct CacheCounters {
    relay: Counter,
    attempt: Counter,
    chain_state: Counter,
    breaker: Counter,
    snapshot: Counter,
}

impl CacheCounters {
    fn counter(&self, class: EntityClass) -> &Counter {
        match class {
            EntityClass::Relay => &self.relay,
            EntityClass::Attempt => &self.attempt,
            EntityClass::ChainState => &self.chain_state,
            EntityClass::Breaker => &self.breaker,
            EntityClass::Snapshot => &self.snapshot,
        }
    }

    /// Record a cache-served read.
    pub fn hit(&self, class: EntityClass) {
        self.counter(class).hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a read that fell through to truth.
    pub fn miss(&self, class: EntityClass) {
        self.counter(class).misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Current hit rate for one class.
    pub fn rate(&self, class: EntityClass) -> HitRate {
        let c = self.counter(class);
        HitRate {
            hits: c.hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counters_accumulate_per_class() {
        let counters = CacheCounters::default();
        counters.hit(EntityClass::Relay);
        counters.hit(EntityClass::Relay);
        counters.miss(EntityClass::Relay);
        counters.miss(EntityClass::Breaker);

        let relay = counters.rate(EntityClass::Relay);
        assert_eq!((relay.hits, relay.misses), (2, 1));
        assert_eq!(counters.rate(EntityClass::Breaker).misses, 1);
        assert_eq!(counters.rate(EntityClass::Snapshot).hits, 0);
    }
}
