//! Circuit breakers, one per logical operation class (endpoint × category).
//!
//! The breaker itself is synchronous in-memory state; the [`BreakerRegistry`]
//! loads persisted windows at first use and flushes snapshots back through
//! the store so a restart does not lose an open window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{info, warn};

use fusion_core::{time::now_millis, CircuitBreakerState, CircuitState, StoreResult};
use fusion_store::RelayStore;

/// Breaker tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct BreakerConfig {
    /// Failures in `closed` before tripping.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Initial open window, milliseconds.
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    /// Cap on the exponentially-grown open window, milliseconds.
    #[serde(default = "default_max_open_timeout_ms")]
    pub max_open_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout_ms(),
            max_open_timeout_ms: default_max_open_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_ms() -> u64 {
    30_000
}

fn default_max_open_timeout_ms() -> u64 {
    10 * 60_000
}

/// Returned when an open breaker fails a call fast, before any I/O.
#[derive(Debug, thiserror::Error)]
#[error("circuit breaker `{name}` is open until {until:?}")]
pub struct BreakerOpen {
    /// Breaker name.
    pub name: String,
    /// Epoch millis at which a probe will next be admitted.
    pub until: Option<i64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_time: Option<i64>,
    last_success_time: Option<i64>,
    next_attempt: Option<i64>,
    /// Consecutive trips; drives the exponential open window.
    consecutive_opens: u32,
    /// Whether the single half-open probe is out.
    probe_in_flight: bool,
    dirty: bool,
}

/// One named breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    /// A fresh closed breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure_time: None,
                last_success_time: None,
                next_attempt: None,
                consecutive_opens: 0,
                probe_in_flight: false,
                dirty: false,
            }),
        }
    }

    /// Rebuild from a persisted record, keeping an open window intact.
    pub fn restore(record: &CircuitBreakerState, config: BreakerConfig) -> Self {
        let breaker = Self::new(record.name.clone(), config);
        {
            let mut inner = breaker.inner.lock();
            inner.state = record.state;
            inner.failures = record.failures;
            inner.successes = record.successes;
            inner.last_failure_time = record.last_failure_time;
            inner.last_success_time = record.last_success_time;
            inner.next_attempt = record.next_attempt;
        }
        breaker
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Admission control. Must be called before performing any I/O; an open
    /// breaker rejects here without touching the network.
    pub fn try_call(&self) -> Result<(), BreakerOpen> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let now = now_millis();
                match inner.next_attempt {
                    Some(at) if now >= at => {
                        inner.state = CircuitState::HalfOpen;
                        inner.probe_in_flight = true;
                        inner.dirty = true;
                        info!(breaker = %self.name, "breaker half-open; admitting probe");
                        Ok(())
                    }
                    until => Err(BreakerOpen {
                        name: self.name.clone(),
                        until,
                    }),
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(BreakerOpen {
                        name: self.name.clone(),
                        until: inner.next_attempt,
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut inner = self.inner.lock();
        inner.successes += 1;
        inner.last_success_time = Some(now_millis());
        inner.probe_in_flight = false;
        inner.dirty = true;
        match inner.state {
            CircuitState::HalfOpen => {
                info!(breaker = %self.name, "probe succeeded; closing breaker");
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.consecutive_opens = 0;
                inner.next_attempt = None;
            }
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        let mut inner = self.inner.lock();
        let now = now_millis();
        inner.failures += 1;
        inner.last_failure_time = Some(now);
        inner.probe_in_flight = false;
        inner.dirty = true;
        let should_trip = match inner.state {
            CircuitState::Closed => inner.failures >= self.config.failure_threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if should_trip {
            let window = (self.config.open_timeout_ms
                .saturating_mul(1u64 << inner.consecutive_opens.min(20)))
            .min(self.config.max_open_timeout_ms);
            inner.consecutive_opens += 1;
            inner.state = CircuitState::Open;
            inner.next_attempt = Some(now + window as i64);
            warn!(
                breaker = %self.name,
                window_ms = window,
                failures = inner.failures,
                "breaker opened"
            );
        }
    }

    /// Current position.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot for persistence. Clears the dirty flag.
    pub fn snapshot(&self) -> CircuitBreakerState {
        let mut inner = self.inner.lock();
        inner.dirty = false;
        CircuitBreakerState {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_failure_time: inner.last_failure_time,
            last_success_time: inner.last_success_time,
            next_attempt: inner.next_attempt,
            updated_at: now_millis(),
        }
    }

    fn is_dirty(&self) -> bool {
        self.inner.lock().dirty
    }
}

/// Process-wide collection of breakers, backed by the store.
pub struct BreakerRegistry {
    store: Arc<dyn RelayStore>,
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl BreakerRegistry {
    /// A registry persisting through `store`.
    pub fn new(store: Arc<dyn RelayStore>, config: BreakerConfig) -> Self {
        Self {
            store,
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Fetch or create the breaker for `name`, restoring any persisted
    /// window on first access.
    pub async fn get(&self, name: &str) -> StoreResult<Arc<CircuitBreaker>> {
        if let Some(found) = self.breakers.lock().get(name) {
            return Ok(Arc::clone(found));
        }
        let breaker = match self.store.get_breaker(name).await? {
            Some(record) => Arc::new(CircuitBreaker::restore(&record, self.config)),
            None => Arc::new(CircuitBreaker::new(name, self.config)),
        };
        Ok(Arc::clone(
            self.breakers
                .lock()
                .entry(name.to_string())
                .or_insert(breaker),
        ))
    }

    /// Persist every breaker that changed since the last flush.
    pub async fn flush(&self) -> StoreResult<()> {
        let dirty: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .lock()
            .values()
            .filter(|b| b.is_dirty())
            .cloned()
            .collect();
        for breaker in dirty {
            self.store.save_breaker(&breaker.snapshot()).await?;
        }
        Ok(())
    }

    /// Every breaker currently known in-process.
    pub fn all(&self) -> Vec<Arc<CircuitBreaker>> {
        self.breakers.lock().values().cloned().collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use fusion_test::MemoryStore;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            open_timeout_ms: 1_000,
            max_open_timeout_ms: 8_000,
        }
    }

    #[test]
    fn trips_at_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new("ethereum:rpc", fast_config());
        breaker.on_failure();
        breaker.on_failure();
        assert!(breaker.try_call().is_ok(), "below threshold stays closed");
        breaker.on_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        let rejected = breaker.try_call().unwrap_err();
        assert!(rejected.until.is_some());
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        let breaker = CircuitBreaker::new("b", fast_config());
        for _ in 0..3 {
            breaker.on_failure();
        }
        // Force the window into the past.
        breaker.inner.lock().next_attempt = Some(now_millis() - 1);
        assert!(breaker.try_call().is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert!(breaker.try_call().is_err(), "second probe rejected");
        breaker.on_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert!(breaker.try_call().is_ok());
    }

    #[test]
    fn open_window_grows_exponentially_and_caps() {
        let breaker = CircuitBreaker::new("b", fast_config());
        let mut windows = Vec::new();
        for _ in 0..5 {
            for _ in 0..3 {
                breaker.on_failure();
            }
            let next = breaker.inner.lock().next_attempt.unwrap();
            windows.push(next - now_millis());
            // Admit and fail a probe to re-open.
            breaker.inner.lock().next_attempt = Some(now_millis() - 1);
            breaker.try_call().unwrap();
        }
        assert!(windows[1] > windows[0]);
        assert!(windows.iter().all(|w| *w <= 8_100));
    }

    #[tokio::test]
    async fn registry_restores_persisted_open_window() {
        let store = Arc::new(MemoryStore::default());
        let registry = BreakerRegistry::new(
            Arc::clone(&store) as Arc<dyn RelayStore>,
            fast_config(),
        );
        let breaker = registry.get("osmosis-1:rpc").await.unwrap();
        for _ in 0..3 {
            breaker.on_failure();
        }
        registry.flush().await.unwrap();

        // A new registry (fresh process) sees the same open window.
        let registry2 = BreakerRegistry::new(store, fast_config());
        let restored = registry2.get("osmosis-1:rpc").await.unwrap();
        assert_eq!(restored.state(), CircuitState::Open);
        assert!(restored.try_call().is_err());
    }
}
