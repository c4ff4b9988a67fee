use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::time::now_millis;

/// Circuit breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast until the open window elapses.
    Open,
    /// One probe call is admitted.
    HalfOpen,
}

/// Persisted snapshot of one named breaker.
///
/// The in-memory breaker in `fusion-base` is authoritative while the process
/// runs; this record exists so a restart does not lose an open window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Breaker name, `{endpoint}:{category}`.
    pub name: String,
    /// Current position.
    pub state: CircuitState,
    /// Failures observed in the current window.
    pub failures: u32,
    /// Successes observed in the current window.
    pub successes: u32,
    /// Last failure, milliseconds since epoch.
    pub last_failure_time: Option<i64>,
    /// Last success, milliseconds since epoch.
    pub last_success_time: Option<i64>,
    /// When an open breaker will next admit a probe, milliseconds since
    /// epoch.
    pub next_attempt: Option<i64>,
    /// Last mutation time.
    pub updated_at: i64,
}

impl CircuitBreakerState {
    /// A fresh closed breaker.
    pub fn closed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: CircuitState::Closed,
            failures: 0,
            successes: 0,
            last_failure_time: None,
            last_success_time: None,
            next_attempt: None,
            updated_at: now_millis(),
        }
    }
}
