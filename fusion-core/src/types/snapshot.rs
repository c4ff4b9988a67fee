use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::time::now_millis;

/// Append-only aggregate of system state at one instant, queryable by time
/// range from the truth store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Generated identifier.
    pub id: String,
    /// Capture time, milliseconds since epoch.
    pub timestamp: i64,
    /// Relays known to the store, any status.
    pub relays_total: u64,
    /// Relays in a non-terminal status.
    pub relays_active: u64,
    /// Relays completed since genesis.
    pub relays_completed: u64,
    /// Relays failed since genesis.
    pub relays_failed: u64,
    /// Relays refunded since genesis.
    pub relays_refunded: u64,
    /// Per-chain state map, JSON-encoded.
    pub chain_states: serde_json::Value,
    /// Per-breaker state map, JSON-encoded.
    pub breaker_states: serde_json::Value,
    /// Cache hit rate over the sampling window, when a cache is configured.
    pub cache_hit_rate: Option<f64>,
    /// Composite health score in `[0, 1]`.
    pub system_health: f64,
}

impl MetricsSnapshot {
    /// An empty snapshot stamped now.
    pub fn empty() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            relays_total: 0,
            relays_active: 0,
            relays_completed: 0,
            relays_failed: 0,
            relays_refunded: 0,
            chain_states: serde_json::Value::Null,
            breaker_states: serde_json::Value::Null,
            cache_hit_rate: None,
            system_health: 1.0,
        }
    }
}
