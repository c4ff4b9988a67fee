use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::time::now_millis;

/// Observability status of a tracked chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChainStatus {
    /// Caught up and healthy.
    Active,
    /// Catching up to the tip.
    Syncing,
    /// Persistent errors against this chain.
    Error,
    /// Operator-disabled.
    Disabled,
}

/// Per-chain progress bookkeeping. `last_processed_*` only ever advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainState {
    /// Chain identifier (e.g. `ethereum`, `osmosis-1`).
    pub chain_id: String,
    /// Highest block number fully processed.
    pub last_processed_block: u64,
    /// Highest height fully processed, for chains counting in heights.
    pub last_processed_height: u64,
    /// Current status.
    pub status: ChainStatus,
    /// Last update, milliseconds since epoch.
    pub last_updated: i64,
    /// Consecutive error count since the last success.
    pub error_count: u32,
    /// Most recent error text.
    pub last_error: Option<String>,
}

impl ChainState {
    /// Fresh state for a newly-tracked chain.
    pub fn new(chain_id: impl Into<String>) -> Self {
        Self {
            chain_id: chain_id.into(),
            last_processed_block: 0,
            last_processed_height: 0,
            status: ChainStatus::Syncing,
            last_updated: now_millis(),
            error_count: 0,
            last_error: None,
        }
    }

    /// Advance progress, enforcing monotonicity.
    pub fn advance(&mut self, block: u64, height: u64) {
        self.last_processed_block = self.last_processed_block.max(block);
        self.last_processed_height = self.last_processed_height.max(height);
        self.last_updated = now_millis();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn progress_never_regresses() {
        let mut state = ChainState::new("ethereum");
        state.advance(100, 100);
        state.advance(50, 120);
        assert_eq!(state.last_processed_block, 100);
        assert_eq!(state.last_processed_height, 120);
    }
}
