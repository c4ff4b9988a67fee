use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};
use uuid::Uuid;

use crate::time::now_millis;

/// The forward action an attempt performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptAction {
    /// Resolve the hop list for the swap.
    RouteDiscovery,
    /// Lock the mirror HTLC on the target chain.
    LockTarget,
    /// Reveal the preimage to release funds.
    RevealSecret,
    /// Refund the source HTLC after expiry.
    Refund,
    /// Re-query on-chain truth after a restart.
    Reconcile,
}

/// Outcome of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AttemptStatus {
    /// Recorded but not started.
    Pending,
    /// Currently executing.
    InProgress,
    /// Completed successfully.
    Success,
    /// Completed with an error.
    Failed,
    /// Aborted by deadline.
    Timeout,
}

impl AttemptStatus {
    /// Whether the attempt has settled one way or the other.
    pub fn is_settled(self) -> bool {
        matches!(
            self,
            AttemptStatus::Success | AttemptStatus::Failed | AttemptStatus::Timeout
        )
    }
}

/// One forward action taken for a relay. Append-only: attempts are never
/// mutated except to settle their own status, and `(relay_id,
/// attempt_number)` is unique with `attempt_number` monotonic from 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayAttempt {
    /// Generated identifier.
    pub id: String,
    /// The relay this attempt belongs to.
    pub relay_id: String,
    /// Monotonic per relay, starting at 1.
    pub attempt_number: u32,
    /// What this attempt does.
    pub action: AttemptAction,
    /// Where the attempt currently stands.
    pub status: AttemptStatus,
    /// Start time, milliseconds since epoch.
    pub started_at: i64,
    /// Settle time; `None` while pending or in progress. When set, never
    /// before `started_at`.
    pub completed_at: Option<i64>,
    /// Transaction hash when the attempt reached a chain.
    pub tx_hash: Option<String>,
    /// Error text when the attempt failed.
    pub error_message: Option<String>,
    /// Gas consumed by the transaction, when known.
    pub gas_used: Option<u64>,
    /// Free-form diagnostics.
    pub metadata: Option<serde_json::Value>,
}

impl RelayAttempt {
    /// Open a new in-progress attempt for `relay_id`.
    pub fn begin(relay_id: impl Into<String>, attempt_number: u32, action: AttemptAction) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            relay_id: relay_id.into(),
            attempt_number,
            action,
            status: AttemptStatus::InProgress,
            started_at: now_millis(),
            completed_at: None,
            tx_hash: None,
            error_message: None,
            gas_used: None,
            metadata: None,
        }
    }

    /// Settle this attempt, clamping `completed_at` to `started_at`.
    pub fn settle(&mut self, status: AttemptStatus) {
        debug_assert!(status.is_settled());
        self.status = status;
        self.completed_at = Some(now_millis().max(self.started_at));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn settle_never_precedes_start() {
        let mut attempt = RelayAttempt::begin("r1", 1, AttemptAction::LockTarget);
        attempt.started_at = now_millis() + 5_000;
        attempt.settle(AttemptStatus::Failed);
        assert!(attempt.completed_at.unwrap() >= attempt.started_at);
    }

    #[test]
    fn action_names_are_stable() {
        assert_eq!(AttemptAction::RouteDiscovery.to_string(), "route_discovery");
        assert_eq!(AttemptAction::LockTarget.to_string(), "lock_target");
        assert_eq!(AttemptAction::RevealSecret.to_string(), "reveal_secret");
        assert_eq!(AttemptAction::Refund.to_string(), "refund");
    }
}
