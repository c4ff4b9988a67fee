use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::time::now_millis;

/// Lifecycle state of a relay.
///
/// `Completed`, `Failed`, `Expired` and `Refunded` are terminal and
/// absorbing. `Expired` is only a waypoint on the way to `Refunded` when the
/// refund transaction is still outstanding, but it is terminal for the
/// forward path: no forward action is ever issued for an expired relay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelayStatus {
    /// Observed on the source chain, no work started yet.
    Pending,
    /// Route discovery in progress.
    Routing,
    /// Locking the mirror HTLC on the target chain.
    Executing,
    /// Target HTLC locked; revealing the preimage and waiting for finality.
    Confirming,
    /// Every hop settled; funds released.
    Completed,
    /// Hard failure before the timelock; no funds are at risk.
    Failed,
    /// Timelock window closed while non-terminal.
    Expired,
    /// Source HTLC refunded after expiry.
    Refunded,
}

impl RelayStatus {
    /// Whether this status admits no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RelayStatus::Completed
                | RelayStatus::Failed
                | RelayStatus::Expired
                | RelayStatus::Refunded
        )
    }

    /// The set of states a worker may lease and drive forward.
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Valid transition targets from this state.
    ///
    /// `Expired` still admits `Refunded`: expiry is recorded first, the
    /// refund transaction lands after.
    pub fn can_transition_to(self, next: RelayStatus) -> bool {
        use RelayStatus::*;
        match self {
            Pending => matches!(next, Routing | Failed | Expired),
            Routing => matches!(next, Executing | Failed | Expired),
            Executing => matches!(next, Confirming | Failed | Expired),
            Confirming => matches!(next, Completed | Failed | Expired),
            Expired => matches!(next, Refunded),
            Completed | Failed | Refunded => false,
        }
    }
}

/// One chain-to-chain leg of a multi-hop swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteHop {
    /// Chain the funds leave.
    pub from_chain: String,
    /// Chain the funds arrive on.
    pub to_chain: String,
    /// Transport channel for this leg, when the route goes over IBC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

/// The root entity: one cross-chain swap being relayed.
///
/// Relays are created by the upstream observer when it detects a source-chain
/// HTLC, mutated only by the relay engine, and removed only by archival after
/// reaching a terminal state and passing retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relay {
    /// Opaque identifier, stable across restarts.
    pub id: String,
    /// Chain the source HTLC lives on.
    pub source_chain: String,
    /// Chain the mirror HTLC must be driven on.
    pub target_chain: String,
    /// On-chain handle of the source HTLC.
    pub htlc_id: String,
    /// Source-chain sender address.
    pub sender: String,
    /// Final recipient address on the target chain.
    pub recipient: String,
    /// Decimal amount string, as reported by the chain client.
    pub amount: String,
    /// Token denomination or contract address.
    pub token: String,
    /// Hash of the secret, hex-encoded.
    pub hashlock: String,
    /// Absolute expiry of the source HTLC, seconds since epoch.
    pub timelock: i64,
    /// Ordered hop list from source to target.
    pub route: Vec<RouteHop>,
    /// Current lifecycle state.
    pub status: RelayStatus,
    /// Creation time, milliseconds since epoch.
    pub created_at: i64,
    /// Last mutation time, milliseconds since epoch. Never before
    /// `created_at`.
    pub updated_at: i64,
    /// Total retries across all actions.
    pub retry_count: u32,
    /// Most recent error recorded against this relay.
    pub last_error: Option<String>,
    /// Free-form metadata carried from the observer.
    pub metadata: serde_json::Value,
}

impl Relay {
    /// A fresh `pending` relay as the observer would submit it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        source_chain: impl Into<String>,
        target_chain: impl Into<String>,
        htlc_id: impl Into<String>,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: impl Into<String>,
        token: impl Into<String>,
        hashlock: impl Into<String>,
        timelock: i64,
        route: Vec<RouteHop>,
    ) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            source_chain: source_chain.into(),
            target_chain: target_chain.into(),
            htlc_id: htlc_id.into(),
            sender: sender.into(),
            recipient: recipient.into(),
            amount: amount.into(),
            token: token.into(),
            hashlock: hashlock.into(),
            timelock,
            route,
            status: RelayStatus::Pending,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            last_error: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Whether the refund window has opened: `now_secs >= timelock - buffer`.
    ///
    /// A timelock exactly equal to `now` counts as expired.
    pub fn refund_due(&self, now_secs: i64, refund_buffer_secs: i64) -> bool {
        now_secs >= self.timelock - refund_buffer_secs
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn terminal_states_are_absorbing() {
        for from in RelayStatus::iter().filter(|s| s.is_terminal()) {
            for to in RelayStatus::iter() {
                if from == RelayStatus::Expired && to == RelayStatus::Refunded {
                    continue;
                }
                assert!(!from.can_transition_to(to), "{from} -> {to} must not be legal");
            }
        }
    }

    #[test]
    fn forward_path_is_legal() {
        use RelayStatus::*;
        let path = [Pending, Routing, Executing, Confirming, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]));
        }
    }

    #[test]
    fn every_active_state_can_expire() {
        use RelayStatus::*;
        for s in [Pending, Routing, Executing, Confirming] {
            assert!(s.can_transition_to(Expired));
        }
        assert!(Expired.can_transition_to(Refunded));
    }

    #[test]
    fn status_round_trips_through_snake_case() {
        for s in RelayStatus::iter() {
            let text = s.to_string();
            assert_eq!(text, text.to_lowercase());
            assert_eq!(text.parse::<RelayStatus>().unwrap(), s);
        }
    }

    #[test]
    fn timelock_equal_to_now_is_expired() {
        let relay = Relay::new(
            "r1", "evm", "osmosis", "0xabc", "alice", "bob", "100", "uatom", "deadbeef", 1_700_000_000,
            vec![],
        );
        assert!(relay.refund_due(1_700_000_000, 0));
        assert!(!relay.refund_due(1_699_999_999, 0));
        assert!(relay.refund_due(1_699_999_700, 300));
    }
}
