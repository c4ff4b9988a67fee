use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::ChainResult;

/// On-chain lifecycle of an HTLC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HtlcState {
    /// Funds locked, preimage not yet revealed.
    Open,
    /// Preimage revealed, funds released to the recipient.
    Withdrawn,
    /// Timelock elapsed, funds returned to the sender.
    Refunded,
}

/// Parameters for locking a new HTLC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcParams {
    /// Caller-chosen handle; `create_htlc` is idempotent per handle.
    pub htlc_id: String,
    /// Locking party.
    pub sender: String,
    /// Receiving party.
    pub recipient: String,
    /// Decimal amount string.
    pub amount: String,
    /// Token denomination or contract address.
    pub token: String,
    /// Hash of the secret, hex-encoded.
    pub hashlock: String,
    /// Absolute expiry, seconds since epoch.
    pub timelock: i64,
}

/// What a chain reports about an existing HTLC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HtlcDetails {
    /// On-chain handle.
    pub htlc_id: String,
    /// Current lifecycle state.
    pub state: HtlcState,
    /// Locking party.
    pub sender: String,
    /// Receiving party.
    pub recipient: String,
    /// Decimal amount string.
    pub amount: String,
    /// Token denomination or contract address.
    pub token: String,
    /// Hash of the secret, hex-encoded.
    pub hashlock: String,
    /// Absolute expiry, seconds since epoch.
    pub timelock: i64,
    /// The revealed secret, present once withdrawn.
    pub preimage: Option<String>,
}

/// Outcome of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Transaction hash.
    pub tx_hash: String,
    /// Block the transaction landed in.
    pub block_number: u64,
    /// Gas consumed, when the chain reports it.
    pub gas_used: Option<u64>,
    /// Whether execution succeeded.
    pub success: bool,
}

/// Head of a chain as seen by its RPC.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChainTip {
    /// Tip height or block number.
    pub height: u64,
    /// Tip timestamp, seconds since epoch.
    pub timestamp: i64,
}

/// A client for one chain. Implementations live outside this workspace (EVM
/// signer, Cosmos signer, DEX routing); the engine only depends on this
/// contract.
///
/// Every method is fallible and must be idempotent given the HTLC handle:
/// re-submitting `create_htlc` or `withdraw` for a handle that already
/// settled returns the original outcome rather than a duplicate transaction.
/// Callers bound each call with a deadline (`tokio::time::timeout`); an
/// implementation must tolerate being cancelled at any await point.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Identifier of the chain this client talks to.
    fn chain_id(&self) -> &str;

    /// Lock a new HTLC.
    async fn create_htlc(&self, params: &HtlcParams) -> ChainResult<TxReceipt>;

    /// Look up an HTLC; `Ok(None)` when the handle is unknown.
    async fn get_htlc(&self, htlc_id: &str) -> ChainResult<Option<HtlcDetails>>;

    /// Reveal the preimage and release funds.
    async fn withdraw(&self, htlc_id: &str, preimage: &str) -> ChainResult<TxReceipt>;

    /// Refund an expired HTLC.
    async fn refund(&self, htlc_id: &str) -> ChainResult<TxReceipt>;

    /// Current chain head.
    async fn get_tip(&self) -> ChainResult<ChainTip>;

    /// Receipt for a previously-submitted transaction; `Ok(None)` while still
    /// pending.
    async fn get_receipt(&self, tx_hash: &str) -> ChainResult<Option<TxReceipt>>;
}
