use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use fusion_core::{
    time::now_secs, ChainClient, ChainError, ChainResult, ChainTip, HtlcDetails, HtlcParams,
    HtlcState, TxReceipt,
};

/// Operations on a [`MockChainClient`] that can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainOp {
    /// `create_htlc`
    CreateHtlc,
    /// `get_htlc`
    GetHtlc,
    /// `withdraw`
    Withdraw,
    /// `refund`
    Refund,
    /// `get_tip`
    GetTip,
    /// `get_receipt`
    GetReceipt,
}

#[derive(Default)]
struct MockState {
    htlcs: HashMap<String, HtlcDetails>,
    receipts: HashMap<String, TxReceipt>,
    errors: HashMap<ChainOp, VecDeque<ChainError>>,
    stalled: HashMap<ChainOp, bool>,
    calls: HashMap<ChainOp, u32>,
    tx_seq: u64,
}

/// A scripted chain client: succeeds by default, keeping an in-memory HTLC
/// ledger, and pops injected errors per operation first. Operations can also
/// be stalled indefinitely to exercise deadlines.
#[derive(Clone, Default)]
pub struct MockChainClient {
    chain_id: Arc<String>,
    state: Arc<Mutex<MockState>>,
}

impl MockChainClient {
    /// A client for `chain_id`.
    pub fn new(chain_id: &str) -> Self {
        Self {
            chain_id: Arc::new(chain_id.to_string()),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Queue an error for the next call to `op`.
    pub fn inject_error(&self, op: ChainOp, err: ChainError) {
        self.state.lock().errors.entry(op).or_default().push_back(err);
    }

    /// Make every call to `op` hang until cancelled by deadline.
    pub fn stall(&self, op: ChainOp, stalled: bool) {
        self.state.lock().stalled.insert(op, stalled);
    }

    /// How many times `op` was invoked.
    pub fn calls(&self, op: ChainOp) -> u32 {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Pre-seed an HTLC, as if the observer had watched it get locked.
    pub fn seed_htlc(&self, details: HtlcDetails) {
        self.state
            .lock()
            .htlcs
            .insert(details.htlc_id.clone(), details);
    }

    /// Inspect an HTLC on the mock ledger.
    pub fn htlc(&self, htlc_id: &str) -> Option<HtlcDetails> {
        self.state.lock().htlcs.get(htlc_id).cloned()
    }

    async fn enter(&self, op: ChainOp) -> ChainResult<()> {
        let (stalled, injected) = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_insert(0) += 1;
            let stalled = state.stalled.get(&op).copied().unwrap_or(false);
            let injected = state.errors.get_mut(&op).and_then(VecDeque::pop_front);
            (stalled, injected)
        };
        if stalled {
            // Held until the caller's deadline cancels us.
            tokio::time::sleep(Duration::from_secs(86_400)).await;
        }
        match injected {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn receipt(&self, success: bool) -> TxReceipt {
        let mut state = self.state.lock();
        state.tx_seq += 1;
        let receipt = TxReceipt {
            tx_hash: format!("0x{:064x}", state.tx_seq),
            block_number: 1_000 + state.tx_seq,
            gas_used: Some(21_000 + state.tx_seq),
            success,
        };
        state
            .receipts
            .insert(receipt.tx_hash.clone(), receipt.clone());
        receipt
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn create_htlc(&self, params: &HtlcParams) -> ChainResult<TxReceipt> {
        self.enter(ChainOp::CreateHtlc).await?;
        let receipt = self.receipt(true);
        let mut state = self.state.lock();
        // Idempotent per handle: a second create returns the first outcome.
        if let Some(existing) = state.htlcs.get(&params.htlc_id) {
            if existing.state != HtlcState::Open {
                return Err(ChainError::Rejected(format!(
                    "htlc {} already settled",
                    params.htlc_id
                )));
            }
        }
        state.htlcs.insert(
            params.htlc_id.clone(),
            HtlcDetails {
                htlc_id: params.htlc_id.clone(),
                state: HtlcState::Open,
                sender: params.sender.clone(),
                recipient: params.recipient.clone(),
                amount: params.amount.clone(),
                token: params.token.clone(),
                hashlock: params.hashlock.clone(),
                timelock: params.timelock,
                preimage: None,
            },
        );
        Ok(receipt)
    }

    async fn get_htlc(&self, htlc_id: &str) -> ChainResult<Option<HtlcDetails>> {
        self.enter(ChainOp::GetHtlc).await?;
        Ok(self.state.lock().htlcs.get(htlc_id).cloned())
    }

    async fn withdraw(&self, htlc_id: &str, preimage: &str) -> ChainResult<TxReceipt> {
        self.enter(ChainOp::Withdraw).await?;
        let receipt = self.receipt(true);
        let mut state = self.state.lock();
        match state.htlcs.get_mut(htlc_id) {
            Some(htlc) if htlc.state == HtlcState::Open => {
                htlc.state = HtlcState::Withdrawn;
                htlc.preimage = Some(preimage.to_string());
                Ok(receipt)
            }
            Some(htlc) if htlc.state == HtlcState::Withdrawn => Ok(receipt),
            Some(_) => Err(ChainError::Rejected(format!("htlc {htlc_id} refunded"))),
            None => Err(ChainError::Rejected(format!("unknown htlc {htlc_id}"))),
        }
    }

    async fn refund(&self, htlc_id: &str) -> ChainResult<TxReceipt> {
        self.enter(ChainOp::Refund).await?;
        let receipt = self.receipt(true);
        let mut state = self.state.lock();
        match state.htlcs.get_mut(htlc_id) {
            Some(htlc) if htlc.state == HtlcState::Open => {
                htlc.state = HtlcState::Refunded;
                Ok(receipt)
            }
            Some(htlc) if htlc.state == HtlcState::Refunded => Ok(receipt),
            Some(_) => Err(ChainError::Rejected(format!("htlc {htlc_id} withdrawn"))),
            None => Err(ChainError::Rejected(format!("unknown htlc {htlc_id}"))),
        }
    }

    async fn get_tip(&self) -> ChainResult<ChainTip> {
        self.enter(ChainOp::GetTip).await?;
        let seq = self.state.lock().tx_seq;
        Ok(ChainTip {
            height: 1_000 + seq,
            timestamp: now_secs(),
        })
    }

    async fn get_receipt(&self, tx_hash: &str) -> ChainResult<Option<TxReceipt>> {
        self.enter(ChainOp::GetReceipt).await?;
        Ok(self.state.lock().receipts.get(tx_hash).cloned())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn injected_errors_pop_in_order() {
        let chain = MockChainClient::new("testnet");
        chain.inject_error(ChainOp::GetTip, ChainError::RateLimit("slow down".into()));
        assert!(matches!(
            chain.get_tip().await,
            Err(ChainError::RateLimit(_))
        ));
        assert!(chain.get_tip().await.is_ok());
        assert_eq!(chain.calls(ChainOp::GetTip), 2);
    }

    #[tokio::test]
    async fn htlc_lifecycle_on_the_mock_ledger() {
        let chain = MockChainClient::new("testnet");
        let params = HtlcParams {
            htlc_id: "h1".into(),
            sender: "alice".into(),
            recipient: "bob".into(),
            amount: "10".into(),
            token: "uatom".into(),
            hashlock: "aa".into(),
            timelock: 2_000_000_000,
        };
        chain.create_htlc(&params).await.unwrap();
        chain.withdraw("h1", "secret").await.unwrap();
        let details = chain.htlc("h1").unwrap();
        assert_eq!(details.state, HtlcState::Withdrawn);
        assert_eq!(details.preimage.as_deref(), Some("secret"));
        // Refund after withdraw is a chain-level rejection.
        assert!(matches!(
            chain.refund("h1").await,
            Err(ChainError::Rejected(_))
        ));
    }
}
