//! Chain access for the engine: pooled client sessions behind the throttled
//! executor and circuit breakers.
//!
//! Concrete client implementations (EVM signer, Cosmos signer, DEX routing)
//! live outside this workspace. The gateway only needs a factory that dials
//! one endpoint and yields something implementing
//! [`fusion_core::ChainClient`]; an in-process simulator is provided for
//! local development.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tracing::warn;

use fusion_base::settings::Settings;
use fusion_base::{
    BreakerRegistry, ConnError, ConnectionPool, Connector, EndpointConf, Priority,
    ThrottleError, ThrottledExecutor,
};
use fusion_core::{
    time::now_secs, ChainClient, ChainError, ChainResult, ChainTip, HtlcDetails, HtlcParams,
    HtlcState, TxReceipt,
};

/// Dials one endpoint and yields a client session for it.
pub type ClientFactory =
    Arc<dyn Fn(EndpointConf) -> BoxFuture<'static, ChainResult<Arc<dyn ChainClient>>> + Send + Sync>;

/// [`Connector`] over a [`ClientFactory`]; the probe is a tip query.
pub struct ClientConnector {
    factory: ClientFactory,
}

#[async_trait::async_trait]
impl Connector for ClientConnector {
    type Conn = Arc<dyn ChainClient>;

    async fn connect(&self, endpoint: &EndpointConf) -> Result<Self::Conn, ConnError> {
        (self.factory)(endpoint.clone())
            .await
            .map_err(|err| ConnError::Endpoint {
                endpoint: endpoint.name(),
                message: err.to_string(),
            })
    }

    async fn probe(&self, conn: &mut Self::Conn) -> Result<(), ConnError> {
        conn.get_tip()
            .await
            .map(drop)
            .map_err(|err| ConnError::Endpoint {
                endpoint: conn.chain_id().to_string(),
                message: err.to_string(),
            })
    }
}

enum Category {
    Read,
    Write,
}

impl Category {
    fn label(&self) -> &'static str {
        match self {
            Category::Read => "read",
            Category::Write => "write",
        }
    }

    fn priority(&self) -> Priority {
        match self {
            Category::Read => Priority::Medium,
            Category::Write => Priority::High,
        }
    }
}

/// One chain as the engine sees it: pooled sessions, throttling, breakers.
pub struct ChainGateway {
    chain_id: String,
    pool: Arc<ConnectionPool<ClientConnector>>,
    throttler: ThrottledExecutor,
    breakers: Arc<BreakerRegistry>,
}

impl std::fmt::Debug for ChainGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainGateway")
            .field("chain_id", &self.chain_id)
            .finish_non_exhaustive()
    }
}

impl ChainGateway {
    /// A gateway over arbitrary endpoints and a dialing factory.
    pub fn new(
        chain_id: impl Into<String>,
        endpoints: Vec<EndpointConf>,
        pool_config: fusion_base::PoolConf,
        factory: ClientFactory,
        throttler: ThrottledExecutor,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let chain_id = chain_id.into();
        let pool = Arc::new(ConnectionPool::new(
            chain_id.clone(),
            ClientConnector { factory },
            endpoints,
            pool_config,
        ));
        Self {
            chain_id,
            pool,
            throttler,
            breakers,
        }
    }

    /// A gateway over a single already-constructed client; used by tests and
    /// embedders that wire their own transport.
    pub fn with_client(
        chain_id: impl Into<String>,
        client: Arc<dyn ChainClient>,
        throttler: ThrottledExecutor,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        let endpoint = EndpointConf {
            host: "in-process".into(),
            port: 1,
            username: None,
            password: None,
            priority: 1,
            weight: None,
            readonly: false,
        };
        let factory: ClientFactory = Arc::new(move |_| {
            let client = Arc::clone(&client);
            Box::pin(async move { Ok(client) })
        });
        Self::new(
            chain_id,
            vec![endpoint],
            fusion_base::PoolConf::default(),
            factory,
            throttler,
            breakers,
        )
    }

    /// Chain identifier.
    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    /// Underlying pool, for health-loop spawning and metrics export.
    pub fn pool(&self) -> Arc<ConnectionPool<ClientConnector>> {
        Arc::clone(&self.pool)
    }

    async fn call<T, F>(&self, category: Category, deadline: Duration, op: F) -> ChainResult<T>
    where
        T: Send,
        F: Fn(Arc<dyn ChainClient>) -> BoxFuture<'static, ChainResult<T>> + Send + Sync,
    {
        // Writes surface every failure so the engine can record it as an
        // attempt; read polls lean on the executor's own retry budget.
        let retries = match category {
            Category::Read => 3,
            Category::Write => 0,
        };
        let outcome = self
            .throttler
            .execute_with_retries(category.priority(), deadline, retries, || async {
                let mut session = match category {
                    Category::Read => self.pool.acquire_read().await,
                    Category::Write => self.pool.acquire_write().await,
                }
                .map_err(map_conn_err)?;

                let breaker_name =
                    format!("{}:{}:{}", self.chain_id, session.endpoint_name(), category.label());
                let breaker = self
                    .breakers
                    .get(&breaker_name)
                    .await
                    .map_err(|err| ChainError::ServiceUnavailable(err.to_string()))?;
                // Fail fast while the window is open; no RPC leaves the
                // process.
                breaker
                    .try_call()
                    .map_err(|err| ChainError::ServiceUnavailable(err.to_string()))?;

                let client = Arc::clone(&*session);
                let result = tokio::time::timeout(deadline, op(client)).await;
                match result {
                    Ok(Ok(value)) => {
                        breaker.on_success();
                        Ok(value)
                    }
                    Ok(Err(err)) => {
                        // Semantic rejections mean the service is healthy;
                        // they do not trip the breaker.
                        if !matches!(err, ChainError::Rejected(_)) {
                            breaker.on_failure();
                        }
                        if matches!(err, ChainError::Connection(_)) {
                            session.mark_broken();
                        }
                        Err(err)
                    }
                    Err(_) => {
                        breaker.on_failure();
                        session.mark_broken();
                        Err(ChainError::Timeout(deadline))
                    }
                }
            })
            .await;
        outcome.map_err(map_throttle_err)
    }

    /// Lock a new HTLC.
    pub async fn create_htlc(&self, params: &HtlcParams, deadline: Duration) -> ChainResult<TxReceipt> {
        let params = params.clone();
        self.call(Category::Write, deadline, move |client| {
            let params = params.clone();
            Box::pin(async move { client.create_htlc(&params).await })
        })
        .await
    }

    /// Look up an HTLC.
    pub async fn get_htlc(&self, htlc_id: &str, deadline: Duration) -> ChainResult<Option<HtlcDetails>> {
        let htlc_id = htlc_id.to_string();
        self.call(Category::Read, deadline, move |client| {
            let htlc_id = htlc_id.clone();
            Box::pin(async move { client.get_htlc(&htlc_id).await })
        })
        .await
    }

    /// Reveal the preimage.
    pub async fn withdraw(
        &self,
        htlc_id: &str,
        preimage: &str,
        deadline: Duration,
    ) -> ChainResult<TxReceipt> {
        let htlc_id = htlc_id.to_string();
        let preimage = preimage.to_string();
        self.call(Category::Write, deadline, move |client| {
            let htlc_id = htlc_id.clone();
            let preimage = preimage.clone();
            Box::pin(async move { client.withdraw(&htlc_id, &preimage).await })
        })
        .await
    }

    /// Refund an expired HTLC.
    pub async fn refund(&self, htlc_id: &str, deadline: Duration) -> ChainResult<TxReceipt> {
        let htlc_id = htlc_id.to_string();
        self.call(Category::Write, deadline, move |client| {
            let htlc_id = htlc_id.clone();
            Box::pin(async move { client.refund(&htlc_id).await })
        })
        .await
    }

    /// Current chain head.
    pub async fn get_tip(&self, deadline: Duration) -> ChainResult<ChainTip> {
        self.call(Category::Read, deadline, move |client| {
            Box::pin(async move { client.get_tip().await })
        })
        .await
    }
}

fn map_conn_err(err: ConnError) -> ChainError {
    match err {
        ConnError::NoHealthyEndpoint(pool) => ChainError::NoHealthyEndpoint(pool),
        ConnError::AcquireTimeout(d) => ChainError::Timeout(d),
        other => ChainError::Connection(other.to_string()),
    }
}

fn map_throttle_err(err: ThrottleError) -> ChainError {
    match err {
        ThrottleError::Failed(inner) => inner,
        ThrottleError::QueueFull => ChainError::ServiceUnavailable("throttle queue full".into()),
        ThrottleError::QueueTimeout(d) => ChainError::Timeout(d),
        ThrottleError::Shutdown => ChainError::Connection("throttled executor shut down".into()),
    }
}

/// Build the gateway map from settings. Chains marked `simulated` get the
/// in-process simulator; anything else must be injected by the embedder.
pub fn build_gateways(
    settings: &Settings,
    throttler: &ThrottledExecutor,
    breakers: &Arc<BreakerRegistry>,
) -> eyre::Result<HashMap<String, Arc<ChainGateway>>> {
    let mut gateways = HashMap::new();
    for (chain_id, chain) in &settings.chains {
        if !chain.simulated {
            eyre::bail!(
                "no chain client implementation linked for `{chain_id}`; \
                 mark it `simulated` for local runs or construct the relayer \
                 with injected clients"
            );
        }
        let simulator = SimulatedChainClient::new(chain_id, Duration::from_secs(5));
        let factory: ClientFactory = Arc::new(move |_| {
            let client: Arc<dyn ChainClient> = Arc::new(simulator.clone());
            Box::pin(async move { Ok(client) })
        });
        warn!(chain_id, "running against the in-process chain simulator");
        gateways.insert(
            chain_id.clone(),
            Arc::new(ChainGateway::new(
                chain_id.clone(),
                chain.endpoints.clone(),
                chain.pool,
                factory,
                throttler.clone(),
                Arc::clone(breakers),
            )),
        );
    }
    Ok(gateways)
}

#[derive(Default)]
struct SimulatedLedger {
    htlcs: HashMap<String, (HtlcDetails, i64)>,
    tx_seq: u64,
}

/// In-process HTLC ledger for local development. Open HTLCs are auto-claimed
/// after `claim_delay`, standing in for the counterparty revealing the
/// secret.
#[derive(Clone)]
pub struct SimulatedChainClient {
    chain_id: Arc<String>,
    claim_delay: Duration,
    ledger: Arc<Mutex<SimulatedLedger>>,
}

impl SimulatedChainClient {
    /// A simulator for `chain_id`.
    pub fn new(chain_id: &str, claim_delay: Duration) -> Self {
        Self {
            chain_id: Arc::new(chain_id.to_string()),
            claim_delay,
            ledger: Arc::new(Mutex::new(SimulatedLedger::default())),
        }
    }

    fn receipt(ledger: &mut SimulatedLedger, success: bool) -> TxReceipt {
        ledger.tx_seq += 1;
        TxReceipt {
            tx_hash: format!("0xsim{:060x}", ledger.tx_seq),
            block_number: 10_000 + ledger.tx_seq,
            gas_used: Some(50_000),
            success,
        }
    }
}

#[async_trait::async_trait]
impl ChainClient for SimulatedChainClient {
    fn chain_id(&self) -> &str {
        &self.chain_id
    }

    async fn create_htlc(&self, params: &HtlcParams) -> ChainResult<TxReceipt> {
        let mut ledger = self.ledger.lock();
        if ledger.htlcs.contains_key(&params.htlc_id) {
            let receipt = Self::receipt(&mut ledger, true);
            return Ok(receipt);
        }
        let details = HtlcDetails {
            htlc_id: params.htlc_id.clone(),
            state: HtlcState::Open,
            sender: params.sender.clone(),
            recipient: params.recipient.clone(),
            amount: params.amount.clone(),
            token: params.token.clone(),
            hashlock: params.hashlock.clone(),
            timelock: params.timelock,
            preimage: None,
        };
        ledger.htlcs.insert(params.htlc_id.clone(), (details, now_secs()));
        let receipt = Self::receipt(&mut ledger, true);
        Ok(receipt)
    }

    async fn get_htlc(&self, htlc_id: &str) -> ChainResult<Option<HtlcDetails>> {
        let mut ledger = self.ledger.lock();
        let claim_delay = self.claim_delay.as_secs() as i64;
        if let Some((details, created)) = ledger.htlcs.get_mut(htlc_id) {
            if details.state == HtlcState::Open && now_secs() - *created >= claim_delay {
                details.state = HtlcState::Withdrawn;
                details.preimage = Some(format!("sim-preimage-{}", details.hashlock));
            }
            return Ok(Some(details.clone()));
        }
        Ok(None)
    }

    async fn withdraw(&self, htlc_id: &str, preimage: &str) -> ChainResult<TxReceipt> {
        let mut ledger = self.ledger.lock();
        match ledger.htlcs.get_mut(htlc_id).map(|(d, _)| d) {
            Some(details) if details.state != HtlcState::Refunded => {
                details.state = HtlcState::Withdrawn;
                details.preimage = Some(preimage.to_string());
                let receipt = Self::receipt(&mut ledger, true);
                Ok(receipt)
            }
            Some(_) => Err(ChainError::Rejected(format!("htlc {htlc_id} refunded"))),
            None => Err(ChainError::Rejected(format!("unknown htlc {htlc_id}"))),
        }
    }

    async fn refund(&self, htlc_id: &str) -> ChainResult<TxReceipt> {
        let mut ledger = self.ledger.lock();
        match ledger.htlcs.get_mut(htlc_id).map(|(d, _)| d) {
            Some(details) if details.state != HtlcState::Withdrawn => {
                details.state = HtlcState::Refunded;
                let receipt = Self::receipt(&mut ledger, true);
                Ok(receipt)
            }
            Some(_) => Err(ChainError::Rejected(format!("htlc {htlc_id} withdrawn"))),
            None => Err(ChainError::Rejected(format!("unknown htlc {htlc_id}"))),
        }
    }

    async fn get_tip(&self) -> ChainResult<ChainTip> {
        let seq = self.ledger.lock().tx_seq;
        Ok(ChainTip {
            height: 10_000 + seq,
            timestamp: now_secs(),
        })
    }

    async fn get_receipt(&self, _tx_hash: &str) -> ChainResult<Option<TxReceipt>> {
        // The simulator confirms instantly; receipts are not retained.
        Ok(None)
    }
}
