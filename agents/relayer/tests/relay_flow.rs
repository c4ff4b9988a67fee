//! End-to-end relay scenarios against the in-memory store and the scripted
//! chain client: happy path, transient chain failures, hard rejects,
//! timelock refunds, and crash recovery.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use prometheus::Registry;

use fusion_base::settings::{
    ArchivalConf, ChainConf, EngineConf, MonitorConf, Settings, TracingConfig,
};
use fusion_base::{
    BreakerConfig, BreakerRegistry, CoreMetrics, EndpointConf, PoolConf, ThrottleConfig,
    ThrottledExecutor,
};
use fusion_core::time::now_secs;
use fusion_core::{
    AttemptAction, AttemptStatus, ChainClient, ChainError, HtlcDetails, HtlcState, RelayAttempt,
    RelayStatus,
};
use fusion_store::RelayStore;
use fusion_test::{sample_relay, ChainOp, MockChainClient, MemoryStore};
use relayer::chains::ChainGateway;
use relayer::engine::{EngineMetrics, RelayEngine};

const SOURCE: &str = "ethereum";
const TARGET: &str = "osmosis-1";

struct Harness {
    store: Arc<MemoryStore>,
    source: MockChainClient,
    target: MockChainClient,
    engine: Arc<RelayEngine>,
}

fn chain_conf(refund_buffer_secs: i64) -> ChainConf {
    ChainConf {
        endpoints: vec![EndpointConf {
            host: "in-process".into(),
            port: 1,
            username: None,
            password: None,
            priority: 1,
            weight: None,
            readonly: false,
        }],
        pool: PoolConf::default(),
        refund_buffer_secs,
        simulated: false,
    }
}

fn test_settings(refund_buffer_secs: i64) -> Settings {
    let mut chains = HashMap::new();
    chains.insert(SOURCE.to_string(), chain_conf(refund_buffer_secs));
    chains.insert(TARGET.to_string(), chain_conf(refund_buffer_secs));
    Settings {
        store: serde_json::from_value(serde_json::json!({
            "mode": "postgres",
            "postgres": { "url": "postgres://unused/test" },
        }))
        .unwrap(),
        chains,
        engine: EngineConf {
            workers: 2,
            lease_ttl_secs: 5,
            poll_interval_ms: 10,
            max_action_retries: 5,
            retry_base_ms: 10,
            retry_multiplier: 2.0,
            retry_max_delay_ms: 100,
            action_timeout_secs: 5,
        },
        throttle: ThrottleConfig {
            default_delay_ms: 0,
            ..ThrottleConfig::default()
        },
        monitor: MonitorConf::default(),
        archival: ArchivalConf::default(),
        metrics_port: 0,
        tracing: TracingConfig::default(),
    }
}

fn harness(refund_buffer_secs: i64) -> Harness {
    let settings = test_settings(refund_buffer_secs);
    let store = Arc::new(MemoryStore::default());
    let source = MockChainClient::new(SOURCE);
    let target = MockChainClient::new(TARGET);

    let throttler = ThrottledExecutor::new(settings.throttle);
    let breakers = Arc::new(BreakerRegistry::new(
        Arc::clone(&store) as Arc<dyn RelayStore>,
        BreakerConfig::default(),
    ));
    let mut gateways = HashMap::new();
    gateways.insert(
        SOURCE.to_string(),
        Arc::new(ChainGateway::with_client(
            SOURCE,
            Arc::new(source.clone()),
            throttler.clone(),
            Arc::clone(&breakers),
        )),
    );
    gateways.insert(
        TARGET.to_string(),
        Arc::new(ChainGateway::with_client(
            TARGET,
            Arc::new(target.clone()),
            throttler.clone(),
            Arc::clone(&breakers),
        )),
    );

    let metrics = CoreMetrics::new("relayer-test", None, Registry::new()).unwrap();
    let engine = Arc::new(RelayEngine::new(
        Arc::clone(&store) as Arc<dyn RelayStore>,
        gateways,
        &settings,
        EngineMetrics::new(&metrics),
    ));
    Harness {
        store,
        source,
        target,
        engine,
    }
}

fn seed_source_htlc(harness: &Harness, relay: &fusion_core::Relay) {
    harness.source.seed_htlc(HtlcDetails {
        htlc_id: relay.htlc_id.clone(),
        state: HtlcState::Open,
        sender: relay.sender.clone(),
        recipient: relay.recipient.clone(),
        amount: relay.amount.clone(),
        token: relay.token.clone(),
        hashlock: relay.hashlock.clone(),
        timelock: relay.timelock,
        preimage: None,
    });
}

async fn wait_for_status(
    store: &MemoryStore,
    id: &str,
    status: RelayStatus,
) -> fusion_core::Relay {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            if let Some(relay) = store.get_relay(id).await.unwrap() {
                if relay.status == status {
                    return relay;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("relay `{id}` never reached {status}"))
}

fn attempts_for(attempts: &[RelayAttempt], action: AttemptAction) -> Vec<&RelayAttempt> {
    attempts.iter().filter(|a| a.action == action).collect()
}

#[tokio::test]
async fn happy_path_completes_with_one_attempt_per_action() {
    let h = harness(300);
    let _workers = Arc::clone(&h.engine).spawn_workers();

    let relay = sample_relay("hp-1", now_secs() + 3_600);
    seed_source_htlc(&h, &relay);
    h.engine.submit(relay.clone()).await.unwrap();

    // The engine locks the mirror HTLC, then waits for the counterparty.
    wait_for_status(&h.store, "hp-1", RelayStatus::Confirming).await;
    let target_id = format!("{}-target", relay.id);
    assert_eq!(h.target.htlc(&target_id).unwrap().state, HtlcState::Open);

    // Counterparty claims on the target chain, revealing the secret.
    h.target.withdraw(&target_id, "s3cret").await.unwrap();

    let done = wait_for_status(&h.store, "hp-1", RelayStatus::Completed).await;
    assert!(done.status.is_terminal());
    assert_eq!(done.retry_count, 0);

    // The source HTLC was collected with the revealed preimage.
    let source_htlc = h.source.htlc(&relay.htlc_id).unwrap();
    assert_eq!(source_htlc.state, HtlcState::Withdrawn);
    assert_eq!(source_htlc.preimage.as_deref(), Some("s3cret"));

    // Exactly one successful attempt per action, each chain write carrying
    // a transaction hash.
    let attempts = h.store.list_attempts("hp-1").await.unwrap();
    for action in [
        AttemptAction::RouteDiscovery,
        AttemptAction::LockTarget,
        AttemptAction::RevealSecret,
    ] {
        let of_action = attempts_for(&attempts, action);
        assert_eq!(of_action.len(), 1, "{action} should run exactly once");
        assert_eq!(of_action[0].status, AttemptStatus::Success);
    }
    for attempt in attempts_for(&attempts, AttemptAction::LockTarget)
        .into_iter()
        .chain(attempts_for(&attempts, AttemptAction::RevealSecret))
    {
        assert!(attempt.tx_hash.is_some());
    }
    // Attempt numbers are dense and monotonic from 1.
    let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
    assert_eq!(numbers, (1..=numbers.len() as u32).collect::<Vec<_>>());
}

#[tokio::test]
async fn transient_lock_failures_are_retried_then_succeed() {
    let h = harness(300);
    h.target
        .inject_error(ChainOp::CreateHtlc, ChainError::RateLimit("429".into()));
    h.target
        .inject_error(ChainOp::CreateHtlc, ChainError::RateLimit("429".into()));
    let _workers = Arc::clone(&h.engine).spawn_workers();

    let relay = sample_relay("tr-1", now_secs() + 3_600);
    seed_source_htlc(&h, &relay);
    h.engine.submit(relay.clone()).await.unwrap();

    wait_for_status(&h.store, "tr-1", RelayStatus::Confirming).await;
    h.target
        .withdraw(&format!("{}-target", relay.id), "s3cret")
        .await
        .unwrap();
    let done = wait_for_status(&h.store, "tr-1", RelayStatus::Completed).await;

    assert_eq!(done.retry_count, 2);
    let attempts = h.store.list_attempts("tr-1").await.unwrap();
    let locks = attempts_for(&attempts, AttemptAction::LockTarget);
    assert_eq!(locks.len(), 3);
    assert_eq!(
        locks
            .iter()
            .filter(|a| a.status == AttemptStatus::Failed)
            .count(),
        2
    );
    assert_eq!(
        locks
            .iter()
            .filter(|a| a.status == AttemptStatus::Success)
            .count(),
        1
    );
}

#[tokio::test]
async fn chain_reject_fails_the_relay_with_one_attempt() {
    let h = harness(300);
    h.source
        .inject_error(ChainOp::Withdraw, ChainError::Rejected("wrong preimage".into()));
    let _workers = Arc::clone(&h.engine).spawn_workers();

    let relay = sample_relay("cr-1", now_secs() + 3_600);
    seed_source_htlc(&h, &relay);
    h.engine.submit(relay.clone()).await.unwrap();

    wait_for_status(&h.store, "cr-1", RelayStatus::Confirming).await;
    h.target
        .withdraw(&format!("{}-target", relay.id), "s3cret")
        .await
        .unwrap();
    let done = wait_for_status(&h.store, "cr-1", RelayStatus::Failed).await;

    assert!(done.last_error.as_deref().unwrap().contains("CHAIN_REJECT"));
    let attempts = h.store.list_attempts("cr-1").await.unwrap();
    let reveals = attempts_for(&attempts, AttemptAction::RevealSecret);
    assert_eq!(reveals.len(), 1);
    assert_eq!(reveals[0].status, AttemptStatus::Failed);
}

#[tokio::test]
async fn stalled_lock_gives_way_to_the_timelock_refund() {
    let h = harness(2);
    h.target.stall(ChainOp::CreateHtlc, true);
    let _workers = Arc::clone(&h.engine).spawn_workers();

    // Refund window opens one second from now; the stalled lock can never
    // finish before it.
    let relay = sample_relay("rf-1", now_secs() + 3);
    seed_source_htlc(&h, &relay);
    h.engine.submit(relay.clone()).await.unwrap();

    let done = wait_for_status(&h.store, "rf-1", RelayStatus::Refunded).await;
    assert!(done.status.is_terminal());
    assert_eq!(h.source.htlc(&relay.htlc_id).unwrap().state, HtlcState::Refunded);

    let attempts = h.store.list_attempts("rf-1").await.unwrap();
    let refunds = attempts_for(&attempts, AttemptAction::Refund);
    assert!(!refunds.is_empty());
    assert!(refunds.iter().any(|a| a.status == AttemptStatus::Success));
}

#[tokio::test]
async fn crash_during_executing_is_reconciled_after_lease_expiry() {
    let h = harness(300);

    // Plant the post-crash truth: relay persisted as executing, the lock
    // attempt orphaned in-progress, and the mirror HTLC already on chain.
    let mut relay = sample_relay("cx-1", now_secs() + 3_600);
    relay.status = RelayStatus::Routing;
    h.store.save_relay(&relay).await.unwrap();
    relay.status = RelayStatus::Executing;
    h.store.save_relay(&relay).await.unwrap();
    seed_source_htlc(&h, &relay);

    let mut discovery = RelayAttempt::begin("cx-1", 1, AttemptAction::RouteDiscovery);
    discovery.settle(AttemptStatus::Success);
    h.store.save_attempt(&discovery).await.unwrap();
    let orphan = RelayAttempt::begin("cx-1", 2, AttemptAction::LockTarget);
    h.store.save_attempt(&orphan).await.unwrap();

    let target_id = format!("{}-target", relay.id);
    h.target.seed_htlc(HtlcDetails {
        htlc_id: target_id.clone(),
        state: HtlcState::Open,
        sender: relay.sender.clone(),
        recipient: relay.recipient.clone(),
        amount: relay.amount.clone(),
        token: relay.token.clone(),
        hashlock: relay.hashlock.clone(),
        timelock: relay.timelock,
        preimage: None,
    });

    // The dead worker still holds the lease.
    let claimed = h
        .store
        .lease_next_ready("dead-worker", Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(claimed.unwrap().id, "cx-1");

    let _workers = Arc::clone(&h.engine).spawn_workers();
    // Nothing can happen while the old lease is live.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.store.get_relay("cx-1").await.unwrap().unwrap().status,
        RelayStatus::Executing
    );

    // Lease TTL elapses; a live worker reclaims and reconciles.
    h.store.expire_lease("cx-1");
    wait_for_status(&h.store, "cx-1", RelayStatus::Confirming).await;
    assert!(h.target.calls(ChainOp::GetHtlc) > 0, "reconciliation must query the chain");

    h.target.withdraw(&target_id, "s3cret").await.unwrap();
    wait_for_status(&h.store, "cx-1", RelayStatus::Completed).await;

    let attempts = h.store.list_attempts("cx-1").await.unwrap();
    // The orphan is left in place, in progress forever.
    assert_eq!(attempts[1].action, AttemptAction::LockTarget);
    assert_eq!(attempts[1].status, AttemptStatus::InProgress);
    // Reconciliation appended a fresh attempt with a greater number.
    let reconcile = attempts_for(&attempts, AttemptAction::Reconcile);
    assert_eq!(reconcile.len(), 1);
    assert!(reconcile[0].attempt_number > 2);
    assert_eq!(reconcile[0].status, AttemptStatus::Success);
}

#[tokio::test]
async fn submit_rejects_unknown_chains_and_non_pending_status() {
    let h = harness(300);

    let mut foreign = sample_relay("bad-1", now_secs() + 3_600);
    foreign.source_chain = "unknown-chain".into();
    assert!(h.engine.submit(foreign).await.is_err());

    let mut started = sample_relay("bad-2", now_secs() + 3_600);
    started.status = RelayStatus::Executing;
    assert!(h.engine.submit(started).await.is_err());

    assert!(h.store.get_relay("bad-1").await.unwrap().is_none());
    assert!(h.store.get_relay("bad-2").await.unwrap().is_none());
}
