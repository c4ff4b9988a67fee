//! The relay state engine.
//!
//! For each non-terminal relay, drive the next action toward a terminal
//! state while honouring the timelock. Workers claim relays through store
//! leases, so at most one worker ever holds a relay; transitions persist
//! before in-memory state advances.

mod worker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyre::Result;
use prometheus::{HistogramVec, IntCounterVec};
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument, instrument::Instrumented, warn, Instrument};
use uuid::Uuid;

use fusion_base::settings::{EngineConf, Settings};
use fusion_base::CoreMetrics;
use fusion_core::{Backoff, Relay, RelayStatus, StoreError, StoreResult};
use fusion_store::RelayStore;

use crate::chains::ChainGateway;

/// Metrics the engine reports.
#[derive(Debug, Clone)]
pub struct EngineMetrics {
    pub(crate) relays_processed: IntCounterVec,
    pub(crate) attempt_duration: HistogramVec,
    pub(crate) chain_errors: IntCounterVec,
}

impl EngineMetrics {
    /// Bind to the shared registry.
    pub fn new(metrics: &CoreMetrics) -> Self {
        Self {
            relays_processed: metrics.relays_processed(),
            attempt_duration: metrics.attempt_duration(),
            chain_errors: metrics.chain_errors(),
        }
    }
}

/// Process-wide engine. Construct once, share behind an `Arc`.
pub struct RelayEngine {
    pub(crate) store: Arc<dyn RelayStore>,
    pub(crate) gateways: HashMap<String, Arc<ChainGateway>>,
    pub(crate) config: EngineConf,
    /// Per-source-chain refund headroom, seconds.
    pub(crate) refund_buffers: HashMap<String, i64>,
    pub(crate) backoff: Backoff,
    pub(crate) metrics: EngineMetrics,
    healthy: AtomicBool,
}

impl std::fmt::Debug for RelayEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEngine")
            .field("chains", &self.gateways.keys().collect::<Vec<_>>())
            .field("workers", &self.config.workers)
            .finish_non_exhaustive()
    }
}

impl RelayEngine {
    /// Assemble the engine from its collaborators.
    pub fn new(
        store: Arc<dyn RelayStore>,
        gateways: HashMap<String, Arc<ChainGateway>>,
        settings: &Settings,
        metrics: EngineMetrics,
    ) -> Self {
        let refund_buffers = settings
            .chains
            .iter()
            .map(|(id, chain)| (id.clone(), chain.refund_buffer_secs))
            .collect();
        let config = settings.engine.clone();
        let backoff = Backoff::new(
            Duration::from_millis(config.retry_base_ms),
            config.retry_multiplier,
            Duration::from_millis(config.retry_max_delay_ms),
        );
        Self {
            store,
            gateways,
            config,
            refund_buffers,
            backoff,
            metrics,
            healthy: AtomicBool::new(true),
        }
    }

    /// Observer entry point: accept a newly-detected source HTLC.
    ///
    /// Validates the submission and persists it in `pending`; a worker picks
    /// it up from there.
    #[instrument(skip_all, fields(relay_id = %relay.id))]
    pub async fn submit(&self, relay: Relay) -> StoreResult<()> {
        if relay.status != RelayStatus::Pending {
            return Err(StoreError::Constraint(format!(
                "submitted relay must be pending, got {}",
                relay.status
            )));
        }
        if relay.id.is_empty() || relay.htlc_id.is_empty() {
            return Err(StoreError::Constraint("relay id and htlc id are required".into()));
        }
        for chain in [&relay.source_chain, &relay.target_chain] {
            if !self.gateways.contains_key(chain) {
                return Err(StoreError::Constraint(format!(
                    "relay references unconfigured chain `{chain}`"
                )));
            }
        }
        self.store.save_relay(&relay).await?;
        info!(source = %relay.source_chain, target = %relay.target_chain, "relay accepted");
        Ok(())
    }

    /// Refund headroom for a relay, by its source chain.
    pub(crate) fn refund_buffer(&self, relay: &Relay) -> i64 {
        self.refund_buffers
            .get(&relay.source_chain)
            .copied()
            .unwrap_or(300)
    }

    pub(crate) fn gateway(&self, chain: &str) -> Option<&Arc<ChainGateway>> {
        self.gateways.get(chain)
    }

    /// Whether persistence is keeping up. Cleared when a transition cannot
    /// be persisted even with retries.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_unhealthy(&self) {
        if self.healthy.swap(false, Ordering::Relaxed) {
            warn!("engine marked unhealthy: persistence is failing");
        }
    }

    pub(crate) fn mark_healthy(&self) {
        self.healthy.store(true, Ordering::Relaxed);
    }

    /// Spawn the worker pool. Each worker leases one relay at a time and
    /// drives it as far as it can go.
    pub fn spawn_workers(self: Arc<Self>) -> Vec<Instrumented<JoinHandle<Result<()>>>> {
        (0..self.config.workers)
            .map(|n| {
                let engine = Arc::clone(&self);
                let worker_id = format!("worker-{n}-{}", Uuid::new_v4().simple());
                let span = info_span!("relay_worker", worker = %worker_id);
                tokio::spawn(async move { worker::run_worker(engine, worker_id).await })
                    .instrument(span)
            })
            .collect()
    }
}
