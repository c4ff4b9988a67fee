//! Performance monitor and scheduled archival.
//!
//! The monitor periodically aggregates relay counts, chain states, breaker
//! positions, throttler counters and cache hit rates into an append-only
//! [`MetricsSnapshot`], scores overall health, and mirrors everything onto
//! the prometheus gauges. Archival runs on a cron schedule and moves
//! terminal relays and stale snapshots out of the hot tables.

use std::sync::Arc;

use eyre::Result;
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, warn, Instrument};
use uuid::Uuid;

use fusion_base::settings::{ArchivalConf, MonitorConf};
use fusion_base::{BreakerRegistry, CoreMetrics, ThrottledExecutor};
use fusion_core::time::now_millis;
use fusion_core::{ChainStatus, CircuitState, MetricsSnapshot, StoreResult};
use fusion_store::archive::{parse_schedule, until_next_fire, Archiver};
use fusion_store::{RelayStore, RetentionPolicy};

use crate::engine::RelayEngine;

/// Inputs to the health score, separated from I/O for testability.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthInputs {
    /// Breakers currently not closed, over all breakers.
    pub open_breakers: usize,
    /// All breakers.
    pub total_breakers: usize,
    /// Chains in `error` or `disabled`.
    pub degraded_chains: usize,
    /// All tracked chains.
    pub total_chains: usize,
    /// Throttler errors over the last minute / 60.
    pub recent_error_rate: f64,
    /// Whether the engine persists transitions successfully.
    pub engine_healthy: bool,
}

/// Weighted composite in `[0, 1]`.
pub fn system_health(inputs: &HealthInputs) -> f64 {
    let breaker_penalty = if inputs.total_breakers == 0 {
        0.0
    } else {
        0.3 * inputs.open_breakers as f64 / inputs.total_breakers as f64
    };
    let chain_penalty = if inputs.total_chains == 0 {
        0.0
    } else {
        0.3 * inputs.degraded_chains as f64 / inputs.total_chains as f64
    };
    let error_penalty = 0.2 * inputs.recent_error_rate.clamp(0.0, 1.0);
    let engine_penalty = if inputs.engine_healthy { 0.0 } else { 0.2 };
    (1.0 - breaker_penalty - chain_penalty - error_penalty - engine_penalty).clamp(0.0, 1.0)
}

/// Periodic snapshot capture.
pub struct PerformanceMonitor {
    store: Arc<dyn RelayStore>,
    engine: Arc<RelayEngine>,
    throttler: ThrottledExecutor,
    breakers: Arc<BreakerRegistry>,
    metrics: Arc<CoreMetrics>,
    conf: MonitorConf,
}

impl PerformanceMonitor {
    /// Wire the monitor to its sources.
    pub fn new(
        store: Arc<dyn RelayStore>,
        engine: Arc<RelayEngine>,
        throttler: ThrottledExecutor,
        breakers: Arc<BreakerRegistry>,
        metrics: Arc<CoreMetrics>,
        conf: MonitorConf,
    ) -> Self {
        Self {
            store,
            engine,
            throttler,
            breakers,
            metrics,
            conf,
        }
    }

    /// One capture: aggregate, persist, export.
    pub async fn capture(&self) -> StoreResult<MetricsSnapshot> {
        // Push in-memory breaker changes down first so the snapshot and the
        // registry agree.
        self.breakers.flush().await?;

        let stats = self.store.stats().await?;
        let chains = self.store.list_chain_states().await?;
        let breakers = self.store.list_breakers().await?;
        let throttle = self.throttler.stats();

        let mut relays_total = 0u64;
        let mut relays_active = 0u64;
        let mut completed = 0u64;
        let mut failed = 0u64;
        let mut refunded = 0u64;
        for (status, count) in &stats.relays_by_status {
            relays_total += *count;
            if status.is_active() {
                relays_active += *count;
            }
            match status {
                fusion_core::RelayStatus::Completed => completed = *count,
                fusion_core::RelayStatus::Failed => failed = *count,
                fusion_core::RelayStatus::Refunded => refunded = *count,
                _ => {}
            }
            self.metrics
                .relay_status()
                .with_label_values(&[&status.to_string()])
                .set(*count as i64);
        }

        let inputs = HealthInputs {
            open_breakers: breakers
                .iter()
                .filter(|b| b.state != CircuitState::Closed)
                .count(),
            total_breakers: breakers.len(),
            degraded_chains: chains
                .iter()
                .filter(|c| matches!(c.status, ChainStatus::Error | ChainStatus::Disabled))
                .count(),
            total_chains: chains.len(),
            recent_error_rate: throttle.recent_error_rate,
            engine_healthy: self.engine.is_healthy(),
        };
        let health = system_health(&inputs);

        let cache_hit_rate = if stats.cache.is_empty() {
            None
        } else {
            let total: f64 = stats.cache.values().map(|r| r.rate()).sum();
            Some(total / stats.cache.len() as f64)
        };
        for (entity, rate) in &stats.cache {
            self.metrics
                .cache_hit_rate()
                .with_label_values(&[entity])
                .set((rate.rate() * 100.0) as i64);
        }
        for breaker in &breakers {
            let position = match breaker.state {
                CircuitState::Closed => 0,
                CircuitState::Open => 1,
                CircuitState::HalfOpen => 2,
            };
            self.metrics
                .breaker_state()
                .with_label_values(&[&breaker.name])
                .set(position);
        }
        self.metrics.system_health().set(health);

        let snapshot = MetricsSnapshot {
            id: Uuid::new_v4().to_string(),
            timestamp: now_millis(),
            relays_total,
            relays_active,
            relays_completed: completed,
            relays_failed: failed,
            relays_refunded: refunded,
            chain_states: serde_json::to_value(&chains)?,
            breaker_states: serde_json::to_value(&breakers)?,
            cache_hit_rate,
            system_health: health,
        };
        self.store.save_snapshot(&snapshot).await?;

        if health < self.conf.health_warn_threshold {
            warn!(
                health,
                threshold = self.conf.health_warn_threshold,
                "system health below threshold"
            );
        }
        Ok(snapshot)
    }

    /// Background capture loop.
    pub fn spawn(self) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("performance_monitor");
        let interval = std::time::Duration::from_secs(self.conf.interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.capture().await {
                    warn!(%err, "metrics capture failed");
                }
            }
        })
        .instrument(span)
    }
}

/// Scheduled archival: cron-driven retention passes. Uses the
/// table-parameterized archiver against the truth store when one is
/// available, otherwise the provider's own `cleanup`.
pub fn spawn_archival(
    store: Arc<dyn RelayStore>,
    archiver: Option<Archiver>,
    conf: ArchivalConf,
) -> Result<Instrumented<JoinHandle<Result<()>>>> {
    let span = info_span!("archival");
    let schedule = parse_schedule(&conf.cron)?;
    let retention = RetentionPolicy {
        relay_retention: std::time::Duration::from_secs(conf.relay_retention_secs),
        snapshot_retention: std::time::Duration::from_secs(conf.snapshot_retention_secs),
    };
    Ok(tokio::spawn(async move {
        loop {
            let Some(wait) = until_next_fire(&schedule) else {
                warn!("archival schedule has no future firings; stopping");
                return Ok(());
            };
            tokio::time::sleep(wait).await;
            match &archiver {
                Some(archiver) => match archiver.run().await {
                    Ok(removed) => info!(removed, "archival pass complete"),
                    Err(err) => warn!(%err, "archival pass failed"),
                },
                None => match store.cleanup(&retention).await {
                    Ok(report) => info!(?report, "cleanup pass complete"),
                    Err(err) => warn!(%err, "cleanup pass failed"),
                },
            }
        }
    })
    .instrument(span))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn health_is_bounded_and_monotone() {
        let perfect = HealthInputs {
            engine_healthy: true,
            ..Default::default()
        };
        assert_eq!(system_health(&perfect), 1.0);

        let degraded = HealthInputs {
            open_breakers: 1,
            total_breakers: 2,
            degraded_chains: 1,
            total_chains: 2,
            recent_error_rate: 0.5,
            engine_healthy: true,
        };
        let score = system_health(&degraded);
        assert!(score < 1.0 && score > 0.0);

        let dead = HealthInputs {
            open_breakers: 5,
            total_breakers: 5,
            degraded_chains: 3,
            total_chains: 3,
            recent_error_rate: 10.0,
            engine_healthy: false,
        };
        assert_eq!(system_health(&dead), 0.0);
    }

    #[test]
    fn empty_system_with_unhealthy_engine_is_penalized() {
        let inputs = HealthInputs::default();
        assert!((system_health(&inputs) - 0.8).abs() < 1e-9);
    }
}
