//! Prometheus metrics shared by all agents.

use std::collections::HashMap;
use std::net::SocketAddr;

use axum::{routing::get, Router};
use eyre::Result;
use prometheus::{
    histogram_opts, labels, opts, register_gauge_with_registry,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_vec_with_registry, Encoder, Gauge, HistogramVec, IntCounterVec,
    IntGaugeVec, Registry, TextEncoder,
};
use tokio::task::JoinHandle;
use tracing::{info, info_span, instrument::Instrumented, warn, Instrument};

const NAMESPACE: &str = "fusion";

/// Macro to prefix a string with the namespace.
macro_rules! namespaced {
    ($name:expr) => {
        format!("{}_{}", NAMESPACE, $name)
    };
}

/// Metrics for a particular agent.
#[derive(Debug)]
pub struct CoreMetrics {
    registry: Registry,
    listen_port: Option<u16>,
    agent_name: String,

    relays_processed: IntCounterVec,
    relay_status: IntGaugeVec,
    attempt_duration: HistogramVec,
    chain_errors: IntCounterVec,
    breaker_state: IntGaugeVec,
    endpoint_healthy: IntGaugeVec,
    throttle_queue_length: IntGaugeVec,
    cache_hit_rate: IntGaugeVec,
    system_health: Gauge,
}

impl CoreMetrics {
    /// Track metrics for a particular agent name.
    ///
    /// - `for_agent` name of the agent these metrics are tracking.
    /// - `listen_port` port to start the HTTP server on. If None the server
    ///   will not be started.
    /// - `registry` prometheus registry to attach the metrics to.
    pub fn new(
        for_agent: &str,
        listen_port: Option<u16>,
        registry: Registry,
    ) -> prometheus::Result<Self> {
        let const_labels: HashMap<String, String> = labels! {
            namespaced!("baselib_version") => env!("CARGO_PKG_VERSION").into(),
            "agent".into() => for_agent.into(),
        };
        let const_labels_ref = const_labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect::<HashMap<_, _>>();

        let relays_processed = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("relays_processed_total"),
                "Relays driven to a terminal state, by outcome",
                const_labels_ref
            ),
            &["source_chain", "target_chain", "outcome"],
            registry
        )?;
        let relay_status = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("relays_by_status"),
                "Relays currently recorded in each status",
                const_labels_ref
            ),
            &["status"],
            registry
        )?;
        let attempt_duration = register_histogram_vec_with_registry!(
            histogram_opts!(
                namespaced!("attempt_duration_seconds"),
                "Wall time per attempt, by action and outcome",
                prometheus::exponential_buckets(0.1, 2.0, 12)?,
                const_labels.clone()
            ),
            &["action", "outcome"],
            registry
        )?;
        let chain_errors = register_int_counter_vec_with_registry!(
            opts!(
                namespaced!("chain_errors_total"),
                "Chain call failures by chain and error class",
                const_labels_ref
            ),
            &["chain", "class"],
            registry
        )?;
        let breaker_state = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("circuit_breaker_state"),
                "Breaker position: 0 closed, 1 open, 2 half-open",
                const_labels_ref
            ),
            &["breaker"],
            registry
        )?;
        let endpoint_healthy = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("endpoint_healthy"),
                "1 when the endpoint passes health checks",
                const_labels_ref
            ),
            &["pool", "endpoint"],
            registry
        )?;
        let throttle_queue_length = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("throttle_queue_length"),
                "Requests waiting in the throttled executor",
                const_labels_ref
            ),
            &["executor"],
            registry
        )?;
        let cache_hit_rate = register_int_gauge_vec_with_registry!(
            opts!(
                namespaced!("cache_hit_rate_percent"),
                "Cache hit rate per entity class, percent",
                const_labels_ref
            ),
            &["entity"],
            registry
        )?;
        let system_health = register_gauge_with_registry!(
            opts!(
                namespaced!("system_health"),
                "Composite health score in [0, 1]",
                const_labels_ref
            ),
            registry
        )?;

        Ok(Self {
            registry,
            listen_port,
            agent_name: for_agent.into(),
            relays_processed,
            relay_status,
            attempt_duration,
            chain_errors,
            breaker_state,
            endpoint_healthy,
            throttle_queue_length,
            cache_hit_rate,
            system_health,
        })
    }

    /// Relays driven to a terminal state.
    pub fn relays_processed(&self) -> IntCounterVec {
        self.relays_processed.clone()
    }

    /// Relays per status gauge.
    pub fn relay_status(&self) -> IntGaugeVec {
        self.relay_status.clone()
    }

    /// Attempt duration histogram.
    pub fn attempt_duration(&self) -> HistogramVec {
        self.attempt_duration.clone()
    }

    /// Chain error counter.
    pub fn chain_errors(&self) -> IntCounterVec {
        self.chain_errors.clone()
    }

    /// Breaker position gauge.
    pub fn breaker_state(&self) -> IntGaugeVec {
        self.breaker_state.clone()
    }

    /// Endpoint health gauge.
    pub fn endpoint_healthy(&self) -> IntGaugeVec {
        self.endpoint_healthy.clone()
    }

    /// Throttle queue length gauge.
    pub fn throttle_queue_length(&self) -> IntGaugeVec {
        self.throttle_queue_length.clone()
    }

    /// Cache hit rate gauge, percent.
    pub fn cache_hit_rate(&self) -> IntGaugeVec {
        self.cache_hit_rate.clone()
    }

    /// Composite health gauge.
    pub fn system_health(&self) -> Gauge {
        self.system_health.clone()
    }

    /// Gather the current metrics in the prometheus text format.
    pub fn gather(&self) -> prometheus::Result<Vec<u8>> {
        let collected_metrics = self.registry.gather();
        let mut out_buf = Vec::with_capacity(1024 * 64);
        let encoder = TextEncoder::new();
        encoder.encode(&collected_metrics, &mut out_buf)?;
        Ok(out_buf)
    }

    /// Run an HTTP server serving `/metrics`. Does nothing when no port was
    /// configured.
    pub fn run_http_server(self: std::sync::Arc<Self>) -> Instrumented<JoinHandle<Result<()>>> {
        let span = info_span!("metrics_server", agent = %self.agent_name);
        let Some(port) = self.listen_port else {
            warn!("not starting the metrics server; no port was configured");
            return tokio::spawn(async { Ok(()) }).instrument(span);
        };
        let metrics = self;
        tokio::spawn(async move {
            let app = Router::new().route(
                "/metrics",
                get(move || {
                    let metrics = std::sync::Arc::clone(&metrics);
                    async move {
                        match metrics.gather() {
                            Ok(body) => (axum::http::StatusCode::OK, body),
                            Err(err) => (
                                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                                err.to_string().into_bytes(),
                            ),
                        }
                    }
                }),
            );
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            info!(%addr, "starting metrics server");
            axum::Server::bind(&addr)
                .serve(app.into_make_service())
                .await?;
            Ok(())
        })
        .instrument(span)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metrics_register_and_encode() {
        let metrics = CoreMetrics::new("test", None, Registry::new()).unwrap();
        metrics
            .relays_processed()
            .with_label_values(&["ethereum", "osmosis-1", "completed"])
            .inc();
        metrics.system_health().set(0.875);
        let text = String::from_utf8(metrics.gather().unwrap()).unwrap();
        assert!(text.contains("fusion_relays_processed_total"));
        assert!(text.contains("fusion_system_health 0.875"));
    }
}
