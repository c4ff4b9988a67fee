//! Pooled, health-checked, load-balanced, failover-capable connections.
//!
//! One [`ConnectionPool`] fronts the endpoints of a single service (the truth
//! store, the cache store, or one chain's RPC). The pool is generic over a
//! [`Connector`], which knows how to dial an endpoint and how to run the
//! minimal health-probe round-trip against it.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, info_span, instrument::Instrumented, warn, Instrument};

use fusion_core::time::now_millis;

/// One endpoint of a pooled service.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConf {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Optional auth user.
    #[serde(default)]
    pub username: Option<String>,
    /// Optional auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// 1 is primary; higher numbers are further down the failover order.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Relative weight for the `weighted` strategy.
    #[serde(default)]
    pub weight: Option<u32>,
    /// Never receives writes.
    #[serde(default)]
    pub readonly: bool,
}

fn default_priority() -> u32 {
    1
}

impl EndpointConf {
    /// `host:port`, used in logs and metric labels.
    pub fn name(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Strategy for spreading reads over healthy endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    /// Rotate through endpoints.
    #[default]
    RoundRobin,
    /// Random, biased by endpoint weight.
    Weighted,
    /// Fewest active connections first.
    LeastConnections,
}

/// Which endpoints may serve reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReadPreference {
    /// Only priority-1 endpoints.
    #[default]
    Primary,
    /// Only replicas (read-only or priority above 1).
    Secondary,
    /// Whatever is healthy.
    Any,
}

/// Pool tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PoolConf {
    /// Connections kept warm per endpoint.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,
    /// Hard cap per endpoint.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Budget for a single checkout, milliseconds.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are dropped, milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Probe cadence, milliseconds.
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Probe deadline, milliseconds.
    #[serde(default = "default_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    /// Probe failures in a row before the endpoint is marked unhealthy.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    /// Budget for the whole failover sweep, milliseconds.
    #[serde(default = "default_failover_timeout_ms")]
    pub failover_timeout_ms: u64,
    /// Extra spacing between probes of an unhealthy endpoint, milliseconds.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Reconnect probes before the endpoint is reported as abandoned.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// Read spreading strategy.
    #[serde(default)]
    pub load_balancing: LoadBalancing,
    /// Read routing.
    #[serde(default)]
    pub read_preference: ReadPreference,
}

impl Default for PoolConf {
    fn default() -> Self {
        Self {
            min_connections: default_min_connections(),
            max_connections: default_max_connections(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            health_check_interval_ms: default_health_check_interval_ms(),
            health_check_timeout_ms: default_health_check_timeout_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            failover_timeout_ms: default_failover_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            load_balancing: LoadBalancing::default(),
            read_preference: ReadPreference::default(),
        }
    }
}

impl PoolConf {
    /// Sanity-check the numbers.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("pool.max_connections must be positive".into());
        }
        if self.min_connections > self.max_connections {
            return Err(format!(
                "pool.min_connections {} exceeds max_connections {}",
                self.min_connections, self.max_connections
            ));
        }
        Ok(())
    }
}

fn default_min_connections() -> usize {
    1
}

fn default_max_connections() -> usize {
    8
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_health_check_interval_ms() -> u64 {
    10_000
}

fn default_health_check_timeout_ms() -> u64 {
    2_000
}

fn default_max_consecutive_failures() -> u32 {
    3
}

fn default_failover_timeout_ms() -> u64 {
    15_000
}

fn default_reconnect_delay_ms() -> u64 {
    1_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

/// Connection-layer failure.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    /// Every candidate endpoint is unhealthy or exhausted.
    #[error("no healthy endpoint in pool `{0}`")]
    NoHealthyEndpoint(String),
    /// Dialing or speaking to one endpoint failed.
    #[error("endpoint {endpoint}: {message}")]
    Endpoint {
        /// `host:port`.
        endpoint: String,
        /// What went wrong.
        message: String,
    },
    /// The per-endpoint connection cap was hit.
    #[error("endpoint {0} exhausted")]
    Exhausted(String),
    /// The checkout budget elapsed.
    #[error("acquire timed out after {0:?}")]
    AcquireTimeout(Duration),
}

/// Dials endpoints and probes liveness for one service kind.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The session type handed to callers.
    type Conn: Send + 'static;

    /// Establish a fresh connection.
    async fn connect(&self, endpoint: &EndpointConf) -> Result<Self::Conn, ConnError>;

    /// Minimal round-trip (no-op query / ping).
    async fn probe(&self, conn: &mut Self::Conn) -> Result<(), ConnError>;
}

struct IdleConn<T> {
    conn: T,
    since: Instant,
}

struct EndpointState<T> {
    conf: EndpointConf,
    idle: Mutex<Vec<IdleConn<T>>>,
    active: AtomicUsize,
    total_created: AtomicU64,
    total_queries: AtomicU64,
    ewma_response_ms: Mutex<f64>,
    ewma_error_rate: Mutex<f64>,
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
    reconnect_attempts: AtomicU32,
    last_health_check: AtomicI64,
}

impl<T> EndpointState<T> {
    fn new(conf: EndpointConf) -> Self {
        Self {
            conf,
            idle: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            total_created: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            ewma_response_ms: Mutex::new(0.0),
            ewma_error_rate: Mutex::new(0.0),
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
            reconnect_attempts: AtomicU32::new(0),
            last_health_check: AtomicI64::new(0),
        }
    }

    fn record_outcome(&self, elapsed: Duration, ok: bool) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        let sample_ms = elapsed.as_secs_f64() * 1_000.0;
        {
            let mut ewma = self.ewma_response_ms.lock();
            *ewma = if *ewma == 0.0 {
                sample_ms
            } else {
                0.8 * *ewma + 0.2 * sample_ms
            };
        }
        {
            let mut rate = self.ewma_error_rate.lock();
            let sample = if ok { 0.0 } else { 1.0 };
            *rate = 0.9 * *rate + 0.1 * sample;
        }
    }
}

/// Observable state of one endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct EndpointMetrics {
    /// `host:port`.
    pub endpoint: String,
    /// Connections checked out right now.
    pub active: usize,
    /// Connections parked in the idle pool.
    pub idle: usize,
    /// Connections ever created.
    pub total_connections: u64,
    /// Queries served.
    pub total_queries: u64,
    /// Exponentially-smoothed response time, milliseconds.
    pub avg_response_ms: f64,
    /// Exponentially-smoothed error rate in [0, 1].
    pub error_rate: f64,
    /// Last probe, milliseconds since epoch; 0 when never probed.
    pub last_health_check: i64,
    /// Whether the endpoint currently takes traffic.
    pub healthy: bool,
}

/// A pool of endpoints for one service.
pub struct ConnectionPool<C: Connector> {
    name: String,
    connector: C,
    endpoints: Vec<Arc<EndpointState<C::Conn>>>,
    config: PoolConf,
    round_robin: AtomicUsize,
}

impl<C: Connector> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("endpoints", &self.endpoints.len())
            .finish_non_exhaustive()
    }
}

impl<C: Connector> ConnectionPool<C> {
    /// A pool named `name` over `endpoints`.
    pub fn new(name: impl Into<String>, connector: C, endpoints: Vec<EndpointConf>, config: PoolConf) -> Self {
        Self {
            name: name.into(),
            connector,
            endpoints: endpoints
                .into_iter()
                .map(|conf| Arc::new(EndpointState::new(conf)))
                .collect(),
            config,
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Pool name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquire a session for a read, spread per the configured strategy.
    pub async fn acquire_read(&self) -> Result<PooledSession<'_, C>, ConnError> {
        let candidates = self.read_candidates();
        self.acquire_from(candidates).await
    }

    /// Acquire a session for a write: highest-priority healthy endpoint
    /// first, never a read-only one.
    pub async fn acquire_write(&self) -> Result<PooledSession<'_, C>, ConnError> {
        let mut candidates: Vec<_> = self
            .endpoints
            .iter()
            .filter(|ep| ep.healthy.load(Ordering::Relaxed) && !ep.conf.readonly)
            .cloned()
            .collect();
        candidates.sort_by_key(|ep| ep.conf.priority);
        self.acquire_from(candidates).await
    }

    fn read_candidates(&self) -> Vec<Arc<EndpointState<C::Conn>>> {
        let mut healthy: Vec<_> = self
            .endpoints
            .iter()
            .filter(|ep| ep.healthy.load(Ordering::Relaxed))
            .filter(|ep| match self.config.read_preference {
                ReadPreference::Primary => ep.conf.priority == 1,
                ReadPreference::Secondary => ep.conf.readonly || ep.conf.priority > 1,
                ReadPreference::Any => true,
            })
            .cloned()
            .collect();
        match self.config.load_balancing {
            LoadBalancing::RoundRobin => {
                if !healthy.is_empty() {
                    let start = self.round_robin.fetch_add(1, Ordering::Relaxed) % healthy.len();
                    healthy.rotate_left(start);
                }
            }
            LoadBalancing::Weighted => {
                if healthy.len() > 1 {
                    let total: u64 = healthy
                        .iter()
                        .map(|ep| u64::from(ep.conf.weight.unwrap_or(1).max(1)))
                        .sum();
                    let mut pick = rand::thread_rng().gen_range(0..total);
                    let mut chosen = 0;
                    for (i, ep) in healthy.iter().enumerate() {
                        let w = u64::from(ep.conf.weight.unwrap_or(1).max(1));
                        if pick < w {
                            chosen = i;
                            break;
                        }
                        pick -= w;
                    }
                    healthy.swap(0, chosen);
                }
            }
            LoadBalancing::LeastConnections => {
                healthy.sort_by_key(|ep| ep.active.load(Ordering::Relaxed));
            }
        }
        healthy
    }

    async fn acquire_from(
        &self,
        candidates: Vec<Arc<EndpointState<C::Conn>>>,
    ) -> Result<PooledSession<'_, C>, ConnError> {
        if candidates.is_empty() {
            return Err(ConnError::NoHealthyEndpoint(self.name.clone()));
        }
        let deadline = Instant::now() + Duration::from_millis(self.config.failover_timeout_ms);
        let acquire_budget = Duration::from_millis(self.config.acquire_timeout_ms);
        for (i, endpoint) in candidates.iter().enumerate() {
            if Instant::now() >= deadline {
                break;
            }
            let attempt = timeout(acquire_budget, self.checkout(endpoint)).await;
            match attempt {
                Ok(Ok(conn)) => {
                    if i > 0 {
                        info!(
                            pool = %self.name,
                            endpoint = %endpoint.conf.name(),
                            skipped = i,
                            "failed over to a lower-priority endpoint"
                        );
                    }
                    endpoint.active.fetch_add(1, Ordering::Relaxed);
                    return Ok(PooledSession {
                        pool: self,
                        endpoint: Arc::clone(endpoint),
                        conn: Some(conn),
                        started: Instant::now(),
                        broken: false,
                    });
                }
                Ok(Err(err)) => {
                    warn!(
                        pool = %self.name,
                        endpoint = %endpoint.conf.name(),
                        %err,
                        "endpoint acquisition failed; trying next"
                    );
                }
                Err(_) => {
                    warn!(
                        pool = %self.name,
                        endpoint = %endpoint.conf.name(),
                        "endpoint acquisition timed out; trying next"
                    );
                }
            }
        }
        Err(ConnError::NoHealthyEndpoint(self.name.clone()))
    }

    async fn checkout(&self, endpoint: &EndpointState<C::Conn>) -> Result<C::Conn, ConnError> {
        // Reuse an idle connection, discarding stale ones.
        {
            let idle_for = Duration::from_millis(self.config.idle_timeout_ms);
            let mut idle = endpoint.idle.lock();
            idle.retain(|ic| ic.since.elapsed() < idle_for);
            if let Some(ic) = idle.pop() {
                return Ok(ic.conn);
            }
        }
        let open = endpoint.active.load(Ordering::Relaxed) + endpoint.idle.lock().len();
        if open >= self.config.max_connections {
            return Err(ConnError::Exhausted(endpoint.conf.name()));
        }
        let conn = self.connector.connect(&endpoint.conf).await?;
        endpoint.total_created.fetch_add(1, Ordering::Relaxed);
        Ok(conn)
    }

    /// One probe pass over every endpoint. Exposed for warm-up and tests;
    /// [`Self::spawn_health_checks`] calls this on the configured cadence.
    pub async fn probe_all(&self) {
        for endpoint in &self.endpoints {
            self.probe_endpoint(endpoint).await;
        }
    }

    async fn probe_endpoint(&self, endpoint: &EndpointState<C::Conn>) {
        let was_healthy = endpoint.healthy.load(Ordering::Relaxed);
        if !was_healthy {
            // Unhealthy endpoints are reconnect attempts; pace them.
            tokio::time::sleep(Duration::from_millis(self.config.reconnect_delay_ms)).await;
        }
        let budget = Duration::from_millis(self.config.health_check_timeout_ms);
        let started = Instant::now();
        let outcome = timeout(budget, async {
            let mut conn = self.connector.connect(&endpoint.conf).await?;
            self.connector.probe(&mut conn).await
        })
        .await;
        endpoint
            .last_health_check
            .store(now_millis(), Ordering::Relaxed);
        let ok = matches!(outcome, Ok(Ok(())));
        endpoint.record_outcome(started.elapsed(), ok);
        if ok {
            endpoint.consecutive_failures.store(0, Ordering::Relaxed);
            endpoint.reconnect_attempts.store(0, Ordering::Relaxed);
            // A single successful probe restores the endpoint.
            if !was_healthy {
                endpoint.healthy.store(true, Ordering::Relaxed);
                info!(pool = %self.name, endpoint = %endpoint.conf.name(), "endpoint recovered");
            }
            return;
        }
        let failures = endpoint.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if was_healthy && failures >= self.config.max_consecutive_failures {
            endpoint.healthy.store(false, Ordering::Relaxed);
            warn!(
                pool = %self.name,
                endpoint = %endpoint.conf.name(),
                failures,
                "endpoint marked unhealthy"
            );
        } else if !was_healthy {
            let attempts = endpoint.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if attempts == self.config.max_reconnect_attempts {
                warn!(
                    pool = %self.name,
                    endpoint = %endpoint.conf.name(),
                    attempts,
                    "endpoint still down after the reconnect budget"
                );
            }
        }
    }

    /// Background probe loop.
    pub fn spawn_health_checks(self: Arc<Self>) -> Instrumented<JoinHandle<eyre::Result<()>>> {
        let span = info_span!("health_checks", pool = %self.name);
        let interval = Duration::from_millis(self.config.health_check_interval_ms);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.probe_all().await;
                debug!(pool = %self.name, "health probe pass complete");
            }
        })
        .instrument(span)
    }

    /// Metrics for every endpoint.
    pub fn endpoint_metrics(&self) -> Vec<EndpointMetrics> {
        self.endpoints
            .iter()
            .map(|ep| EndpointMetrics {
                endpoint: ep.conf.name(),
                active: ep.active.load(Ordering::Relaxed),
                idle: ep.idle.lock().len(),
                total_connections: ep.total_created.load(Ordering::Relaxed),
                total_queries: ep.total_queries.load(Ordering::Relaxed),
                avg_response_ms: *ep.ewma_response_ms.lock(),
                error_rate: *ep.ewma_error_rate.lock(),
                last_health_check: ep.last_health_check.load(Ordering::Relaxed),
                healthy: ep.healthy.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Whether any endpoint currently takes traffic.
    pub fn has_healthy_endpoint(&self) -> bool {
        self.endpoints
            .iter()
            .any(|ep| ep.healthy.load(Ordering::Relaxed))
    }
}

/// A checked-out connection. Returned to the idle pool on drop unless marked
/// broken.
pub struct PooledSession<'a, C: Connector> {
    pool: &'a ConnectionPool<C>,
    endpoint: Arc<EndpointState<C::Conn>>,
    conn: Option<C::Conn>,
    started: Instant,
    broken: bool,
}

impl<'a, C: Connector> std::fmt::Debug for PooledSession<'a, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledSession")
            .field("started", &self.started)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl<C: Connector> PooledSession<'_, C> {
    /// The endpoint this session talks to.
    pub fn endpoint_name(&self) -> String {
        self.endpoint.conf.name()
    }

    /// Discard the connection on drop instead of pooling it, and count the
    /// session as failed in the endpoint metrics.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl<C: Connector> std::ops::Deref for PooledSession<'_, C> {
    type Target = C::Conn;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("session accessed after drop")
    }
}

impl<C: Connector> std::ops::DerefMut for PooledSession<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("session accessed after drop")
    }
}

impl<C: Connector> Drop for PooledSession<'_, C> {
    fn drop(&mut self) {
        self.endpoint.active.fetch_sub(1, Ordering::Relaxed);
        self.endpoint
            .record_outcome(self.started.elapsed(), !self.broken);
        if !self.broken {
            if let Some(conn) = self.conn.take() {
                self.endpoint.idle.lock().push(IdleConn {
                    conn,
                    since: Instant::now(),
                });
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    struct TestConnector {
        refuse: Mutex<HashSet<String>>,
        dials: AtomicU64,
    }

    impl TestConnector {
        fn new() -> Self {
            Self {
                refuse: Mutex::new(HashSet::new()),
                dials: AtomicU64::new(0),
            }
        }

        fn refuse(&self, endpoint: &str, on: bool) {
            let mut refuse = self.refuse.lock();
            if on {
                refuse.insert(endpoint.to_string());
            } else {
                refuse.remove(endpoint);
            }
        }
    }

    struct TestConn {
        endpoint: String,
    }

    #[async_trait]
    impl Connector for Arc<TestConnector> {
        type Conn = TestConn;

        async fn connect(&self, endpoint: &EndpointConf) -> Result<Self::Conn, ConnError> {
            self.dials.fetch_add(1, Ordering::Relaxed);
            let name = endpoint.name();
            if self.refuse.lock().contains(&name) {
                return Err(ConnError::Endpoint {
                    endpoint: name,
                    message: "connection refused".into(),
                });
            }
            Ok(TestConn { endpoint: name })
        }

        async fn probe(&self, conn: &mut Self::Conn) -> Result<(), ConnError> {
            if self.refuse.lock().contains(&conn.endpoint) {
                return Err(ConnError::Endpoint {
                    endpoint: conn.endpoint.clone(),
                    message: "probe failed".into(),
                });
            }
            Ok(())
        }
    }

    fn endpoint(host: &str, priority: u32) -> EndpointConf {
        EndpointConf {
            host: host.into(),
            port: 8545,
            username: None,
            password: None,
            priority,
            weight: None,
            readonly: false,
        }
    }

    fn pool_config() -> PoolConf {
        PoolConf {
            reconnect_delay_ms: 0,
            ..PoolConf::default()
        }
    }

    #[tokio::test]
    async fn write_prefers_primary_and_fails_over() {
        let connector = Arc::new(TestConnector::new());
        let pool = ConnectionPool::new(
            "ethereum",
            Arc::clone(&connector),
            vec![endpoint("primary", 1), endpoint("secondary", 2)],
            pool_config(),
        );

        let mut session = pool.acquire_write().await.unwrap();
        assert_eq!(session.endpoint_name(), "primary:8545");
        // Keep the pool empty so the next acquire has to dial again.
        session.mark_broken();
        drop(session);

        connector.refuse("primary:8545", true);
        let session = pool.acquire_write().await.unwrap();
        assert_eq!(session.endpoint_name(), "secondary:8545");
    }

    #[tokio::test]
    async fn no_healthy_endpoint_is_a_distinct_error() {
        let connector = Arc::new(TestConnector::new());
        let pool = ConnectionPool::new(
            "ethereum",
            Arc::clone(&connector),
            vec![endpoint("a", 1), endpoint("b", 2)],
            pool_config(),
        );
        connector.refuse("a:8545", true);
        connector.refuse("b:8545", true);
        for _ in 0..pool_config().max_consecutive_failures {
            pool.probe_all().await;
        }
        assert!(!pool.has_healthy_endpoint());
        let err = pool.acquire_write().await.unwrap_err();
        assert!(matches!(err, ConnError::NoHealthyEndpoint(_)));
    }

    #[tokio::test]
    async fn unhealthy_flip_happens_exactly_at_threshold() {
        let connector = Arc::new(TestConnector::new());
        let pool = ConnectionPool::new(
            "ethereum",
            Arc::clone(&connector),
            vec![endpoint("a", 1)],
            pool_config(),
        );
        connector.refuse("a:8545", true);
        // max_consecutive_failures - 1 probes: still healthy.
        for _ in 0..pool_config().max_consecutive_failures - 1 {
            pool.probe_all().await;
        }
        assert!(pool.has_healthy_endpoint());
        // One more flips it.
        pool.probe_all().await;
        assert!(!pool.has_healthy_endpoint());

        // A single successful probe restores it.
        connector.refuse("a:8545", false);
        pool.probe_all().await;
        assert!(pool.has_healthy_endpoint());
    }

    #[tokio::test]
    async fn idle_connections_are_reused() {
        let connector = Arc::new(TestConnector::new());
        let pool = ConnectionPool::new(
            "ethereum",
            Arc::clone(&connector),
            vec![endpoint("a", 1)],
            pool_config(),
        );
        drop(pool.acquire_read().await.unwrap());
        drop(pool.acquire_read().await.unwrap());
        assert_eq!(connector.dials.load(Ordering::Relaxed), 1);

        let metrics = pool.endpoint_metrics();
        assert_eq!(metrics[0].idle, 1);
        assert_eq!(metrics[0].total_queries, 2);
    }

    #[tokio::test]
    async fn broken_sessions_are_not_pooled() {
        let connector = Arc::new(TestConnector::new());
        let pool = ConnectionPool::new(
            "ethereum",
            Arc::clone(&connector),
            vec![endpoint("a", 1)],
            pool_config(),
        );
        let mut session = pool.acquire_read().await.unwrap();
        session.mark_broken();
        drop(session);
        assert_eq!(pool.endpoint_metrics()[0].idle, 0);
        drop(pool.acquire_read().await.unwrap());
        assert_eq!(connector.dials.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn round_robin_rotates_over_healthy_endpoints() {
        let connector = Arc::new(TestConnector::new());
        let config = PoolConf {
            read_preference: ReadPreference::Any,
            ..pool_config()
        };
        let pool = ConnectionPool::new(
            "ethereum",
            Arc::clone(&connector),
            vec![endpoint("a", 1), endpoint("b", 2)],
            config,
        );
        let first = pool.acquire_read().await.unwrap().endpoint_name();
        let second = pool.acquire_read().await.unwrap().endpoint_name();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn least_connections_prefers_the_quieter_endpoint() {
        let connector = Arc::new(TestConnector::new());
        let config = PoolConf {
            read_preference: ReadPreference::Any,
            load_balancing: LoadBalancing::LeastConnections,
            ..pool_config()
        };
        let pool = ConnectionPool::new(
            "ethereum",
            Arc::clone(&connector),
            vec![endpoint("a", 1), endpoint("b", 2)],
            config,
        );
        // Hold a session on whichever endpoint comes first.
        let held = pool.acquire_read().await.unwrap();
        let busy = held.endpoint_name();
        let next = pool.acquire_read().await.unwrap();
        assert_ne!(next.endpoint_name(), busy);
    }
}
