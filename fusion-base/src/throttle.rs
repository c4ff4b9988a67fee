//! Throttled request executor fronting chain RPC calls.
//!
//! Wraps any asynchronous unit of work with priority queueing, a concurrency
//! cap, minimum spacing between starts, adaptive back-off keyed on error
//! class, and bounded retries. Process-wide: construct once at startup and
//! share by reference.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use fusion_core::{ChainError, ErrorClass};

/// Retries per submitted item before the error surfaces to the caller.
const MAX_RETRIES: u32 = 3;

/// Adaptive penalty added on a rate-limit failure.
const RATE_LIMIT_PENALTY: Duration = Duration::from_secs(1);

/// Adaptive penalty added after three consecutive non-rate-limit failures.
const ERROR_BURST_PENALTY: Duration = Duration::from_millis(500);

/// Executor tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ThrottleConfig {
    /// Items running simultaneously.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Items allowed to wait; submission to a full queue fails immediately.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,
    /// Minimum spacing between starts, milliseconds.
    #[serde(default = "default_delay_ms")]
    pub default_delay_ms: u64,
    /// Cap on adaptive and retry delays, milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Per-retry delay growth factor.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Whether failures feed the adaptive delay.
    #[serde(default = "default_true")]
    pub enable_adaptive: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_limit: default_queue_limit(),
            default_delay_ms: default_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            enable_adaptive: true,
        }
    }
}

impl ThrottleConfig {
    /// Sanity-check the numbers.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent == 0 {
            return Err("throttle.max_concurrent must be positive".into());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("throttle.backoff_multiplier must be >= 1".into());
        }
        Ok(())
    }
}

fn default_max_concurrent() -> usize {
    8
}

fn default_queue_limit() -> usize {
    256
}

fn default_delay_ms() -> u64 {
    50
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

/// Submission priority. Retries re-enter above `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Front of the queue.
    High,
    /// Default.
    Medium,
    /// Back of the queue.
    Low,
}

impl Priority {
    fn rank(self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Medium => 1,
            Priority::Low => 0,
        }
    }
}

/// Rank above every caller priority, used when re-queueing retries at the
/// head.
const RETRY_RANK: u8 = 3;

/// Why the executor did not return a value.
#[derive(Debug, thiserror::Error)]
pub enum ThrottleError {
    /// The queue was at `queue_limit` when the item was submitted.
    #[error("throttle queue full")]
    QueueFull,
    /// The item aged past its timeout while still queued.
    #[error("timed out after {0:?} in the throttle queue")]
    QueueTimeout(Duration),
    /// The work itself failed and was out of retries (or not retryable).
    #[error(transparent)]
    Failed(#[from] ChainError),
    /// The executor was torn down while the item waited.
    #[error("throttled executor shut down")]
    Shutdown,
}

/// Point-in-time counters reported by [`ThrottledExecutor::stats`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleStats {
    /// Items currently running.
    pub active_requests: usize,
    /// Items currently queued.
    pub queue_length: usize,
    /// Current adaptive delay.
    pub adaptive_delay: Duration,
    /// Failures since the last success.
    pub consecutive_errors: u32,
    /// Errors over the last minute divided by 60.
    pub recent_error_rate: f64,
}

struct Ticket {
    rank: u8,
    seq: u64,
    enqueued: Instant,
    timeout: Duration,
    cancelled: Arc<AtomicBool>,
    grant: oneshot::Sender<()>,
}

impl PartialEq for Ticket {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl Eq for Ticket {}

impl PartialOrd for Ticket {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ticket {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap: higher rank first, FIFO (lower seq) within a rank.
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    active: usize,
    queue: BinaryHeap<Ticket>,
    seq: u64,
    last_start: Option<Instant>,
    adaptive_delay: Duration,
    consecutive_errors: u32,
    consecutive_other_errors: u32,
    error_times: VecDeque<Instant>,
    timer_scheduled: bool,
}

struct Shared {
    config: ThrottleConfig,
    state: Mutex<State>,
}

/// The executor. Cheap to clone; every clone shares queue and counters.
#[derive(Clone)]
pub struct ThrottledExecutor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ThrottledExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottledExecutor")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl ThrottledExecutor {
    /// Construct with the given tuning.
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    active: 0,
                    queue: BinaryHeap::new(),
                    seq: 0,
                    last_start: None,
                    adaptive_delay: Duration::ZERO,
                    consecutive_errors: 0,
                    consecutive_other_errors: 0,
                    error_times: VecDeque::new(),
                    timer_scheduled: false,
                }),
            }),
        }
    }

    /// Run `op` under the throttle. `op` may be invoked several times when
    /// its failures are retryable; it must be safe to repeat.
    pub async fn execute<T, F, Fut>(
        &self,
        priority: Priority,
        timeout: Duration,
        op: F,
    ) -> Result<T, ThrottleError>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ChainError>> + Send,
    {
        self.execute_with_retries(priority, timeout, MAX_RETRIES, op)
            .await
    }

    /// [`Self::execute`] with an explicit retry budget. Callers that do
    /// their own failure bookkeeping (the relay engine records every chain
    /// failure as an attempt) pass 0 so errors surface immediately while
    /// still feeding the adaptive delay.
    pub async fn execute_with_retries<T, F, Fut>(
        &self,
        priority: Priority,
        timeout: Duration,
        max_retries: u32,
        op: F,
    ) -> Result<T, ThrottleError>
    where
        T: Send,
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = Result<T, ChainError>> + Send,
    {
        self.acquire_slot(priority.rank(), timeout).await?;
        let mut retry_count = 0u32;
        loop {
            let result = op().await;
            match result {
                Ok(value) => {
                    self.record_success();
                    self.finish_slot();
                    return Ok(value);
                }
                Err(err) => {
                    let class = err.class();
                    self.record_failure(class);
                    if class.is_retryable() && retry_count < max_retries {
                        retry_count += 1;
                        let delay = self.retry_delay(retry_count);
                        debug!(?class, retry_count, ?delay, "retrying throttled request");
                        self.finish_slot();
                        tokio::time::sleep(delay).await;
                        // Retries re-enter at the head of the queue.
                        self.acquire_slot(RETRY_RANK, timeout).await?;
                        continue;
                    }
                    self.finish_slot();
                    return Err(ThrottleError::Failed(err));
                }
            }
        }
    }

    /// Current counters.
    pub fn stats(&self) -> ThrottleStats {
        let mut state = self.shared.state.lock();
        prune_errors(&mut state.error_times);
        ThrottleStats {
            active_requests: state.active,
            queue_length: state.queue.len(),
            adaptive_delay: state.adaptive_delay,
            consecutive_errors: state.consecutive_errors,
            recent_error_rate: state.error_times.len() as f64 / 60.0,
        }
    }

    fn retry_delay(&self, retry_count: u32) -> Duration {
        let config = &self.shared.config;
        let base = config.default_delay_ms as f64;
        let delay = base * config.backoff_multiplier.powi(retry_count as i32);
        Duration::from_millis(delay as u64).min(Duration::from_millis(config.max_delay_ms))
    }

    async fn acquire_slot(&self, rank: u8, timeout: Duration) -> Result<(), ThrottleError> {
        let cancelled = Arc::new(AtomicBool::new(false));
        let (grant_tx, mut grant_rx) = oneshot::channel();
        {
            let mut state = self.shared.state.lock();
            if state.queue.len() >= self.shared.config.queue_limit {
                return Err(ThrottleError::QueueFull);
            }
            state.seq += 1;
            let seq = state.seq;
            state.queue.push(Ticket {
                rank,
                seq,
                enqueued: Instant::now(),
                timeout,
                cancelled: Arc::clone(&cancelled),
                grant: grant_tx,
            });
        }
        self.pump();

        match tokio::time::timeout(timeout, &mut grant_rx).await {
            Ok(Ok(())) => Ok(()),
            // Sender dropped: the pump expired this ticket in the queue.
            Ok(Err(_)) => Err(ThrottleError::QueueTimeout(timeout)),
            Err(_elapsed) => {
                cancelled.store(true, Ordering::SeqCst);
                // A grant may have raced in just before cancellation took
                // effect; honour it so the slot is not leaked.
                match grant_rx.try_recv() {
                    Ok(()) => Ok(()),
                    Err(_) => Err(ThrottleError::QueueTimeout(timeout)),
                }
            }
        }
    }

    fn finish_slot(&self) {
        {
            let mut state = self.shared.state.lock();
            state.active = state.active.saturating_sub(1);
        }
        self.pump();
    }

    /// Grant as many queued tickets as the concurrency cap and start spacing
    /// allow. Called after every enqueue and every completion.
    fn pump(&self) {
        let mut grants = Vec::new();
        let mut wait: Option<Duration> = None;
        {
            let config = &self.shared.config;
            let mut state = self.shared.state.lock();
            loop {
                if state.active >= config.max_concurrent {
                    break;
                }
                let spacing = Duration::from_millis(config.default_delay_ms)
                    + if config.enable_adaptive {
                        state.adaptive_delay
                    } else {
                        Duration::ZERO
                    };
                if let Some(last) = state.last_start {
                    let eligible_at = last + spacing;
                    let now = Instant::now();
                    if now < eligible_at {
                        wait = Some(eligible_at - now);
                        break;
                    }
                }
                let ticket = loop {
                    match state.queue.pop() {
                        None => break None,
                        Some(t) if t.cancelled.load(Ordering::SeqCst) => continue,
                        Some(t) if t.enqueued.elapsed() > t.timeout => {
                            // Expired while queued; dropping the sender
                            // rejects it without running.
                            trace!(seq = t.seq, "dropping expired queue ticket");
                            continue;
                        }
                        Some(t) => break Some(t),
                    }
                };
                let Some(ticket) = ticket else { break };
                state.active += 1;
                state.last_start = Some(Instant::now());
                grants.push(ticket.grant);
            }
            if let Some(wait) = wait {
                if !state.timer_scheduled && !state.queue.is_empty() {
                    state.timer_scheduled = true;
                    let executor = self.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(wait).await;
                        executor.shared.state.lock().timer_scheduled = false;
                        executor.pump();
                    });
                }
            }
        }
        for grant in grants {
            if grant.send(()).is_err() {
                // Receiver cancelled between pop and send; give the slot back.
                self.shared.state.lock().active -= 1;
                self.pump();
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.shared.state.lock();
        state.consecutive_errors = 0;
        state.consecutive_other_errors = 0;
        // Decay toward zero on every success.
        state.adaptive_delay /= 2;
    }

    fn record_failure(&self, class: ErrorClass) {
        let config = &self.shared.config;
        let mut state = self.shared.state.lock();
        state.consecutive_errors += 1;
        state.error_times.push_back(Instant::now());
        prune_errors(&mut state.error_times);
        if !config.enable_adaptive {
            return;
        }
        match class {
            ErrorClass::RateLimit => {
                state.adaptive_delay += RATE_LIMIT_PENALTY;
                state.consecutive_other_errors = 0;
            }
            _ => {
                state.consecutive_other_errors += 1;
                if state.consecutive_other_errors >= 3 {
                    state.adaptive_delay += ERROR_BURST_PENALTY;
                    state.consecutive_other_errors = 0;
                }
            }
        }
        let cap = Duration::from_millis(config.max_delay_ms);
        if state.adaptive_delay > cap {
            warn!(?cap, "adaptive delay clamped");
            state.adaptive_delay = cap;
        }
    }
}

fn prune_errors(times: &mut VecDeque<Instant>) {
    let horizon = Duration::from_secs(60);
    while times
        .front()
        .map_or(false, |t| t.elapsed() > horizon)
    {
        times.pop_front();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn quick_config() -> ThrottleConfig {
        ThrottleConfig {
            max_concurrent: 1,
            queue_limit: 2,
            default_delay_ms: 0,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            enable_adaptive: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn queue_full_rejects_immediately() {
        let executor = ThrottledExecutor::new(quick_config());

        // Occupy the single slot.
        let blocker = executor.clone();
        let running = tokio::spawn(async move {
            blocker
                .execute(Priority::Medium, Duration::from_secs(60), || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, ChainError>(())
                })
                .await
        });
        tokio::task::yield_now().await;

        // Fill the queue.
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let executor = executor.clone();
            waiters.push(tokio::spawn(async move {
                executor
                    .execute(Priority::Low, Duration::from_secs(60), || async {
                        Ok::<_, ChainError>(())
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(executor.stats().queue_length, 2);

        // One more submission bounces.
        let result = executor
            .execute(Priority::High, Duration::from_secs(60), || async {
                Ok::<_, ChainError>(())
            })
            .await;
        assert!(matches!(result, Err(ThrottleError::QueueFull)));

        running.await.unwrap().unwrap();
        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn higher_priority_runs_first() {
        let executor = ThrottledExecutor::new(ThrottleConfig {
            queue_limit: 16,
            ..quick_config()
        });
        let order: Arc<PlMutex<Vec<&'static str>>> = Arc::new(PlMutex::new(Vec::new()));

        let blocker = executor.clone();
        let hold = tokio::spawn(async move {
            blocker
                .execute(Priority::Medium, Duration::from_secs(60), || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, ChainError>(())
                })
                .await
        });
        tokio::task::yield_now().await;

        let mut tasks = Vec::new();
        for (priority, label) in [
            (Priority::Low, "low"),
            (Priority::Medium, "medium"),
            (Priority::High, "high"),
        ] {
            let executor = executor.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                executor
                    .execute(priority, Duration::from_secs(60), || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().push(label);
                            Ok::<_, ChainError>(())
                        }
                    })
                    .await
            }));
            tokio::task::yield_now().await;
        }

        hold.await.unwrap().unwrap();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock(), vec!["high", "medium", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_item_times_out_without_running(){
        let executor = ThrottledExecutor::new(quick_config());
        let blocker = executor.clone();
        let hold = tokio::spawn(async move {
            blocker
                .execute(Priority::Medium, Duration::from_secs(60), || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, ChainError>(())
                })
                .await
        });
        tokio::task::yield_now().await;

        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);
        let result = executor
            .execute(Priority::High, Duration::from_secs(1), move || {
                let ran = Arc::clone(&ran_clone);
                async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok::<_, ChainError>(())
                }
            })
            .await;
        assert!(matches!(result, Err(ThrottleError::QueueTimeout(_))));
        assert!(!ran.load(Ordering::SeqCst));
        hold.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_errors_retry_then_succeed() {
        let executor = ThrottledExecutor::new(ThrottleConfig {
            queue_limit: 16,
            ..quick_config()
        });
        let attempts = Arc::new(PlMutex::new(0u32));
        let attempts_clone = Arc::clone(&attempts);
        let result = executor
            .execute(Priority::Medium, Duration::from_secs(60), move || {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    let n = {
                        let mut guard = attempts.lock();
                        *guard += 1;
                        *guard
                    };
                    if n <= 2 {
                        Err(ChainError::RateLimit("slow down".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(*attempts.lock(), 3);
        // Two rate-limit failures grew the adaptive delay, the final success
        // decayed it once.
        assert_eq!(executor.stats().adaptive_delay, Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn chain_reject_is_not_retried() {
        let executor = ThrottledExecutor::new(quick_config());
        let attempts = Arc::new(PlMutex::new(0u32));
        let attempts_clone = Arc::clone(&attempts);
        let result: Result<(), _> = executor
            .execute(Priority::Medium, Duration::from_secs(60), move || {
                let attempts = Arc::clone(&attempts_clone);
                async move {
                    *attempts.lock() += 1;
                    Err(ChainError::Rejected("wrong preimage".into()))
                }
            })
            .await;
        assert!(matches!(
            result,
            Err(ThrottleError::Failed(ChainError::Rejected(_)))
        ));
        assert_eq!(*attempts.lock(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn error_burst_adds_smaller_penalty() {
        let executor = ThrottledExecutor::new(ThrottleConfig {
            queue_limit: 16,
            ..quick_config()
        });
        // One call: initial attempt + 3 retries, all connection errors.
        // Three consecutive non-rate-limit errors add one 500ms penalty.
        let result: Result<(), _> = executor
            .execute(Priority::Medium, Duration::from_secs(60), || async {
                Err(ChainError::Connection("refused".into()))
            })
            .await;
        assert!(matches!(result, Err(ThrottleError::Failed(_))));
        let stats = executor.stats();
        assert_eq!(stats.adaptive_delay, Duration::from_millis(500));
        assert_eq!(stats.consecutive_errors, 4);
        assert!(stats.recent_error_rate > 0.0);
    }
}
