//! Rate-limited request scheduler.
//!
//! Every provider call goes through [`RequestScheduler::enqueue`]. Tasks
//! dispatch in FIFO order through a fair semaphore holding
//! `max_concurrent` slots, and consecutive dispatches are spaced by at least
//! `min_dispatch_delay`. A rate-limited task gives its slot back, waits out
//! an exponential backoff and then queues again behind everything that has
//! not started yet.
//!
//! Each task moves through explicit [`TaskState`]s:
//!
//! ```text
//! Pending -> Dispatched -> Succeeded
//!                |-> Failed
//!                '-> BackoffWait -> Dispatched -> ...
//! ```

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore, watch};

use crate::provider::ProviderError;
use crate::time::{Clock, TokioClock};

/// Scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of tasks running at once.
    pub max_concurrent: usize,
    /// Minimum spacing between two dispatches, in milliseconds.
    pub min_dispatch_delay_ms: u64,
    /// Backoff before the first retry, in milliseconds. Doubles per retry.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff, in milliseconds.
    pub max_delay_ms: u64,
    /// Retries after the first attempt before giving up.
    pub max_retries: u32,
    /// Also back off on 5xx and transport failures, not only on 429.
    pub retry_server_errors: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            min_dispatch_delay_ms: 100,
            base_delay_ms: 1_000,
            max_delay_ms: 32_000,
            max_retries: 3,
            retry_server_errors: false,
        }
    }
}

impl SchedulerConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the concurrency limit (at least one).
    #[must_use]
    pub fn max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    /// Sets the minimum spacing between dispatches.
    #[must_use]
    pub fn min_dispatch_delay(mut self, delay: Duration) -> Self {
        self.min_dispatch_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the first backoff delay.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the backoff cap.
    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the retry ceiling.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Enables backoff for server errors.
    #[must_use]
    pub const fn retry_server_errors(mut self, enabled: bool) -> Self {
        self.retry_server_errors = enabled;
        self
    }

    /// Backoff before retry number `attempt + 1`: `base * 2^attempt`,
    /// capped at the maximum delay.
    #[must_use]
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(32);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    fn min_dispatch_delay_duration(&self) -> Duration {
        Duration::from_millis(self.min_dispatch_delay_ms)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Why a scheduled task did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The scheduler was cleared before the task was dispatched.
    #[error("request cancelled: scheduler cleared")]
    Cleared,

    /// The task failed with an error that is not retried.
    #[error(transparent)]
    Provider(ProviderError),

    /// The task kept failing with retryable errors.
    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made, the first one included.
        attempts: u32,
        /// Error from the final attempt.
        last: ProviderError,
    },
}

impl SchedulerError {
    /// Returns the provider error behind the failure, if any.
    #[must_use]
    pub const fn provider_error(&self) -> Option<&ProviderError> {
        match self {
            Self::Cleared => None,
            Self::Provider(error) | Self::RetriesExhausted { last: error, .. } => Some(error),
        }
    }
}

/// Lifecycle of a scheduled task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting for a slot or for the dispatch gate.
    Pending,
    /// Running; `attempt` counts from zero.
    Dispatched {
        /// Attempt number.
        attempt: u32,
    },
    /// Rate limited, sleeping before the next attempt.
    BackoffWait {
        /// Attempt that failed.
        attempt: u32,
        /// Time to wait.
        delay: Duration,
    },
    /// Finished with a value.
    Succeeded,
    /// Finished with an error.
    Failed,
}

/// Counters describing scheduler activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Tasks waiting for a slot, the dispatch gate or a backoff.
    pub pending: usize,
    /// Tasks currently running.
    pub in_flight: usize,
    /// Tasks that finished with a value.
    pub completed: u64,
    /// Tasks that finished with an error or were cleared.
    pub failed: u64,
    /// Retries performed.
    pub retried: u64,
}

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicUsize,
    in_flight: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
}

/// Keeps the pending and in-flight counters right even when the caller
/// drops the task future midway.
struct Tracker<'a> {
    counters: &'a Counters,
    pending: bool,
    in_flight: bool,
}

impl<'a> Tracker<'a> {
    fn new(counters: &'a Counters) -> Self {
        counters.pending.fetch_add(1, Ordering::SeqCst);
        Self {
            counters,
            pending: true,
            in_flight: false,
        }
    }

    fn dispatched(&mut self) {
        if self.pending {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
            self.pending = false;
        }
        self.counters.in_flight.fetch_add(1, Ordering::SeqCst);
        self.in_flight = true;
    }

    fn requeued(&mut self) {
        self.returned();
        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        self.pending = true;
        self.counters.retried.fetch_add(1, Ordering::SeqCst);
    }

    fn returned(&mut self) {
        if self.in_flight {
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.in_flight = false;
        }
    }

    fn finish(mut self, succeeded: bool) {
        self.returned();
        let counter = if succeeded {
            &self.counters.completed
        } else {
            &self.counters.failed
        };
        counter.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for Tracker<'_> {
    fn drop(&mut self) {
        if self.pending {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if self.in_flight {
            self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Bounded-concurrency FIFO executor with backoff on rate limiting.
pub struct RequestScheduler {
    config: SchedulerConfig,
    clock: Arc<dyn Clock>,
    slots: Arc<Semaphore>,
    last_dispatch: Mutex<Option<Instant>>,
    generation: watch::Sender<u64>,
    counters: Counters,
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Default for RequestScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default(), Arc::new(TokioClock))
    }
}

impl RequestScheduler {
    /// Creates a scheduler.
    #[must_use]
    pub fn new(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        let (generation, _) = watch::channel(0);
        Self {
            config,
            clock,
            slots,
            last_dispatch: Mutex::new(None),
            generation,
            counters: Counters::default(),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub const fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Returns a snapshot of the activity counters.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            pending: self.counters.pending.load(Ordering::SeqCst),
            in_flight: self.counters.in_flight.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            retried: self.counters.retried.load(Ordering::SeqCst),
        }
    }

    /// Rejects every task that has not been dispatched yet with
    /// [`SchedulerError::Cleared`]. Running tasks finish normally; tasks
    /// enqueued afterwards are unaffected.
    pub fn clear(&self) {
        let pending = self.counters.pending.load(Ordering::SeqCst);
        self.generation.send_modify(|generation| *generation += 1);
        tracing::info!(pending, "scheduler cleared");
    }

    /// Runs a task under the scheduler's limits and resolves once with its
    /// final outcome.
    ///
    /// `task` is called once per attempt and must build a fresh request
    /// each time.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::Provider`] for a non-retryable failure,
    /// [`SchedulerError::RetriesExhausted`] when the retry ceiling is hit
    /// and [`SchedulerError::Cleared`] if [`clear`](Self::clear) ran before
    /// the task was dispatched.
    pub async fn enqueue<T, F, Fut>(&self, id: &str, mut task: F) -> Result<T, SchedulerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut cleared = self.generation.subscribe();

        let mut tracker = Tracker::new(&self.counters);
        let mut attempt = 0;
        Self::transition(id, TaskState::Pending);

        loop {
            let permit = tokio::select! {
                biased;
                _ = cleared.changed() => return Err(Self::reject(id, tracker)),
                permit = Arc::clone(&self.slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Err(Self::reject(id, tracker)),
                },
            };

            tokio::select! {
                biased;
                _ = cleared.changed() => return Err(Self::reject(id, tracker)),
                () = self.pass_dispatch_gate() => {}
            }

            tracker.dispatched();
            Self::transition(id, TaskState::Dispatched { attempt });
            let result = task().await;
            drop(permit);

            let error = match result {
                Ok(value) => {
                    tracker.finish(true);
                    Self::transition(id, TaskState::Succeeded);
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.is_retryable(&error) {
                tracker.finish(false);
                Self::transition(id, TaskState::Failed);
                return Err(SchedulerError::Provider(error));
            }

            if attempt >= self.config.max_retries {
                tracker.finish(false);
                Self::transition(id, TaskState::Failed);
                tracing::warn!(task = id, attempts = attempt + 1, %error, "retries exhausted");
                return Err(SchedulerError::RetriesExhausted {
                    attempts: attempt + 1,
                    last: error,
                });
            }

            let delay = self.config.backoff_delay(attempt);
            tracker.requeued();
            Self::transition(id, TaskState::BackoffWait { attempt, delay });
            tracing::warn!(
                task = id,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "request throttled, backing off"
            );

            tokio::select! {
                biased;
                _ = cleared.changed() => return Err(Self::reject(id, tracker)),
                () = self.clock.sleep(delay) => {}
            }
            attempt += 1;
            Self::transition(id, TaskState::Pending);
        }
    }

    fn is_retryable(&self, error: &ProviderError) -> bool {
        error.is_rate_limited() || (self.config.retry_server_errors && error.is_transient())
    }

    /// Waits until at least `min_dispatch_delay` has passed since the
    /// previous dispatch. The async mutex queues callers in order.
    async fn pass_dispatch_gate(&self) {
        let min_delay = self.config.min_dispatch_delay_duration();
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            let elapsed = self.clock.elapsed(previous);
            if elapsed < min_delay {
                self.clock.sleep(min_delay - elapsed).await;
            }
        }
        *last = Some(self.clock.now());
    }

    fn reject(id: &str, tracker: Tracker<'_>) -> SchedulerError {
        tracker.finish(false);
        Self::transition(id, TaskState::Failed);
        tracing::debug!(task = id, "task rejected by clear");
        SchedulerError::Cleared
    }

    fn transition(id: &str, state: TaskState) {
        tracing::debug!(task = id, ?state, "task transition");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::AtomicU32;

    fn build(config: SchedulerConfig) -> (Arc<RequestScheduler>, Arc<ManualClock>) {
        let clock = ManualClock::shared();
        let scheduler = Arc::new(RequestScheduler::new(config, clock.clone()));
        (scheduler, clock)
    }

    fn quiet() -> SchedulerConfig {
        SchedulerConfig::new()
            .min_dispatch_delay(Duration::ZERO)
            .base_delay(Duration::from_millis(100))
    }

    #[test]
    fn test_backoff_delay_doubles_and_caps() {
        let config = SchedulerConfig::new()
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_millis(500));
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(2), Duration::from_millis(400));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(500));
        assert_eq!(config.backoff_delay(60), Duration::from_millis(500));
    }

    #[test]
    fn test_config_deserialize_defaults() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"max_retries": 5}"#).unwrap();
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.min_dispatch_delay_ms, 100);
        assert!(!config.retry_server_errors);
    }

    #[tokio::test]
    async fn test_three_rate_limits_then_success() {
        let (scheduler, clock) = build(quiet());
        let calls = AtomicU32::new(0);

        let value = scheduler
            .enqueue("flaky", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call < 3 {
                        Err(ProviderError::new(429, "rate limited"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let sleeps = clock.sleeps();
        assert_eq!(sleeps.len(), 3);
        assert!(sleeps.windows(2).all(|pair| pair[0] < pair[1]));
        assert_eq!(
            sleeps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );

        let stats = scheduler.stats();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.retried, 3);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let (scheduler, clock) = build(quiet().max_retries(2));
        let calls = AtomicU32::new(0);

        let error = scheduler
            .enqueue("always-429", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(ProviderError::new(429, format!("attempt {call}"))) }
            })
            .await
            .unwrap_err();

        assert_eq!(
            error,
            SchedulerError::RetriesExhausted {
                attempts: 3,
                last: ProviderError::new(429, "attempt 2"),
            }
        );
        assert_eq!(clock.sleeps().len(), 2);
        assert_eq!(scheduler.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let (scheduler, clock) = build(quiet());
        let calls = AtomicU32::new(0);

        let error = scheduler
            .enqueue("missing", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(ProviderError::new(404, "not found")) }
            })
            .await
            .unwrap_err();

        assert_eq!(error, SchedulerError::Provider(ProviderError::new(404, "not found")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_server_errors_retry_only_when_enabled() {
        let (scheduler, _) = build(quiet());
        let error = scheduler
            .enqueue("5xx", || async { Err::<(), _>(ProviderError::new(503, "down")) })
            .await
            .unwrap_err();
        assert!(matches!(error, SchedulerError::Provider(_)));

        let (scheduler, clock) = build(quiet().retry_server_errors(true).max_retries(1));
        let calls = AtomicU32::new(0);
        let value = scheduler
            .enqueue("5xx", || {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        Err(ProviderError::new(503, "down"))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(clock.sleeps(), vec![Duration::from_millis(100)]);
    }

    #[tokio::test]
    async fn test_fifo_order_with_single_slot() {
        let (scheduler, _) = build(quiet().max_concurrent(1));
        let order = Arc::new(StdMutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let scheduler = Arc::clone(&scheduler);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                scheduler
                    .enqueue(&format!("task-{i}"), || {
                        let order = Arc::clone(&order);
                        async move {
                            order.lock().unwrap().push(i);
                            tokio::task::yield_now().await;
                            Ok::<_, ProviderError>(i)
                        }
                    })
                    .await
            }));
            // Let each task reach the queue before spawning the next.
            tokio::task::yield_now().await;
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_waiting_task_runs_once_slot_frees() {
        let (scheduler, _) = build(quiet().max_concurrent(1));
        let held = Arc::clone(&scheduler.slots).acquire_owned().await.unwrap();

        let mut task = tokio_test::task::spawn(
            scheduler.enqueue("queued", || async { Ok::<_, ProviderError>(1) }),
        );
        tokio_test::assert_pending!(task.poll());
        assert_eq!(scheduler.stats().pending, 1);

        drop(held);
        assert!(task.is_woken());
        assert_eq!(tokio_test::assert_ready!(task.poll()), Ok(1));
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let (scheduler, _) = build(quiet().max_concurrent(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..6 {
            let scheduler = Arc::clone(&scheduler);
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                scheduler
                    .enqueue(&format!("task-{i}"), || {
                        let running = Arc::clone(&running);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            for _ in 0..3 {
                                tokio::task::yield_now().await;
                            }
                            running.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, ProviderError>(())
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.stats().completed, 6);
    }

    #[tokio::test]
    async fn test_dispatch_gate_spaces_requests() {
        let config = SchedulerConfig::new().min_dispatch_delay(Duration::from_millis(100));
        let (scheduler, clock) = build(config);

        for i in 0..3 {
            scheduler
                .enqueue(&format!("task-{i}"), || async { Ok::<_, ProviderError>(()) })
                .await
                .unwrap();
        }

        // The first dispatch passes straight through; the next two wait.
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_millis(100), Duration::from_millis(100)]
        );
    }

    #[tokio::test]
    async fn test_clear_rejects_pending_tasks() {
        let (scheduler, _) = build(quiet().max_concurrent(1));
        let (release, released) = tokio::sync::oneshot::channel::<()>();
        let released = Arc::new(tokio::sync::Mutex::new(Some(released)));

        let running = {
            let scheduler = Arc::clone(&scheduler);
            let released = Arc::clone(&released);
            tokio::spawn(async move {
                scheduler
                    .enqueue("running", || {
                        let released = Arc::clone(&released);
                        async move {
                            if let Some(rx) = released.lock().await.take() {
                                let _ = rx.await;
                            }
                            Ok::<_, ProviderError>("finished")
                        }
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let waiting = {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                scheduler
                    .enqueue("waiting", || async { Ok::<_, ProviderError>("never") })
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(scheduler.stats().pending, 1);

        scheduler.clear();
        assert_eq!(waiting.await.unwrap(), Err(SchedulerError::Cleared));

        release.send(()).unwrap();
        assert_eq!(running.await.unwrap(), Ok("finished"));

        // The scheduler keeps working after a clear.
        let after = scheduler
            .enqueue("after", || async { Ok::<_, ProviderError>(1) })
            .await;
        assert_eq!(after, Ok(1));
        assert_eq!(scheduler.stats().pending, 0);
    }

    #[tokio::test]
    async fn test_clear_interrupts_backoff() {
        let (scheduler, _) = build(quiet().max_retries(1_000));
        let cleared = Arc::new(tokio::sync::Notify::new());

        let task = {
            let scheduler = Arc::clone(&scheduler);
            let cleared = Arc::clone(&cleared);
            tokio::spawn(async move {
                scheduler
                    .enqueue("throttled", || {
                        let cleared = Arc::clone(&cleared);
                        async move {
                            cleared.notify_one();
                            Err::<(), _>(ProviderError::new(429, "slow"))
                        }
                    })
                    .await
            })
        };

        cleared.notified().await;
        scheduler.clear();
        let result = task.await.unwrap();
        assert_eq!(result, Err(SchedulerError::Cleared));
    }

    #[test]
    fn test_scheduler_error_provider_error() {
        let error = SchedulerError::RetriesExhausted {
            attempts: 4,
            last: ProviderError::new(429, "slow"),
        };
        assert_eq!(error.provider_error().map(|e| e.status), Some(429));
        assert!(SchedulerError::Cleared.provider_error().is_none());
    }
}
