//! Resilience utilities: retry with backoff and leading+trailing throttling.
//!
//! - [`RetryConfig`] / [`retry_with_backoff`]: exponential backoff for the
//!   connect → authenticate → start replication sequence
//! - [`Throttle`]: coalesces bursts of triggers into at most one run per
//!   window, used for snapshots and outbound pushes
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use satellite_sync::resilience::Throttle;
//! use std::time::Duration;
//!
//! let throttle = Throttle::new(Duration::from_millis(40), || {
//!     Box::pin(async { /* perform snapshot */ })
//! });
//! throttle.trigger(); // runs now (leading edge)
//! throttle.trigger(); // coalesced into one trailing run
//! throttle.trigger(); // absorbed
//! # }
//! ```

use crate::error::{Result, SyncError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Configuration for connection retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts.
    /// Set to `usize::MAX` for infinite retries.
    pub max_attempts: usize,

    /// Delay before the second attempt.
    pub initial_delay: Duration,

    /// Maximum delay between retries (ceiling for exponential backoff).
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        }
    }
}

impl RetryConfig {
    /// Calculate delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let multiplier = self.backoff_factor.powi((attempt - 1) as i32);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        let delay = Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()));

        std::cmp::min(delay, self.max_delay)
    }
}

/// Run `op` until it succeeds, the attempts run out, or `should_retry`
/// rejects the error.
///
/// Each attempt is bounded by `connection_timeout`; an elapsed attempt is
/// reported as a `TIMEOUT` error and retried like any transient failure.
/// The last error is returned unchanged so callers can tell an abandoned
/// retry (predicate said no) from an exhausted one.
pub async fn retry_with_backoff<T, F, Fut, P>(
    config: &RetryConfig,
    op_name: &str,
    should_retry: P,
    mut op: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    P: Fn(&SyncError) -> bool,
{
    let mut attempt = 1;
    loop {
        let outcome = match tokio::time::timeout(config.connection_timeout, op(attempt)).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::new(
                crate::error::ErrorCode::Timeout,
                format!("{op_name} attempt {attempt} timed out"),
            )),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = op_name, attempt, "succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !should_retry(&e) => {
                warn!(op = op_name, attempt, error = %e, "giving up, error is not retryable");
                return Err(e);
            }
            Err(e) if attempt >= config.max_attempts => {
                warn!(op = op_name, attempt, error = %e, "retries exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

// =============================================================================
// Throttle (leading + trailing)
// =============================================================================

/// Action run by a [`Throttle`].
pub type ThrottledAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Default)]
struct ThrottleState {
    running: bool,
    pending: bool,
    last_run: Option<Instant>,
    task: Option<JoinHandle<()>>,
}

/// Leading+trailing throttle.
///
/// The first trigger runs the action immediately (or as soon as the window
/// since the previous run has elapsed). Triggers that arrive while a run is
/// in flight or waiting are coalesced into exactly one more run.
pub struct Throttle {
    window: Duration,
    action: ThrottledAction,
    state: Arc<Mutex<ThrottleState>>,
}

impl Throttle {
    pub fn new<F>(window: Duration, action: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        Self {
            window,
            action: Arc::new(action),
            state: Arc::new(Mutex::new(ThrottleState::default())),
        }
    }

    /// Request a run.
    pub fn trigger(&self) {
        let mut state = self.state.lock();
        if state.running {
            state.pending = true;
            return;
        }

        let initial_wait = state
            .last_run
            .map(|at| (at + self.window).saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO);

        state.running = true;
        state.pending = false;

        let window = self.window;
        let action = Arc::clone(&self.action);
        let shared = Arc::clone(&self.state);

        state.task = Some(tokio::spawn(async move {
            let mut wait = initial_wait;
            loop {
                if !wait.is_zero() {
                    tokio::time::sleep(wait).await;
                }
                (action)().await;

                let mut state = shared.lock();
                state.last_run = Some(Instant::now());
                if state.pending {
                    state.pending = false;
                    wait = window;
                } else {
                    state.running = false;
                    break;
                }
            }
        }));
    }

    /// True while a run is executing or scheduled.
    pub fn is_active(&self) -> bool {
        self.state.lock().running
    }

    /// Drop any scheduled run. A run already executing is aborted at its
    /// next await point.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        if let Some(task) = state.task.take() {
            task.abort();
        }
        state.running = false;
        state.pending = false;
    }
}

impl Drop for Throttle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProcessConfig;
    use crate::error::ErrorCode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_delay_for_attempt() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(1));
    }

    #[test]
    fn test_delay_for_attempt_zero() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(0), config.initial_delay);
    }

    #[test]
    fn test_delay_for_attempt_caps_at_max() {
        let config = RetryConfig {
            max_attempts: 100,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(5),
        };
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(config.delay_for_attempt(2000), Duration::from_secs(10));
    }

    /// The reconnect policy of the test configuration.
    fn fast() -> RetryConfig {
        ProcessConfig::for_testing().connection_retry()
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = retry_with_backoff(&fast(), "connect", |e| e.is_retryable(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SyncError::new(ErrorCode::SocketError, "refused"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_abandoned_on_fatal() {
        let calls = AtomicUsize::new(0);
        let result: Result<()> =
            retry_with_backoff(&fast(), "connect", |e| e.is_retryable(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::new(ErrorCode::AuthRequired, "no token")) }
            })
            .await;
        assert_eq!(result.unwrap_err().code(), ErrorCode::AuthRequired);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausted_returns_last_error() {
        let result: Result<()> =
            retry_with_backoff(&fast(), "connect", |_| true, |attempt| async move {
                Err(SyncError::new(ErrorCode::SocketError, format!("attempt {attempt}")))
            })
            .await;
        assert!(result.unwrap_err().to_string().contains("attempt 3"));
    }

    #[tokio::test]
    async fn test_retry_attempt_timeout() {
        let config = RetryConfig {
            max_attempts: 1,
            connection_timeout: Duration::from_millis(10),
            ..fast()
        };
        let result: Result<()> = retry_with_backoff(&config, "connect", |_| true, |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().code(), ErrorCode::Timeout);
    }

    fn counting_throttle(window: Duration, runs: Arc<AtomicUsize>, run_time: Duration) -> Throttle {
        Throttle::new(window, move || {
            let runs = Arc::clone(&runs);
            Box::pin(async move {
                tokio::time::sleep(run_time).await;
                runs.fetch_add(1, Ordering::SeqCst);
            })
        })
    }

    #[tokio::test]
    async fn test_throttle_leading_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let throttle = counting_throttle(Duration::from_millis(20), Arc::clone(&runs), Duration::ZERO);

        throttle.trigger();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(!throttle.is_active());
    }

    #[tokio::test]
    async fn test_throttle_coalesces_into_one_trailing_run() {
        let runs = Arc::new(AtomicUsize::new(0));
        let throttle =
            counting_throttle(Duration::from_millis(20), Arc::clone(&runs), Duration::from_millis(30));

        throttle.trigger();
        for _ in 0..10 {
            throttle.trigger();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(!throttle.is_active());
    }

    #[tokio::test]
    async fn test_throttle_cancel_drops_pending() {
        let runs = Arc::new(AtomicUsize::new(0));
        let throttle =
            counting_throttle(Duration::from_millis(50), Arc::clone(&runs), Duration::from_millis(30));

        throttle.trigger();
        throttle.trigger();
        throttle.cancel();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!throttle.is_active());
    }
}
