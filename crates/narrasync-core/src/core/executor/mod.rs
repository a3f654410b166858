//! Retry / Timeout Executor
//!
//! Runs a fallible backend call as an explicit bounded-attempt state machine:
//! every attempt is raced against a deadline and a cancellation token, transient
//! failures are retried after a backoff delay, everything else ends the run.
//!
//! The delay itself goes through a [`Sleeper`], so tests can observe the
//! schedule without waiting for it.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use crate::core::config::ProcessingConfig;
use crate::core::{CoreError, CoreResult, ExecutionError, ExecutionErrorKind, FailureReason};

// =============================================================================
// Policy
// =============================================================================

/// Attempt budget, backoff curve and per-attempt deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// Growth between consecutive delays, 150 = x1.5
    pub backoff_percent: u32,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ProcessingConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ProcessingConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            backoff_percent: config.backoff_percent.max(100),
            max_delay: Duration::from_millis(config.max_retry_delay_ms),
            attempt_timeout: Duration::from_millis(config.attempt_timeout_ms.max(1)),
        }
    }

    /// Delay to wait after failed attempt `attempt` (1-based): `base * growth^(attempt-1)`, capped
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let growth = f64::from(self.backoff_percent) / 100.0;
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let millis = self.base_delay.as_millis() as f64 * growth.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

// =============================================================================
// Sleepers
// =============================================================================

/// Source of backoff delays
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Real delays on the tokio timer
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately
#[derive(Debug, Clone, Default)]
pub struct RecordingSleeper {
    delays: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays requested so far, in order
    pub fn delays(&self) -> Vec<Duration> {
        self.delays
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut delays) = self.delays.lock() {
            delays.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Successful run: the value plus the attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Executed<T> {
    pub value: T,
    pub attempts: u32,
}

/// Called with the operation name and the 1-based attempt number before every attempt
pub type AttemptObserver = Arc<dyn Fn(&str, u32) + Send + Sync>;

/// Executes backend calls under a [`RetryPolicy`]
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    observer: Option<AttemptObserver>,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            sleeper: Arc::new(TokioSleeper),
            observer: None,
        }
    }

    /// Replaces the backoff sleeper
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Installs an observer notified before each attempt
    pub fn with_observer(mut self, observer: AttemptObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `op` until it succeeds, fails permanently, exhausts its attempts or is cancelled.
    ///
    /// `operation` is named `<backend>:<action>`; the backend part labels
    /// timeout failures. `op` receives the 1-based attempt number.
    pub async fn execute<T, F, Fut>(
        &self,
        operation: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Executed<T>, ExecutionError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = CoreResult<T>>,
    {
        let backend = operation.split(':').next().unwrap_or(operation);
        let timeout = self.policy.attempt_timeout;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(failure(
                    operation,
                    ExecutionErrorKind::Cancelled,
                    attempt - 1,
                    CoreError::Cancelled,
                ));
            }

            if let Some(observer) = &self.observer {
                observer(operation, attempt);
            }
            let span = info_span!("backend_attempt", operation = %operation, attempt);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = tokio::time::timeout(timeout, op(attempt)).instrument(span) => Some(result),
            };

            let error = match outcome {
                None => {
                    debug!(operation, attempt, "Attempt cancelled in flight");
                    return Err(failure(
                        operation,
                        ExecutionErrorKind::Cancelled,
                        attempt,
                        CoreError::Cancelled,
                    ));
                }
                Some(Ok(Ok(value))) => {
                    if attempt > 1 {
                        debug!(operation, attempts = attempt, "Succeeded after retry");
                    }
                    return Ok(Executed {
                        value,
                        attempts: attempt,
                    });
                }
                Some(Ok(Err(e))) => e,
                Some(Err(_)) => CoreError::transient(
                    backend,
                    FailureReason::Timeout,
                    format!("attempt {attempt} exceeded {} ms", timeout.as_millis()),
                ),
            };

            if matches!(error, CoreError::Cancelled) {
                return Err(failure(
                    operation,
                    ExecutionErrorKind::Cancelled,
                    attempt,
                    error,
                ));
            }
            if !error.is_transient() {
                warn!(operation, attempt, "Permanent failure, not retrying: {}", error);
                return Err(failure(
                    operation,
                    ExecutionErrorKind::Permanent,
                    attempt,
                    error,
                ));
            }
            if attempt >= self.policy.max_attempts {
                warn!(operation, attempts = attempt, "Retries exhausted: {}", error);
                return Err(failure(
                    operation,
                    ExecutionErrorKind::RetriesExhausted,
                    attempt,
                    error,
                ));
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying: {}",
                error
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(failure(
                        operation,
                        ExecutionErrorKind::Cancelled,
                        attempt,
                        error,
                    ));
                }
                _ = self.sleeper.sleep(delay) => {}
            }
        }
    }
}

fn failure(
    operation: &str,
    kind: ExecutionErrorKind,
    attempts: u32,
    cause: CoreError,
) -> ExecutionError {
    ExecutionError {
        operation: operation.to_string(),
        kind,
        attempts,
        last_cause: Box::new(cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1000),
            backoff_percent: 150,
            max_delay: Duration::from_millis(2000),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    fn executor(max_attempts: u32) -> (RetryExecutor, RecordingSleeper) {
        let sleeper = RecordingSleeper::new();
        let executor =
            RetryExecutor::new(policy(max_attempts)).with_sleeper(Arc::new(sleeper.clone()));
        (executor, sleeper)
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = policy(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(30), Duration::from_millis(2000));
    }

    #[test]
    fn policy_from_config_clamps_attempts() {
        let mut config = ProcessingConfig::default();
        config.max_attempts = 0;
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(policy.attempt_timeout, Duration::from_millis(180_000));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let (executor, sleeper) = executor(3);
        let calls = AtomicU32::new(0);

        let result = executor
            .execute("comfyui:image", &CancellationToken::new(), |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(CoreError::transient("comfyui", FailureReason::ServerBusy, "busy"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            sleeper.delays(),
            vec![Duration::from_millis(1000), Duration::from_millis(1500)]
        );
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let (executor, sleeper) = executor(3);

        let err = executor
            .execute("voicevox:voice", &CancellationToken::new(), |_| async {
                Err::<(), _>(CoreError::transient(
                    "voicevox",
                    FailureReason::Transport,
                    "connection refused",
                ))
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ExecutionErrorKind::RetriesExhausted);
        assert_eq!(err.attempts, 3);
        assert!(err.last_cause.is_transient());
        assert_eq!(sleeper.delays().len(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let (executor, sleeper) = executor(3);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute("midjourney:image", &CancellationToken::new(), |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err::<(), _>(CoreError::permanent(
                        "midjourney",
                        FailureReason::ContentRejected,
                        "banned prompt",
                    ))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ExecutionErrorKind::Permanent);
        assert_eq!(err.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(sleeper.delays().is_empty());
        assert!(CoreError::from(err).is_content_rejection());
    }

    #[tokio::test]
    async fn attempt_timeout_counts_as_transient() {
        let sleeper = RecordingSleeper::new();
        let mut policy = policy(2);
        policy.attempt_timeout = Duration::from_millis(20);
        let executor = RetryExecutor::new(policy).with_sleeper(Arc::new(sleeper.clone()));

        let result = executor
            .execute("comfyui:image", &CancellationToken::new(), |attempt| async move {
                if attempt == 1 {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                }
                Ok(attempt)
            })
            .await
            .unwrap();

        assert_eq!(result.value, 2);
        assert_eq!(result.attempts, 2);
        assert_eq!(sleeper.delays().len(), 1);
    }

    #[tokio::test]
    async fn timeout_failure_is_reported_against_backend() {
        let sleeper = RecordingSleeper::new();
        let mut policy = policy(1);
        policy.attempt_timeout = Duration::from_millis(10);
        let executor = RetryExecutor::new(policy).with_sleeper(Arc::new(sleeper));

        let err = executor
            .execute("comfyui:image", &CancellationToken::new(), |_| async {
                std::future::pending::<CoreResult<()>>().await
            })
            .await
            .unwrap_err();

        let failure = err.last_cause.backend_failure().unwrap();
        assert_eq!(failure.backend, "comfyui");
        assert_eq!(failure.reason, FailureReason::Timeout);
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_attempt() {
        let (executor, _) = executor(3);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let err = executor
            .execute("comfyui:image", &cancel, |_| async {
                std::future::pending::<CoreResult<()>>().await
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ExecutionErrorKind::Cancelled);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn cancelled_token_prevents_first_attempt() {
        let (executor, _) = executor(3);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let err = executor
            .execute("voicevox:voice", &cancel, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.kind, ExecutionErrorKind::Cancelled);
        assert_eq!(err.attempts, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn observer_sees_every_attempt() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let executor = RetryExecutor::new(policy(3))
            .with_sleeper(Arc::new(RecordingSleeper::new()))
            .with_observer(Arc::new(move |operation: &str, attempt| {
                sink.lock().unwrap().push(format!("{operation}#{attempt}"));
            }));

        executor
            .execute("openai:voice", &CancellationToken::new(), |attempt| async move {
                if attempt == 1 {
                    Err(CoreError::transient("openai", FailureReason::RateLimited, "429"))
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["openai:voice#1", "openai:voice#2"]);
    }
}
