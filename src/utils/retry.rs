use std::time::Duration;

use tokio::time::sleep;

use crate::metrics::Metrics;

// ============================================================================
// Exponential Backoff
// ============================================================================
//
// Used for:
// - connecting to the event store at startup
// - (re)opening a replication channel to a peer datacenter
// - pacing restarts of a failed replication link
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Attempts before giving up. `None` retries forever.
    pub max_attempts: Option<u32>,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Some(3),
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Startup dependencies: a handful of patient attempts.
    pub fn startup() -> Self {
        Self {
            max_attempts: Some(10),
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }

    /// Replication links never give up on a peer.
    pub fn link() -> Self {
        Self {
            max_attempts: None,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Delay sequence for one retried operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: u32,
    delay: Duration,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        let delay = config.initial_delay;
        Self {
            config,
            attempt: 0,
            delay,
        }
    }

    /// Failed attempts so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.attempt += 1;
        if self.config.max_attempts.is_some_and(|max| self.attempt >= max) {
            return None;
        }
        let delay = self.delay;
        self.delay = Duration::from_millis((delay.as_millis() as f64 * self.config.multiplier) as u64)
            .min(self.config.max_delay);
        Some(delay)
    }

    /// Start over after the operation made progress.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.delay = self.config.initial_delay;
    }
}

#[derive(Debug)]
pub enum RetryResult<T, E> {
    Success(T),
    /// Attempts exhausted; carries the last error.
    Failed(E),
    /// The error is not worth retrying.
    PermanentFailure(E),
}

impl<T, E> RetryResult<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        match self {
            RetryResult::Success(value) => Ok(value),
            RetryResult::Failed(err) | RetryResult::PermanentFailure(err) => Err(err),
        }
    }
}

/// Whether retrying an operation that failed with this error can help.
pub trait IsTransient {
    fn is_transient(&self) -> bool;
}

/// Retry `operation` with backoff, treating every error as transient.
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation_name: &str,
    config: RetryConfig,
    metrics: Option<&Metrics>,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_when(operation_name, config, metrics, |_| true, operation).await
}

/// Retry `operation` with backoff while its errors are transient.
pub async fn retry_on_transient<F, Fut, T, E>(
    operation_name: &str,
    config: RetryConfig,
    metrics: Option<&Metrics>,
    operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + IsTransient,
{
    retry_when(operation_name, config, metrics, E::is_transient, operation).await
}

async fn retry_when<F, Fut, T, E>(
    operation_name: &str,
    config: RetryConfig,
    metrics: Option<&Metrics>,
    transient: impl Fn(&E) -> bool,
    mut operation: F,
) -> RetryResult<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config);

    loop {
        let attempt = backoff.attempt() + 1;
        if let Some(metrics) = metrics {
            metrics.record_retry_attempt(operation_name, attempt);
        }

        let error = match operation(attempt).await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::info!(operation = operation_name, attempt, "✅ Succeeded after retry");
                }
                return RetryResult::Success(result);
            }
            Err(error) => error,
        };

        if !transient(&error) {
            tracing::error!(operation = operation_name, error = %error, "Permanent failure, not retrying");
            return RetryResult::PermanentFailure(error);
        }

        let Some(delay) = backoff.next_delay() else {
            tracing::error!(operation = operation_name, attempt, error = %error, "❌ Giving up after all retries");
            if let Some(metrics) = metrics {
                metrics.record_retry_exhausted(operation_name);
            }
            return RetryResult::Failed(error);
        };

        tracing::warn!(
            operation = operation_name,
            attempt,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Transient failure, retrying after delay"
        );
        sleep(delay).await;
    }
}
