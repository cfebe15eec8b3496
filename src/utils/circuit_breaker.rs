use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::metrics::Metrics;

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards connection attempts to one peer datacenter. After
// `failure_threshold` consecutive failures the breaker opens and further
// attempts fail fast until `timeout` has elapsed; then a trial attempt is
// let through (half-open) and `success_threshold` successes close it again.
//
// States:
// - Closed: attempts pass through
// - Open: attempts refused immediately
// - HalfOpen: trial attempts allowed
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 closed, 1 open, 2 half-open.
    fn gauge(&self) -> u8 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    /// How long the breaker stays open before a trial attempt.
    pub timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            success_threshold: 1,
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    state: Arc<Mutex<BreakerState>>,
    config: CircuitBreakerConfig,
    metrics: Option<Arc<Metrics>>,
}

struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker open")]
    CircuitOpen,

    #[error("{0}")]
    OperationFailed(E),
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            config,
            metrics: None,
        }
    }

    /// Report state changes to the breaker gauges.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `operation` unless the breaker is open.
    pub async fn call<F, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: std::future::Future<Output = Result<T, E>>,
    {
        {
            let mut state = self.state.lock().await;
            if state.state == CircuitState::Open {
                let cooled_down = state
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.timeout)
                    .unwrap_or(true);
                if !cooled_down {
                    return Err(CircuitBreakerError::CircuitOpen);
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                state.success_count = 0;
            }
        }

        match operation.await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(err) => {
                self.record_failure().await;
                Err(CircuitBreakerError::OperationFailed(err))
            }
        }
    }

    async fn record_success(&self) {
        let mut state = self.state.lock().await;
        match state.state {
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    self.transition(&mut state, CircuitState::Closed);
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.opened_at = None;
                }
            }
            CircuitState::Closed => state.failure_count = 0,
            // A call admitted before another one opened the breaker.
            CircuitState::Open => {}
        }
    }

    async fn record_failure(&self) {
        let mut state = self.state.lock().await;
        state.failure_count += 1;

        match state.state {
            CircuitState::Closed if state.failure_count >= self.config.failure_threshold => {
                self.transition(&mut state, CircuitState::Open);
                state.opened_at = Some(Instant::now());
            }
            CircuitState::HalfOpen => {
                self.transition(&mut state, CircuitState::Open);
                state.opened_at = Some(Instant::now());
                state.success_count = 0;
            }
            _ => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;

        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                failures = state.failure_count,
                "🔴 Circuit breaker opened"
            ),
            CircuitState::HalfOpen => {
                tracing::info!(breaker = %self.name, "🟡 Circuit breaker half-open, trying again")
            }
            CircuitState::Closed => tracing::info!(breaker = %self.name, "🟢 Circuit breaker closed"),
        }

        if let Some(metrics) = &self.metrics {
            metrics.update_circuit_breaker_state(to.gauge());
            metrics.record_circuit_breaker_transition(from.as_str(), to.as_str());
        }
    }

    pub async fn get_state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    pub async fn get_failure_count(&self) -> u32 {
        self.state.lock().await.failure_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failures: u32, timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "peer-us",
            CircuitBreakerConfig {
                failure_threshold: failures,
                timeout,
                success_threshold: 1,
            },
        )
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_after_failures() {
        let cb = breaker(3, Duration::from_secs(1));

        for _ in 0..3 {
            let result = cb.call(async { Err::<(), _>("refused") }).await;
            assert!(matches!(result, Err(CircuitBreakerError::OperationFailed("refused"))));
        }
        assert_eq!(cb.get_state().await, CircuitState::Open);

        let result = cb.call(async { Ok::<_, &str>(()) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::CircuitOpen)));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count_while_closed() {
        let cb = breaker(3, Duration::from_secs(1));
        let _ = cb.call(async { Err::<(), _>("refused") }).await;
        let _ = cb.call(async { Err::<(), _>("refused") }).await;
        assert_eq!(cb.get_failure_count().await, 2);

        cb.call(async { Ok::<_, &str>(()) }).await.unwrap();
        assert_eq!(cb.get_failure_count().await, 0);
        assert_eq!(cb.get_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_half_open_trial_closes_or_reopens() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let cb = breaker(2, Duration::from_millis(100)).with_metrics(metrics.clone());

        for _ in 0..2 {
            let _ = cb.call(async { Err::<(), _>("refused") }).await;
        }
        assert_eq!(metrics.circuit_breaker_state.get(), 1);

        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = cb.call(async { Err::<(), _>("still down") }).await;
        assert_eq!(cb.get_state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cb.call(async { Ok::<_, &str>(()) }).await.is_ok());
        assert_eq!(cb.get_state().await, CircuitState::Closed);
        assert_eq!(metrics.circuit_breaker_state.get(), 0);
        assert_eq!(
            metrics
                .circuit_breaker_transitions
                .with_label_values(&["half_open", "open"])
                .get(),
            1
        );
    }
}
