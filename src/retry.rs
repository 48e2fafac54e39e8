use crate::{BoxOfficeError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Retry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn with_delays(max_attempts: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay,
            ..Default::default()
        }
    }

    pub fn payment_gateway() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Retry a future with exponential backoff.
///
/// Only transient failures ([`BoxOfficeError::is_retryable`]) are retried;
/// anything else is returned on the first occurrence.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 1;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!("Operation '{}' succeeded on attempt {}", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempt >= config.max_attempts {
                    error!(
                        "Operation '{}' failed after {} attempts. Final error: {}",
                        operation_name, config.max_attempts, e
                    );
                    return Err(e);
                }

                warn!(
                    "Operation '{}' failed on attempt {} ({}). Retrying in {:?}...",
                    operation_name, attempt, e, delay
                );

                sleep(delay).await;

                // Calculate next delay with exponential backoff
                delay = Duration::from_millis(
                    ((delay.as_millis() as f64) * config.backoff_multiplier) as u64,
                )
                .min(config.max_delay);

                // Add jitter if enabled
                if config.jitter {
                    let jitter_ms = (delay.as_millis() as f64 * 0.1 * rand::random::<f64>()) as u64;
                    delay += Duration::from_millis(jitter_ms);
                }

                attempt += 1;
            }
        }
    }
}

/// Circuit breaker for preventing cascading failures
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_count: AtomicU32,
    last_failure_time: Mutex<Option<Instant>>,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<CircuitBreakerState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            last_failure_time: Mutex::new(None),
            failure_threshold,
            recovery_timeout,
            state: Mutex::new(CircuitBreakerState::Closed),
        }
    }

    pub fn state(&self) -> CircuitBreakerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Runs `operation` unless the breaker is open. Only transient failures
    /// count towards opening it.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.should_allow_call() {
            return Err(BoxOfficeError::GatewayUnavailable(
                "circuit breaker is open".to_string(),
            ));
        }

        match operation().await {
            Ok(result) => {
                self.on_success();
                Ok(result)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.on_failure();
                }
                Err(e)
            }
        }
    }

    fn should_allow_call(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match *state {
            CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => {
                // Check if recovery timeout has passed
                let last_failure = *self
                    .last_failure_time
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                match last_failure {
                    Some(last_failure) if last_failure.elapsed() >= self.recovery_timeout => {
                        *state = CircuitBreakerState::HalfOpen;
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    fn on_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = CircuitBreakerState::Closed;
    }

    fn on_failure(&self) {
        let failure_count = self.failure_count.fetch_add(1, Ordering::Relaxed) + 1;
        *self
            .last_failure_time
            .lock()
            .unwrap_or_else(|p| p.into_inner()) = Some(Instant::now());

        if failure_count >= self.failure_threshold {
            *self.state.lock().unwrap_or_else(|p| p.into_inner()) = CircuitBreakerState::Open;
            warn!("Circuit breaker opened after {} failures", failure_count);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_backoff(&fast_retry(3), "flaky", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(BoxOfficeError::GatewayUnavailable("timeout".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_does_not_retry_business_errors() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<()> = retry_with_backoff(&fast_retry(5), "conflict", || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(BoxOfficeError::StateConflict("stale".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(BoxOfficeError::StateConflict(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_circuit_breaker_opens_and_recovers() {
        let breaker = CircuitBreaker::new(2, Duration::from_millis(20));

        for _ in 0..2 {
            let _: Result<()> = breaker
                .call(|| async { Err(BoxOfficeError::GatewayUnavailable("down".to_string())) })
                .await;
        }
        assert_eq!(breaker.state(), CircuitBreakerState::Open);

        let rejected: Result<()> = breaker.call(|| async { Ok(()) }).await;
        assert!(matches!(rejected, Err(BoxOfficeError::GatewayUnavailable(_))));

        tokio::time::sleep(Duration::from_millis(30)).await;
        breaker.call(|| async { Ok(()) }).await.unwrap();
        assert_eq!(breaker.state(), CircuitBreakerState::Closed);
    }
}
