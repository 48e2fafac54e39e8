use super::{ChargeStatus, GatewayResult, PaymentGateway};
use crate::domain::{Money, PaymentMethod};
use crate::retry::{retry_with_backoff, CircuitBreaker, CircuitBreakerState, RetryConfig};
use crate::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Wraps a processor client with retries and a circuit breaker.
///
/// Charges are safe to retry because every attempt carries the same
/// idempotency key. Only `GatewayUnavailable` is retried.
#[derive(Debug)]
pub struct ResilientGateway<G> {
    inner: G,
    retry: RetryConfig,
    breaker: CircuitBreaker,
}

impl<G: PaymentGateway> ResilientGateway<G> {
    pub fn new(inner: G, retry: RetryConfig) -> Self {
        Self::with_breaker(inner, retry, CircuitBreaker::new(5, Duration::from_secs(30)))
    }

    pub fn with_breaker(inner: G, retry: RetryConfig, breaker: CircuitBreaker) -> Self {
        Self {
            inner,
            retry,
            breaker,
        }
    }

    pub fn inner(&self) -> &G {
        &self.inner
    }

    pub fn breaker_state(&self) -> CircuitBreakerState {
        self.breaker.state()
    }
}

#[async_trait]
impl<G: PaymentGateway> PaymentGateway for ResilientGateway<G> {
    async fn charge(
        &self,
        amount: Money,
        method: PaymentMethod,
        idempotency_key: &str,
    ) -> Result<GatewayResult> {
        retry_with_backoff(&self.retry, "gateway.charge", move || {
            self.breaker
                .call(move || self.inner.charge(amount, method, idempotency_key))
        })
        .await
    }

    async fn refund(&self, transaction_ref: &str, amount: Money) -> Result<GatewayResult> {
        retry_with_backoff(&self.retry, "gateway.refund", move || {
            self.breaker
                .call(move || self.inner.refund(transaction_ref, amount))
        })
        .await
    }

    async fn query_status(&self, reference: &str) -> Result<ChargeStatus> {
        retry_with_backoff(&self.retry, "gateway.query_status", move || {
            self.breaker.call(move || self.inner.query_status(reference))
        })
        .await
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChargeOutcome, RefundOutcome, SimulatedGateway};
    use crate::BoxOfficeError;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    #[tokio::test]
    async fn test_transient_charge_failures_are_retried_once_booked() {
        let simulated = SimulatedGateway::new();
        simulated.script_charges([ChargeOutcome::Unavailable, ChargeOutcome::ApproveThenUnavailable]);
        let gateway = ResilientGateway::new(simulated, fast_retry(4));

        let result = gateway
            .charge(Money::from_cents(7_500), PaymentMethod::Card, "r1:0")
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(gateway.inner().charge_calls(), 3);
        assert_eq!(gateway.inner().booked_charges(), 1);
    }

    #[tokio::test]
    async fn test_declines_are_not_retried() {
        let simulated = SimulatedGateway::new();
        simulated.script_charges([ChargeOutcome::Decline("card expired".to_string())]);
        let gateway = ResilientGateway::new(simulated, fast_retry(4));

        let result = gateway
            .charge(Money::from_cents(100), PaymentMethod::Card, "r2:0")
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(gateway.inner().charge_calls(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_unavailable() {
        let simulated = SimulatedGateway::new();
        simulated.script_refunds([
            RefundOutcome::Unavailable,
            RefundOutcome::Unavailable,
            RefundOutcome::Unavailable,
        ]);
        let gateway = ResilientGateway::with_breaker(
            simulated,
            fast_retry(2),
            CircuitBreaker::new(2, Duration::from_secs(60)),
        );
        let charge = gateway
            .charge(Money::from_cents(100), PaymentMethod::Card, "r3:0")
            .await
            .unwrap();
        let transaction_ref = charge.transaction_ref.unwrap();

        let refund = gateway.refund(&transaction_ref, Money::from_cents(100)).await;
        assert!(matches!(refund, Err(BoxOfficeError::GatewayUnavailable(_))));
        assert_eq!(gateway.breaker_state(), CircuitBreakerState::Open);

        // Open breaker short-circuits without reaching the processor
        let calls = gateway.inner().refund_calls();
        let refund = gateway.refund(&transaction_ref, Money::from_cents(100)).await;
        assert!(matches!(refund, Err(BoxOfficeError::GatewayUnavailable(_))));
        assert_eq!(gateway.inner().refund_calls(), calls);
    }
}
