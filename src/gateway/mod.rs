pub mod resilient;
pub mod simulated;

pub use resilient::ResilientGateway;
pub use simulated::{ChargeOutcome, RefundOutcome, SimulatedGateway};

use crate::config::{GatewayMode, Settings};
use crate::domain::{Money, PaymentMethod};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Answer of the processor for a charge or a refund
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResult {
    pub success: bool,
    pub transaction_ref: Option<String>,
    pub message: Option<String>,
}

impl GatewayResult {
    pub fn approved(transaction_ref: impl Into<String>) -> Self {
        Self {
            success: true,
            transaction_ref: Some(transaction_ref.into()),
            message: None,
        }
    }

    pub fn declined(message: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_ref: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayStatus {
    Pending,
    Succeeded,
    Failed,
}

/// What the processor knows about a charge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeStatus {
    pub status: GatewayStatus,
    pub transaction_ref: Option<String>,
}

impl ChargeStatus {
    pub fn unknown() -> Self {
        Self {
            status: GatewayStatus::Pending,
            transaction_ref: None,
        }
    }
}

/// Outbound money movement.
///
/// `Err(GatewayUnavailable)` means the outcome is unknown (timeout, network
/// failure); `Ok` with `success == false` is a definitive decline.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Charges `amount`. Calls repeated with the same `idempotency_key` never
    /// charge twice.
    async fn charge(
        &self,
        amount: Money,
        method: PaymentMethod,
        idempotency_key: &str,
    ) -> Result<GatewayResult>;

    /// Refunds the charge `transaction_ref`. Refunding a charge that was
    /// already refunded approves again without moving money, so a refund
    /// whose result was lost can simply be sent again.
    async fn refund(&self, transaction_ref: &str, amount: Money) -> Result<GatewayResult>;

    /// Looks a charge up by its transaction reference or by the idempotency
    /// key it was submitted with
    async fn query_status(&self, reference: &str) -> Result<ChargeStatus>;

    fn name(&self) -> &str;
}

/// Builds the gateway described by `settings`.
///
/// Test mode gets the in-process simulator behind the retry wrapper. Live
/// mode needs a processor client supplied by the host through
/// [`ResilientGateway::new`], so asking for one here is a configuration error.
pub fn build_gateway(settings: &Settings) -> Result<Arc<dyn PaymentGateway>> {
    match settings.gateway.mode {
        GatewayMode::Test => {
            info!(
                "Using simulated payment gateway (currency {})",
                settings.gateway.currency
            );
            Ok(Arc::new(ResilientGateway::new(
                SimulatedGateway::new(),
                settings.retry.to_retry_config(),
            )))
        }
        GatewayMode::Live => Err(config::ConfigError::Message(
            "live gateway mode requires a processor adapter injected by the host".to_string(),
        )
        .into()),
    }
}
