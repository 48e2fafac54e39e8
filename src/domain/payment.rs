use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schemas::{Money, PaymentId, ReservationId};
use crate::{BoxOfficeError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    Card,
    PayPal,
    Stripe,
    Transfer,
    Cash,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum PaymentStatus {
    #[serde(rename = "EN_ATTENTE")]
    Pending,
    #[serde(rename = "REUSSI")]
    Succeeded,
    #[serde(rename = "ECHOUE")]
    Failed,
    #[serde(rename = "REMBOURSE")]
    Refunded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    pub payment_id: PaymentId,
    pub reservation_id: ReservationId,
    pub amount: Money,
    pub method: Option<PaymentMethod>,
    pub status: PaymentStatus,
    pub transaction_ref: Option<String>,
    /// Number of definitive charge declines so far; part of the idempotency key
    pub attempts: u32,
    pub failure_reason: Option<String>,
    /// A charge under the current idempotency key was sent but its answer
    /// never came back
    #[serde(default)]
    pub charge_in_doubt: bool,
    pub paid_at: Option<DateTime<Utc>>,
    /// Set when a refund was due but the gateway could not process it
    pub refund_pending: bool,
    pub refund_ref: Option<String>,
}

impl Payment {
    pub fn new(payment_id: PaymentId, reservation_id: ReservationId, amount: Money) -> Self {
        Self {
            payment_id,
            reservation_id,
            amount,
            method: None,
            status: PaymentStatus::Pending,
            transaction_ref: None,
            attempts: 0,
            failure_reason: None,
            charge_in_doubt: false,
            paid_at: None,
            refund_pending: false,
            refund_ref: None,
        }
    }

    pub fn is_paid(&self) -> bool {
        self.status == PaymentStatus::Succeeded
    }

    /// Key sent with the next charge attempt. It only changes after a
    /// definitive decline, so a retry after a transient failure reuses it.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.reservation_id, self.attempts)
    }

    pub fn record_success(
        &mut self,
        method: PaymentMethod,
        transaction_ref: String,
        now: DateTime<Utc>,
    ) {
        self.method = Some(method);
        self.status = PaymentStatus::Succeeded;
        self.transaction_ref = Some(transaction_ref);
        self.failure_reason = None;
        self.charge_in_doubt = false;
        self.paid_at = Some(now);
    }

    /// Records a charge attempt whose outcome is unknown. Returns whether
    /// anything changed.
    pub fn record_unknown_outcome(&mut self, method: PaymentMethod) -> bool {
        let changed = self.method != Some(method) || !self.charge_in_doubt;
        self.method = Some(method);
        self.charge_in_doubt = true;
        changed
    }

    /// Whether the processor must be asked before the payment can be
    /// treated as unpaid
    pub fn needs_verification(&self) -> bool {
        self.charge_in_doubt && !self.is_paid()
    }

    /// Success learned after the fact from the processor; the method is
    /// whatever was recorded when the charge was attempted.
    pub fn record_settled(&mut self, transaction_ref: String, now: DateTime<Utc>) {
        self.status = PaymentStatus::Succeeded;
        self.transaction_ref = Some(transaction_ref);
        self.failure_reason = None;
        self.charge_in_doubt = false;
        self.paid_at = Some(now);
    }

    pub fn record_decline(
        &mut self,
        method: PaymentMethod,
        transaction_ref: Option<String>,
        reason: String,
    ) {
        self.method = Some(method);
        self.status = PaymentStatus::Failed;
        self.transaction_ref = transaction_ref;
        self.failure_reason = Some(reason);
        self.charge_in_doubt = false;
        self.attempts += 1;
    }

    pub fn mark_refunded(&mut self, refund_ref: String) -> Result<()> {
        match self.status {
            PaymentStatus::Succeeded => {
                self.status = PaymentStatus::Refunded;
                self.refund_pending = false;
                self.refund_ref = Some(refund_ref);
                Ok(())
            }
            PaymentStatus::Pending | PaymentStatus::Failed | PaymentStatus::Refunded => {
                Err(BoxOfficeError::StateConflict(format!(
                    "payment {} cannot be refunded from {:?}",
                    self.payment_id, self.status
                )))
            }
        }
    }
}
