use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::payment::{Payment, PaymentStatus};
use super::schemas::{CategoryId, CustomerId, EventId, PaymentId, ReservationId};
use crate::ledger::HoldToken;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReservationStatus {
    #[serde(rename = "EN_ATTENTE")]
    Pending,
    #[serde(rename = "CONFIRMEE")]
    Confirmed,
    #[serde(rename = "ANNULEE")]
    Cancelled,
}

/// Why a reservation ended up cancelled
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CancellationCause {
    Customer,
    EventCancelled,
    HoldExpired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReservation {
    pub event_id: EventId,
    pub category_id: CategoryId,
    pub quantity: u32,
    pub customer_id: CustomerId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub payment_id: PaymentId,
    pub customer_id: CustomerId,
    pub event_id: EventId,
    pub category_id: CategoryId,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub hold: HoldToken,
    pub hold_expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancellation: Option<CancellationCause>,
    /// Bumped on every committed change; commits carry the version they read.
    pub version: u64,
}

impl Reservation {
    pub fn new(
        request: CreateReservation,
        payment_id: PaymentId,
        hold: HoldToken,
        created_at: DateTime<Utc>,
        hold_expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            reservation_id: ReservationId::new(),
            payment_id,
            customer_id: request.customer_id,
            event_id: request.event_id,
            category_id: request.category_id,
            quantity: request.quantity,
            status: ReservationStatus::Pending,
            hold,
            hold_expires_at,
            created_at,
            cancelled_at: None,
            cancellation: None,
            version: 0,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            ReservationStatus::Pending | ReservationStatus::Confirmed
        )
    }

    pub fn hold_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && now >= self.hold_expires_at
    }

    pub fn confirm(&mut self) {
        self.status = ReservationStatus::Confirmed;
        self.version += 1;
    }

    pub fn cancel(&mut self, cause: CancellationCause, now: DateTime<Utc>) {
        self.status = ReservationStatus::Cancelled;
        self.cancellation = Some(cause);
        self.cancelled_at = Some(now);
        self.version += 1;
    }
}

/// Position of a (reservation, payment) pair in the lifecycle state machine.
///
/// ```text
/// PendingHold -> PendingPayment -> Confirmed -> Cancelling -> Cancelled
///                      \-> PaymentFailed -> (retry -> PendingPayment | abandoned -> Cancelled)
/// ```
///
/// `PendingHold` and `Cancelling` only exist while an operation is in flight;
/// stored records always map to one of the other four.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LifecyclePhase {
    PendingHold,
    PendingPayment,
    PaymentFailed,
    Confirmed,
    Cancelling,
    Cancelled,
}

pub fn phase(reservation: &Reservation, payment: &Payment) -> LifecyclePhase {
    match (reservation.status, payment.status) {
        (ReservationStatus::Cancelled, _) => LifecyclePhase::Cancelled,
        (ReservationStatus::Confirmed, _) => LifecyclePhase::Confirmed,
        (ReservationStatus::Pending, PaymentStatus::Failed) => LifecyclePhase::PaymentFailed,
        (ReservationStatus::Pending, _) => LifecyclePhase::PendingPayment,
    }
}
