use crate::domain::{Event, EventStatus, Payment, Reservation};
use crate::BoxOfficeError;
use chrono::{DateTime, Duration, Utc};

/// Outcome of a cancellation request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationDecision {
    Allowed {
        refund_eligible: bool,
        /// The event was cancelled or deleted by its organizer; the cutoff
        /// window did not apply.
        organizer_triggered: bool,
    },
    Denied(DenialReason),
    /// Paid reservation inside the cutoff window. Carries what was left of
    /// the window when the request was made.
    LateCancellation { remaining: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenialReason {
    AlreadyCancelled,
}

impl CancellationDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }

    /// Error to surface for a refused cancellation, `None` when allowed
    pub fn into_error(self, reservation: &Reservation) -> Option<BoxOfficeError> {
        match self {
            Self::Allowed { .. } => None,
            Self::Denied(DenialReason::AlreadyCancelled) => Some(BoxOfficeError::AlreadyCancelled(
                reservation.reservation_id.to_string(),
            )),
            Self::LateCancellation { remaining } => {
                Some(BoxOfficeError::LateCancellation { remaining })
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CancellationPolicy {
    cutoff: Duration,
}

impl Default for CancellationPolicy {
    fn default() -> Self {
        Self {
            cutoff: Duration::hours(24),
        }
    }
}

impl CancellationPolicy {
    pub fn new(cutoff: Duration) -> Self {
        Self { cutoff }
    }

    /// Decides whether `reservation` may be cancelled at `now`. No side
    /// effects; the same inputs always give the same decision.
    pub fn can_cancel(
        &self,
        event: &Event,
        reservation: &Reservation,
        payment: &Payment,
        now: DateTime<Utc>,
    ) -> CancellationDecision {
        if !reservation.is_active() {
            return CancellationDecision::Denied(DenialReason::AlreadyCancelled);
        }

        let paid = payment.is_paid();

        if event.status(now) == EventStatus::Cancelled || event.is_deleted() {
            return CancellationDecision::Allowed {
                refund_eligible: paid,
                organizer_triggered: true,
            };
        }

        let window = event.starts_at - now;
        if window < self.cutoff && paid {
            return CancellationDecision::LateCancellation { remaining: window };
        }

        CancellationDecision::Allowed {
            refund_eligible: paid,
            organizer_triggered: false,
        }
    }
}
