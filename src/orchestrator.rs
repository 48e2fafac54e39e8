use crate::clock::Clock;
use crate::config::Settings;
use crate::domain::{
    phase, CancellationCause, CategoryId, CreateReservation, Event, EventId, EventLifecycle,
    LifecyclePhase,
    NewEvent, Payment, PaymentId, PaymentMethod, PaymentStatus, Reservation, ReservationId,
    ReservationStatus,
};
use crate::gateway::{GatewayStatus, PaymentGateway};
use crate::ledger::{CategoryCounts, HoldState, InventoryLedger, ReleaseOutcome};
use crate::metrics::Metrics;
use crate::policy::{CancellationDecision, CancellationPolicy};
use crate::store::{EntityStore, UnitOfWork};
use crate::{BoxOfficeError, Result};
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RefundState {
    /// Nothing was paid, so nothing is owed
    NotDue,
    Refunded,
    /// Owed but not yet returned; the payment carries `refund_pending`
    Pending,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationResult {
    pub reservation: Reservation,
    pub payment: Payment,
    pub refund: RefundState,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RestoreReport {
    pub events: usize,
    pub reservations: usize,
    pub skipped: usize,
}

enum ExpiryOutcome {
    Expired,
    /// The charge turned out to have gone through
    Settled,
    /// Could not tell whether a charge went through; try again later
    Deferred,
}

/// Ledger transition of one operation, applied to the counts stored with
/// the event in the same commit
#[derive(Debug, Clone, Copy)]
enum PendingLedger {
    Nothing,
    Hold {
        category_id: CategoryId,
        quantity: u32,
    },
    Confirm {
        category_id: CategoryId,
        quantity: u32,
    },
    Release {
        category_id: CategoryId,
        quantity: u32,
        state: HoldState,
    },
}

impl PendingLedger {
    fn project(&self, category_id: &CategoryId, mut counts: CategoryCounts) -> CategoryCounts {
        match *self {
            Self::Hold {
                category_id: target,
                quantity,
            } if target == *category_id => counts.held += quantity,
            Self::Confirm {
                category_id: target,
                quantity,
            } if target == *category_id => {
                counts.held = counts.held.saturating_sub(quantity);
                counts.confirmed += quantity;
            }
            Self::Release {
                category_id: target,
                quantity,
                state,
            } if target == *category_id => match state {
                HoldState::Held => counts.held = counts.held.saturating_sub(quantity),
                HoldState::Confirmed => {
                    counts.confirmed = counts.confirmed.saturating_sub(quantity)
                }
                HoldState::Released => {}
            },
            _ => {}
        }
        counts
    }
}

/// Exclusive access to one reservation. The lock entry is dropped from the
/// map once nobody holds or waits for it.
struct ReservationGuard<'a> {
    locks: &'a DashMap<ReservationId, Arc<Mutex<()>>>,
    reservation_id: ReservationId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        self.locks
            .remove_if(&self.reservation_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Coordinates inventory, policy, payments and storage for every
/// reservation.
///
/// Each reservation has its own async lock, so `pay`, `cancel` and expiry
/// on one reservation run one at a time while different reservations
/// proceed in parallel. The lock may be held across gateway calls; ledger
/// locks never are.
pub struct LifecycleEngine {
    store: EntityStore,
    ledger: InventoryLedger,
    gateway: Arc<dyn PaymentGateway>,
    policy: CancellationPolicy,
    hold_lifetime: Duration,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    reservation_locks: DashMap<ReservationId, Arc<Mutex<()>>>,
    event_locks: DashMap<EventId, Arc<StdMutex<()>>>,
}

impl LifecycleEngine {
    pub fn new(
        settings: &Settings,
        store: EntityStore,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            ledger: InventoryLedger::new(),
            gateway,
            policy: CancellationPolicy::new(settings.policy.cancellation_cutoff()),
            hold_lifetime: settings.policy.hold_lifetime(),
            clock,
            metrics,
            reservation_locks: DashMap::new(),
            event_locks: DashMap::new(),
        }
    }

    /// Engine with the store and gateway selected in `settings` and the
    /// system clock
    pub fn from_settings(settings: &Settings, metrics: Arc<Metrics>) -> Result<Self> {
        let store = EntityStore::open(&settings.storage)?;
        let gateway = crate::gateway::build_gateway(settings)?;
        Ok(Self::new(
            settings,
            store,
            gateway,
            Arc::new(crate::clock::SystemClock),
            metrics,
        ))
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    // --- organizer operations -------------------------------------------

    pub fn publish_event(&self, request: NewEvent) -> Result<Event> {
        let now = self.clock.now();
        if request.name.trim().is_empty() {
            return Err(BoxOfficeError::InvalidArgument(
                "event name cannot be empty".to_string(),
            ));
        }
        if request.categories.is_empty() {
            return Err(BoxOfficeError::InvalidArgument(
                "an event needs at least one ticket category".to_string(),
            ));
        }
        if request.ends_at <= request.starts_at {
            return Err(BoxOfficeError::InvalidArgument(
                "an event must end after it starts".to_string(),
            ));
        }
        if request.starts_at <= now {
            return Err(BoxOfficeError::InvalidArgument(
                "an event cannot be published in the past".to_string(),
            ));
        }
        if request.categories.iter().any(|category| category.capacity == 0) {
            return Err(BoxOfficeError::InvalidArgument(
                "category capacity must be greater than zero".to_string(),
            ));
        }

        let event = Event::new(request);
        let mut unit = UnitOfWork::new();
        unit.expect_absent::<Event>(&event.event_id);
        unit.put(&event)?;
        self.commit(unit)?;

        for category in &event.categories {
            self.ledger
                .register_category(category.category_id, category.capacity);
        }

        self.metrics.events_published.inc();
        info!(
            "Published event {} '{}' with {} categories",
            event.event_id,
            event.name,
            event.categories.len()
        );
        Ok(event)
    }

    /// Marks the event deleted. It stays readable and its reservations stay
    /// cancellable, but it takes no new reservations.
    pub fn delete_event(&self, event_id: &EventId) -> Result<Event> {
        let event = self.commit_with_event(event_id, PendingLedger::Nothing, |event, _| {
            event.lifecycle = EventLifecycle::Deleted;
            Ok(())
        })?;
        info!("Event {} deleted", event_id);
        Ok(event)
    }

    /// Cancels the event, then every active reservation on it with a refund
    /// for each paid one, whatever the time left before the start.
    ///
    /// Safe to call again: already cancelled reservations are skipped. If any
    /// reservation could not be cancelled the first failure is returned after
    /// all of them were attempted.
    pub async fn cancel_event(&self, event_id: &EventId) -> Result<Vec<CancellationResult>> {
        self.commit_with_event(event_id, PendingLedger::Nothing, |event, _| {
            if !event.cancelled {
                event.cancelled = true;
                info!("Event {} '{}' cancelled by organizer", event.event_id, event.name);
            }
            Ok(())
        })?;

        let now = self.clock.now();
        let mut results = Vec::new();
        let mut first_failure = None;

        for reservation in self.store.reservations_for_event(event_id)? {
            if !reservation.is_active() {
                continue;
            }
            match self
                .cancel_for_event(&reservation.reservation_id, now)
                .await
            {
                Ok(Some(result)) => results.push(result),
                Ok(None) => {}
                Err(e) => {
                    error!(
                        "Failed to cancel reservation {} of cancelled event {}: {}",
                        reservation.reservation_id, event_id, e
                    );
                    first_failure.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_failure {
            return Err(e);
        }

        info!(
            "Event {} cancellation processed {} reservations",
            event_id,
            results.len()
        );
        Ok(results)
    }

    async fn cancel_for_event(
        &self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Result<Option<CancellationResult>> {
        let _guard = self.lock_reservation(reservation_id).await;

        let reservation = self.store.load::<Reservation>(reservation_id)?;
        if !reservation.is_active() {
            return Ok(None);
        }
        let payment = self.store.load::<Payment>(&reservation.payment_id)?;
        self.cancel_locked(reservation, payment, CancellationCause::EventCancelled, true, now)
            .await
            .map(Some)
    }

    // --- customer operations --------------------------------------------

    /// Holds inventory and records a pending reservation with its pending
    /// payment. A full category fails with `CapacityExceeded`.
    pub fn reserve(&self, request: CreateReservation) -> Result<Reservation> {
        if request.quantity == 0 {
            return Err(BoxOfficeError::InvalidArgument(
                "quantity must be greater than zero".to_string(),
            ));
        }

        let now = self.clock.now();
        let event = self.store.load::<Event>(&request.event_id)?;
        Self::ensure_bookable(&event, now)?;

        let category = event
            .category(&request.category_id)
            .ok_or_else(|| BoxOfficeError::not_found("Category", request.category_id))?;
        let amount = category
            .unit_price
            .checked_multiply(request.quantity)
            .ok_or_else(|| {
                BoxOfficeError::InvalidArgument(format!(
                    "{} tickets at {} overflow the amount",
                    request.quantity, category.unit_price
                ))
            })?;

        let hold = match self.ledger.hold(request.category_id, request.quantity) {
            Ok(hold) => hold,
            Err(e @ BoxOfficeError::CapacityExceeded { .. }) => {
                self.metrics.reservations_sold_out.inc();
                info!("Sold out: {}", e);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        let payment_id = PaymentId::new();
        let reservation =
            Reservation::new(request, payment_id, hold.clone(), now, now + self.hold_lifetime);
        let payment = Payment::new(payment_id, reservation.reservation_id, amount);

        let pending = PendingLedger::Hold {
            category_id: reservation.category_id,
            quantity: reservation.quantity,
        };
        let committed = self.commit_with_event(&reservation.event_id, pending, |event, unit| {
            // The event may have been cancelled since it was first read
            Self::ensure_bookable(event, now)?;
            unit.expect_absent::<Reservation>(&reservation.reservation_id);
            unit.put(&reservation)?;
            unit.put(&payment)?;
            Ok(())
        });

        if let Err(e) = committed {
            warn!(
                "Reservation {} was not stored ({}), releasing its hold",
                reservation.reservation_id, e
            );
            if let Err(release_error) = self.ledger.release(&hold) {
                error!(
                    "Failed to release hold {} after a failed reservation: {}",
                    hold.hold_id, release_error
                );
            }
            return Err(e);
        }

        self.metrics.record_hold(reservation.quantity);
        info!(
            "Reservation {} created: {} x {} for event {} (payment {} of {})",
            reservation.reservation_id,
            reservation.quantity,
            reservation.category_id,
            reservation.event_id,
            payment.payment_id,
            payment.amount
        );
        Ok(reservation)
    }

    /// Charges the reservation and confirms it.
    ///
    /// A decline is recorded on the payment and reported as
    /// `PaymentDeclined`; the reservation keeps its hold so the customer can
    /// try again. When the gateway cannot be reached the reservation is left
    /// as it was and the same idempotency key is used by the next attempt.
    pub async fn pay(
        &self,
        reservation_id: &ReservationId,
        method: PaymentMethod,
    ) -> Result<Reservation> {
        let _guard = self.lock_reservation(reservation_id).await;

        let reservation = self.store.load::<Reservation>(reservation_id)?;
        let mut payment = self.store.load::<Payment>(&reservation.payment_id)?;
        let now = self.clock.now();

        if reservation.status != ReservationStatus::Pending || payment.is_paid() {
            return Err(BoxOfficeError::StateConflict(format!(
                "reservation {} is {:?} with payment {:?}",
                reservation_id, reservation.status, payment.status
            )));
        }

        if reservation.hold_expired(now) {
            return match self.expire_locked(reservation, payment, now).await? {
                ExpiryOutcome::Expired => Err(BoxOfficeError::HoldExpired(reservation_id.to_string())),
                ExpiryOutcome::Settled => Err(BoxOfficeError::StateConflict(format!(
                    "reservation {} was already paid",
                    reservation_id
                ))),
                ExpiryOutcome::Deferred => Err(BoxOfficeError::GatewayUnavailable(format!(
                    "cannot settle the earlier charge of reservation {}",
                    reservation_id
                ))),
            };
        }

        let event = self.store.load::<Event>(&reservation.event_id)?;
        if !event.accepts_reservations(now) {
            return Err(BoxOfficeError::EventNotBookable(event.event_id.to_string()));
        }

        let key = payment.idempotency_key();
        debug!(
            "Charging {} by {:?} for reservation {} (key {})",
            payment.amount, method, reservation_id, key
        );
        let charge = self
            .timed(self.gateway.charge(payment.amount, method, &key))
            .await;

        match charge {
            Err(e) => {
                warn!(
                    "Charge for reservation {} has an unknown outcome: {}",
                    reservation_id, e
                );
                self.note_unknown_outcome(&reservation, &mut payment, method);
                Err(e)
            }
            Ok(result) if result.success => {
                let transaction_ref = result.transaction_ref.unwrap_or(key);
                payment.record_success(method, transaction_ref, now);
                self.confirm_paid(reservation, payment)
            }
            Ok(result) => {
                let reason = result
                    .message
                    .unwrap_or_else(|| "declined by the processor".to_string());
                payment.record_decline(method, result.transaction_ref, reason.clone());

                let mut unit = UnitOfWork::new();
                unit.expect_version::<Reservation>(reservation_id, reservation.version);
                unit.put(&payment)?;
                self.commit(unit)?;

                self.metrics.payments_declined.inc();
                info!(
                    "Payment {} for reservation {} declined (attempt {}): {}",
                    payment.payment_id, reservation_id, payment.attempts, reason
                );
                Err(BoxOfficeError::PaymentDeclined {
                    reservation: reservation_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Cancels a reservation on behalf of its customer, refunding it when
    /// the policy says so. A refused cancellation changes nothing.
    pub async fn cancel(
        &self,
        reservation_id: &ReservationId,
        now: DateTime<Utc>,
    ) -> Result<CancellationResult> {
        let _guard = self.lock_reservation(reservation_id).await;

        let reservation = self.store.load::<Reservation>(reservation_id)?;
        let payment = self.store.load::<Payment>(&reservation.payment_id)?;
        let event = self.store.load::<Event>(&reservation.event_id)?;

        let decision = self.policy.can_cancel(&event, &reservation, &payment, now);
        let (refund_eligible, organizer_triggered) = match decision {
            CancellationDecision::Allowed {
                refund_eligible,
                organizer_triggered,
            } => (refund_eligible, organizer_triggered),
            refused => {
                if let CancellationDecision::LateCancellation { remaining } = refused {
                    self.metrics.late_cancellations.inc();
                    info!(
                        "Late cancellation of reservation {} refused, event starts in {} minutes",
                        reservation_id,
                        remaining.num_minutes()
                    );
                }
                return Err(refused.into_error(&reservation).unwrap_or_else(|| {
                    BoxOfficeError::StateConflict(format!(
                        "cancellation of {} refused",
                        reservation_id
                    ))
                }));
            }
        };

        let cause = if organizer_triggered {
            CancellationCause::EventCancelled
        } else {
            CancellationCause::Customer
        };
        self.cancel_locked(reservation, payment, cause, refund_eligible, now)
            .await
    }

    // --- maintenance ----------------------------------------------------

    /// Cancels pending reservations whose hold outlived its lifetime and
    /// returns their ids. A reservation whose charge may have gone through
    /// is checked with the gateway first.
    pub async fn expire_stale_holds(&self, now: DateTime<Utc>) -> Result<Vec<ReservationId>> {
        let mut expired = Vec::new();

        for event in self.store.all::<Event>()? {
            for candidate in self.store.reservations_for_event(&event.event_id)? {
                if !candidate.hold_expired(now) {
                    continue;
                }

                let _guard = self.lock_reservation(&candidate.reservation_id).await;

                let reservation = self.store.load::<Reservation>(&candidate.reservation_id)?;
                if !reservation.hold_expired(now) {
                    continue;
                }
                let payment = self.store.load::<Payment>(&reservation.payment_id)?;
                let reservation_id = reservation.reservation_id;

                match self.expire_locked(reservation, payment, now).await {
                    Ok(ExpiryOutcome::Expired) => expired.push(reservation_id),
                    Ok(ExpiryOutcome::Settled) | Ok(ExpiryOutcome::Deferred) => {}
                    Err(e) => warn!("Failed to expire reservation {}: {}", reservation_id, e),
                }
            }
        }

        if !expired.is_empty() {
            info!("Expired {} stale holds", expired.len());
        }
        Ok(expired)
    }

    /// Tries again to refund a cancelled reservation whose refund failed
    pub async fn retry_refund(&self, reservation_id: &ReservationId) -> Result<CancellationResult> {
        let _guard = self.lock_reservation(reservation_id).await;

        let reservation = self.store.load::<Reservation>(reservation_id)?;
        let mut payment = self.store.load::<Payment>(&reservation.payment_id)?;

        if payment.status == PaymentStatus::Refunded {
            return Ok(CancellationResult {
                reservation,
                payment,
                refund: RefundState::Refunded,
            });
        }
        if reservation.status != ReservationStatus::Cancelled || !payment.refund_pending {
            return Err(BoxOfficeError::StateConflict(format!(
                "reservation {} has no pending refund",
                reservation_id
            )));
        }

        let refund = self.refund_locked(&mut payment).await;
        Ok(CancellationResult {
            reservation,
            payment,
            refund,
        })
    }

    /// Payments still waiting for their refund
    pub fn pending_refunds(&self) -> Result<Vec<Payment>> {
        Ok(self
            .store
            .all::<Payment>()?
            .into_iter()
            .filter(|payment| payment.refund_pending)
            .collect())
    }

    /// Asks the gateway what happened to the last charge of a pending
    /// reservation and confirms it if the money was taken
    pub async fn reconcile_payment(&self, reservation_id: &ReservationId) -> Result<Reservation> {
        let _guard = self.lock_reservation(reservation_id).await;

        let reservation = self.store.load::<Reservation>(reservation_id)?;
        let payment = self.store.load::<Payment>(&reservation.payment_id)?;
        if reservation.status != ReservationStatus::Pending || payment.is_paid() {
            return Ok(reservation);
        }

        let status = self
            .timed(self.gateway.query_status(&payment.idempotency_key()))
            .await?;
        match status.status {
            GatewayStatus::Succeeded => {
                info!(
                    "Gateway reports reservation {} as paid, confirming",
                    reservation_id
                );
                self.settle(reservation, payment, status.transaction_ref)
            }
            GatewayStatus::Pending | GatewayStatus::Failed => {
                debug!(
                    "Nothing to reconcile for reservation {} ({:?})",
                    reservation_id, status.status
                );
                Ok(reservation)
            }
        }
    }

    /// Rebuilds the ledger from stored events and reservations
    pub fn restore(&self) -> Result<RestoreReport> {
        let mut report = RestoreReport::default();
        let mut categories = Vec::new();

        for event in self.store.all::<Event>()? {
            for category in &event.categories {
                self.ledger
                    .register_category(category.category_id, category.capacity);
                categories.push(category.category_id);
            }
            report.events += 1;

            for reservation in self.store.reservations_for_event(&event.event_id)? {
                let state = match reservation.status {
                    ReservationStatus::Pending => HoldState::Held,
                    ReservationStatus::Confirmed => HoldState::Confirmed,
                    ReservationStatus::Cancelled => HoldState::Released,
                };
                match self.ledger.adopt(&reservation.hold, state) {
                    Ok(()) => report.reservations += 1,
                    Err(e) => {
                        error!(
                            "Cannot restore hold of reservation {}: {}",
                            reservation.reservation_id, e
                        );
                        report.skipped += 1;
                    }
                }
            }
        }

        let (mut held, mut confirmed) = (0u64, 0u64);
        for category_id in &categories {
            let counts = self.ledger.snapshot(category_id)?;
            held += counts.held as u64;
            confirmed += counts.confirmed as u64;
        }
        self.metrics.set_seat_totals(held, confirmed);

        info!(
            "Restored {} events and {} reservations ({} skipped)",
            report.events, report.reservations, report.skipped
        );
        Ok(report)
    }

    // --- read accessors -------------------------------------------------

    /// The event with its category counts taken from the ledger
    pub fn event(&self, event_id: &EventId) -> Result<Event> {
        let mut event = self.store.load::<Event>(event_id)?;
        self.refresh_counts(&mut event);
        Ok(event)
    }

    pub fn events(&self) -> Result<Vec<Event>> {
        let mut events = self.store.all::<Event>()?;
        for event in &mut events {
            self.refresh_counts(event);
        }
        events.sort_by_key(|event| event.starts_at);
        Ok(events)
    }

    pub fn reservation(&self, reservation_id: &ReservationId) -> Result<Reservation> {
        self.store.load::<Reservation>(reservation_id)
    }

    /// The payment attached to a reservation
    pub fn payment(&self, reservation_id: &ReservationId) -> Result<Payment> {
        let reservation = self.store.load::<Reservation>(reservation_id)?;
        self.store.load::<Payment>(&reservation.payment_id)
    }

    pub fn reservations_for_event(&self, event_id: &EventId) -> Result<Vec<Reservation>> {
        self.store.reservations_for_event(event_id)
    }

    pub fn category_counts(&self, category_id: &CategoryId) -> Result<CategoryCounts> {
        self.ledger.snapshot(category_id)
    }

    pub fn phase(&self, reservation_id: &ReservationId) -> Result<LifecyclePhase> {
        let reservation = self.store.load::<Reservation>(reservation_id)?;
        let payment = self.store.load::<Payment>(&reservation.payment_id)?;
        Ok(phase(&reservation, &payment))
    }

    // --- internals ------------------------------------------------------

    fn ensure_bookable(event: &Event, now: DateTime<Utc>) -> Result<()> {
        if event.accepts_reservations(now) {
            Ok(())
        } else {
            debug!(
                "Event {} refuses reservations ({:?}, {:?})",
                event.event_id,
                event.lifecycle,
                event.status(now)
            );
            Err(BoxOfficeError::EventNotBookable(event.event_id.to_string()))
        }
    }

    async fn lock_reservation(&self, reservation_id: &ReservationId) -> ReservationGuard<'_> {
        let lock = Arc::clone(self.reservation_locks.entry(*reservation_id).or_default().value());
        ReservationGuard {
            locks: &self.reservation_locks,
            reservation_id: *reservation_id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Runs `f` under the event's lock, dropping the lock entry afterwards
    /// if no other writer is waiting on it
    fn with_event_lock<T>(&self, event_id: &EventId, f: impl FnOnce() -> T) -> T {
        let lock = Arc::clone(self.event_locks.entry(*event_id).or_default().value());
        let result = {
            let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
            f()
        };
        drop(lock);
        self.event_locks
            .remove_if(event_id, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    fn commit(&self, unit: UnitOfWork) -> Result<()> {
        self.store.run_atomically(unit).map_err(|e| {
            self.metrics.storage_errors.inc();
            e
        })
    }

    /// Loads the event, lets `change` edit it and add records to the unit of
    /// work, applies `pending` to its stored category counts and commits
    /// everything together. Writes touching one event are serialized, so the
    /// stored counts only ever reflect committed operations.
    fn commit_with_event<F>(
        &self,
        event_id: &EventId,
        pending: PendingLedger,
        change: F,
    ) -> Result<Event>
    where
        F: FnOnce(&mut Event, &mut UnitOfWork) -> Result<()>,
    {
        self.with_event_lock(event_id, || {
            let mut event = self.store.load::<Event>(event_id)?;
            let mut unit = UnitOfWork::new();
            change(&mut event, &mut unit)?;
            Self::apply_pending(&mut event, pending);
            unit.put(&event)?;
            self.commit(unit)?;
            Ok(event)
        })
    }

    fn apply_pending(event: &mut Event, pending: PendingLedger) {
        for category in &mut event.categories {
            let stored = CategoryCounts {
                capacity: category.capacity,
                held: category.held,
                confirmed: category.confirmed,
            };
            let counts = pending.project(&category.category_id, stored);
            category.held = counts.held;
            category.confirmed = counts.confirmed;
        }
    }

    /// Replaces the stored counts with the ledger's live ones
    fn refresh_counts(&self, event: &mut Event) {
        for category in &mut event.categories {
            if let Ok(counts) = self.ledger.snapshot(&category.category_id) {
                category.held = counts.held;
                category.confirmed = counts.confirmed;
            }
        }
    }

    async fn timed<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let result = call.await;
        let reached = !matches!(&result, Err(e) if e.is_retryable());
        self.metrics.record_gateway_call(started.elapsed(), reached);
        result
    }

    /// Records that a charge may have gone through, so that expiry and
    /// reconciliation ask the gateway before treating the payment as unpaid
    fn note_unknown_outcome(
        &self,
        reservation: &Reservation,
        payment: &mut Payment,
        method: PaymentMethod,
    ) {
        if !payment.record_unknown_outcome(method) {
            return;
        }
        let mut unit = UnitOfWork::new();
        unit.expect_version::<Reservation>(&reservation.reservation_id, reservation.version);
        let stored = unit.put(&*payment).and_then(|()| self.commit(unit));
        if let Err(e) = stored {
            warn!(
                "Could not record the unknown charge outcome of payment {}: {}",
                payment.payment_id, e
            );
        }
    }

    /// Commits a successful charge, then confirms the hold
    fn confirm_paid(&self, mut reservation: Reservation, payment: Payment) -> Result<Reservation> {
        let previous = reservation.version;
        reservation.confirm();
        let pending = PendingLedger::Confirm {
            category_id: reservation.category_id,
            quantity: reservation.quantity,
        };

        let committed = self.commit_with_event(&reservation.event_id, pending, |_, unit| {
            unit.expect_version::<Reservation>(&reservation.reservation_id, previous);
            unit.put(&reservation)?;
            unit.put(&payment)?;
            Ok(())
        });
        if let Err(e) = committed {
            error!(
                "Charge {:?} taken for reservation {} but the confirmation was not stored: {}",
                payment.transaction_ref, reservation.reservation_id, e
            );
            return Err(e);
        }

        if let Err(e) = self.ledger.confirm(&reservation.hold) {
            error!(
                "Reservation {} confirmed but its hold could not be: {}",
                reservation.reservation_id, e
            );
            return Err(e);
        }

        self.metrics.record_confirmation(reservation.quantity);
        info!(
            "Reservation {} confirmed, payment {} captured ({:?})",
            reservation.reservation_id, payment.payment_id, payment.transaction_ref
        );
        Ok(reservation)
    }

    fn settle(
        &self,
        reservation: Reservation,
        mut payment: Payment,
        transaction_ref: Option<String>,
    ) -> Result<Reservation> {
        let now = self.clock.now();
        let transaction_ref = transaction_ref.unwrap_or_else(|| payment.idempotency_key());
        payment.record_settled(transaction_ref, now);
        self.confirm_paid(reservation, payment)
    }

    async fn expire_locked(
        &self,
        reservation: Reservation,
        payment: Payment,
        now: DateTime<Utc>,
    ) -> Result<ExpiryOutcome> {
        if payment.needs_verification() {
            match self
                .timed(self.gateway.query_status(&payment.idempotency_key()))
                .await
            {
                Ok(status) if status.status == GatewayStatus::Succeeded => {
                    info!(
                        "Expiring reservation {} was paid after all, confirming",
                        reservation.reservation_id
                    );
                    self.settle(reservation, payment, status.transaction_ref)?;
                    return Ok(ExpiryOutcome::Settled);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Cannot verify the charge of reservation {} before expiry: {}",
                        reservation.reservation_id, e
                    );
                    return Ok(ExpiryOutcome::Deferred);
                }
            }
        }

        let reservation_id = reservation.reservation_id;
        self.cancel_locked(reservation, payment, CancellationCause::HoldExpired, false, now)
            .await?;
        self.metrics.holds_expired.inc();
        info!("Hold of reservation {} expired", reservation_id);
        Ok(ExpiryOutcome::Expired)
    }

    /// Cancellation path shared by customers, organizers and expiry. The
    /// reservation lock must be held.
    async fn cancel_locked(
        &self,
        mut reservation: Reservation,
        mut payment: Payment,
        cause: CancellationCause,
        refund_eligible: bool,
        now: DateTime<Utc>,
    ) -> Result<CancellationResult> {
        let hold_state = self.ledger.hold_state(&reservation.hold)?;
        let previous = reservation.version;
        reservation.cancel(cause, now);

        let refund_due = refund_eligible && payment.is_paid();
        if refund_due {
            payment.refund_pending = true;
        }

        let pending = PendingLedger::Release {
            category_id: reservation.category_id,
            quantity: reservation.quantity,
            state: hold_state,
        };
        self.commit_with_event(&reservation.event_id, pending, |_, unit| {
            unit.expect_version::<Reservation>(&reservation.reservation_id, previous);
            unit.put(&reservation)?;
            unit.put(&payment)?;
            Ok(())
        })?;

        match self.ledger.release(&reservation.hold) {
            Ok(ReleaseOutcome::Released) => self
                .metrics
                .record_release(reservation.quantity, hold_state == HoldState::Confirmed),
            Ok(ReleaseOutcome::AlreadyReleased) => debug!(
                "Hold of reservation {} was already released",
                reservation.reservation_id
            ),
            Err(e) => error!(
                "Reservation {} cancelled but its hold could not be released: {}",
                reservation.reservation_id, e
            ),
        }

        self.metrics.cancellations.inc();
        info!(
            "Reservation {} cancelled ({:?}), refund due: {}",
            reservation.reservation_id, cause, refund_due
        );

        let refund = if refund_due {
            self.refund_locked(&mut payment).await
        } else {
            RefundState::NotDue
        };

        Ok(CancellationResult {
            reservation,
            payment,
            refund,
        })
    }

    /// Refunds a paid payment. A failure leaves the payment succeeded with
    /// `refund_pending` set.
    async fn refund_locked(&self, payment: &mut Payment) -> RefundState {
        let transaction_ref = match payment.transaction_ref.clone() {
            Some(transaction_ref) => transaction_ref,
            None => {
                error!(
                    "Payment {} is paid but has no transaction reference to refund",
                    payment.payment_id
                );
                self.metrics.refunds_pending.inc();
                return RefundState::Pending;
            }
        };

        let outcome = self
            .timed(self.gateway.refund(&transaction_ref, payment.amount))
            .await;
        match outcome {
            Ok(result) if result.success => {
                let refund_ref = result
                    .transaction_ref
                    .unwrap_or_else(|| transaction_ref.clone());
                let mut refunded = payment.clone();
                if let Err(e) = refunded.mark_refunded(refund_ref) {
                    error!("Refund of payment {} not applicable: {}", payment.payment_id, e);
                    return RefundState::Pending;
                }
                if let Err(e) = self.store.save(&refunded) {
                    self.metrics.storage_errors.inc();
                    error!(
                        "Refund of payment {} issued but not recorded: {}",
                        payment.payment_id, e
                    );
                    return RefundState::Pending;
                }
                *payment = refunded;
                self.metrics.refunds_issued.inc();
                info!("Payment {} refunded ({})", payment.payment_id, payment.amount);
                RefundState::Refunded
            }
            Ok(result) => {
                self.metrics.refunds_pending.inc();
                warn!(
                    "Refund of payment {} declined: {:?}",
                    payment.payment_id, result.message
                );
                RefundState::Pending
            }
            Err(e) => {
                self.metrics.refunds_pending.inc();
                warn!(
                    "Refund of payment {} left pending: {}",
                    payment.payment_id, e
                );
                RefundState::Pending
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{CategoryLabel, CustomerId, EventType, Money, NewCategory};
    use crate::gateway::SimulatedGateway;
    use chrono::TimeZone;

    fn engine() -> LifecycleEngine {
        let now = Utc.with_ymd_and_hms(2031, 1, 10, 18, 0, 0).unwrap();
        LifecycleEngine::new(
            &Settings::default(),
            EntityStore::in_memory(),
            Arc::new(SimulatedGateway::new()),
            Arc::new(ManualClock::new(now)),
            Arc::new(Metrics::new().unwrap()),
        )
    }

    fn publish(engine: &LifecycleEngine) -> (EventId, CategoryId) {
        let starts_at = engine.now() + Duration::days(20);
        let event = engine
            .publish_event(NewEvent {
                name: "Nuit du Jazz".to_string(),
                event_type: EventType::Concert,
                starts_at,
                ends_at: starts_at + Duration::hours(4),
                categories: vec![NewCategory {
                    label: CategoryLabel::Standard,
                    display_order: 1,
                    unit_price: Money::from_cents(3_000),
                    capacity: 10,
                }],
            })
            .unwrap();
        (event.event_id, event.categories[0].category_id)
    }

    fn request(event_id: EventId, category_id: CategoryId, quantity: u32) -> CreateReservation {
        CreateReservation {
            event_id,
            category_id,
            quantity,
            customer_id: CustomerId::new(),
        }
    }

    fn counts() -> CategoryCounts {
        CategoryCounts {
            capacity: 10,
            held: 4,
            confirmed: 3,
        }
    }

    #[test]
    fn test_projection_only_touches_target_category() {
        let target = CategoryId::new();
        let other = CategoryId::new();
        let pending = PendingLedger::Confirm {
            category_id: target,
            quantity: 2,
        };

        let projected = pending.project(&target, counts());
        assert_eq!(projected.held, 2);
        assert_eq!(projected.confirmed, 5);
        assert_eq!(pending.project(&other, counts()), counts());
    }

    #[test]
    fn test_release_projection_follows_hold_state() {
        let target = CategoryId::new();
        let release = |state| PendingLedger::Release {
            category_id: target,
            quantity: 3,
            state,
        };

        assert_eq!(release(HoldState::Held).project(&target, counts()).held, 1);
        assert_eq!(
            release(HoldState::Confirmed)
                .project(&target, counts())
                .confirmed,
            0
        );
        assert_eq!(release(HoldState::Released).project(&target, counts()), counts());
    }

    #[tokio::test]
    async fn test_locks_are_dropped_once_idle() {
        let engine = engine();
        let (event_id, category_id) = publish(&engine);
        let first = engine.reserve(request(event_id, category_id, 2)).unwrap();
        let second = engine.reserve(request(event_id, category_id, 1)).unwrap();

        engine
            .pay(&first.reservation_id, PaymentMethod::Card)
            .await
            .unwrap();
        let (paid, cancelled) = tokio::join!(
            engine.pay(&second.reservation_id, PaymentMethod::Card),
            engine.cancel(&second.reservation_id, engine.now()),
        );
        assert!(paid.is_ok() || cancelled.is_ok());
        engine.cancel(&first.reservation_id, engine.now()).await.unwrap();

        assert!(engine.reservation_locks.is_empty());
        assert!(engine.event_locks.is_empty());
    }

    #[tokio::test]
    async fn test_stored_counts_skip_uncommitted_holds() {
        let engine = engine();
        let (event_id, category_id) = publish(&engine);

        // A hold placed by a reservation whose commit has not happened yet
        let in_flight = engine.ledger.hold(category_id, 3).unwrap();
        let reservation = engine.reserve(request(event_id, category_id, 2)).unwrap();

        let stored = engine.store.load::<Event>(&event_id).unwrap();
        assert_eq!(stored.categories[0].held, 2);
        assert_eq!(engine.event(&event_id).unwrap().categories[0].held, 5);

        // Its commit fails, so the hold goes back and the stored counts stay right
        engine.ledger.release(&in_flight).unwrap();
        engine
            .pay(&reservation.reservation_id, PaymentMethod::Card)
            .await
            .unwrap();
        let stored = engine.store.load::<Event>(&event_id).unwrap();
        assert_eq!((stored.categories[0].held, stored.categories[0].confirmed), (0, 2));
    }
}
