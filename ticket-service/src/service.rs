use box_office::{
    BoxOfficeError, CancellationResult, CategoryLabel, CreateReservation, CustomerId, Event,
    EventId, EventStatus, EventType, LifecycleEngine, LifecyclePhase, Money, NewCategory,
    NewEvent, Payment, PaymentMethod, Reservation, ReservationId, Result,
};
use crate::{CreateEventRequest, CreateReservationRequest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct EventView {
    #[serde(flatten)]
    pub event: Event,
    pub status: EventStatus,
}

#[derive(Debug, Serialize)]
pub struct ReservationView {
    pub reservation: Reservation,
    pub payment: Payment,
    pub phase: LifecyclePhase,
}

#[derive(Clone)]
pub struct BoxOfficeService {
    engine: Arc<LifecycleEngine>,
}

impl BoxOfficeService {
    pub fn new(engine: Arc<LifecycleEngine>) -> Self {
        Self { engine }
    }

    pub fn create_event(&self, request: CreateEventRequest) -> Result<EventView> {
        info!("Creating event: {}", request.name);

        let event_type = parse_event_type(&request.event_type)?;
        let starts_at = parse_timestamp(&request.starts_at)?;
        let ends_at = parse_timestamp(&request.ends_at)?;

        let categories = request
            .categories
            .into_iter()
            .enumerate()
            .map(|(position, category)| {
                Ok(NewCategory {
                    label: parse_label(&category.label)?,
                    display_order: category.display_order.unwrap_or(position as u32 + 1),
                    unit_price: Money::from_cents(category.price_cents),
                    capacity: category.capacity,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let event = self.engine.publish_event(NewEvent {
            name: request.name,
            event_type,
            starts_at,
            ends_at,
            categories,
        })?;
        Ok(self.view(event))
    }

    pub fn get_event(&self, event_id: &EventId) -> Result<EventView> {
        let event = self.engine.event(event_id)?;
        Ok(self.view(event))
    }

    pub fn list_events(&self) -> Result<Vec<EventView>> {
        Ok(self
            .engine
            .events()?
            .into_iter()
            .map(|event| self.view(event))
            .collect())
    }

    pub fn delete_event(&self, event_id: &EventId) -> Result<EventView> {
        let event = self.engine.delete_event(event_id)?;
        Ok(self.view(event))
    }

    pub async fn cancel_event(&self, event_id: &EventId) -> Result<Vec<CancellationResult>> {
        self.engine.cancel_event(event_id).await
    }

    pub fn create_reservation(&self, request: CreateReservationRequest) -> Result<ReservationView> {
        let reservation = self.engine.reserve(CreateReservation {
            event_id: parse_id(&request.event_id)?,
            category_id: parse_id(&request.category_id)?,
            quantity: request.quantity,
            customer_id: parse_id::<CustomerId>(&request.customer_id)?,
        })?;
        self.reservation_view(reservation)
    }

    pub fn get_reservation(&self, reservation_id: &ReservationId) -> Result<ReservationView> {
        let reservation = self.engine.reservation(reservation_id)?;
        self.reservation_view(reservation)
    }

    pub fn event_reservations(&self, event_id: &EventId) -> Result<Vec<ReservationView>> {
        self.engine
            .reservations_for_event(event_id)?
            .into_iter()
            .map(|reservation| self.reservation_view(reservation))
            .collect()
    }

    pub async fn pay(&self, reservation_id: &ReservationId, method: &str) -> Result<ReservationView> {
        let method = parse_method(method)?;
        let reservation = self.engine.pay(reservation_id, method).await?;
        self.reservation_view(reservation)
    }

    pub async fn cancel(&self, reservation_id: &ReservationId) -> Result<CancellationResult> {
        self.engine.cancel(reservation_id, self.engine.now()).await
    }

    pub async fn retry_refund(&self, reservation_id: &ReservationId) -> Result<CancellationResult> {
        self.engine.retry_refund(reservation_id).await
    }

    pub async fn reconcile(&self, reservation_id: &ReservationId) -> Result<ReservationView> {
        let reservation = self.engine.reconcile_payment(reservation_id).await?;
        self.reservation_view(reservation)
    }

    pub fn metrics(&self) -> Result<String> {
        self.engine.metrics().export()
    }

    fn view(&self, event: Event) -> EventView {
        let status = event.status(self.engine.now());
        EventView { event, status }
    }

    fn reservation_view(&self, reservation: Reservation) -> Result<ReservationView> {
        let payment = self.engine.payment(&reservation.reservation_id)?;
        let phase = box_office::phase(&reservation, &payment);
        Ok(ReservationView {
            reservation,
            payment,
            phase,
        })
    }
}

pub fn parse_id<T: std::str::FromStr>(value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| BoxOfficeError::InvalidArgument(format!("Invalid identifier: {}", value)))
}

fn parse_timestamp(timestamp: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(timestamp)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BoxOfficeError::InvalidArgument(format!("Invalid timestamp format: {}", e)))
}

fn parse_event_type(value: &str) -> Result<EventType> {
    match value.to_lowercase().as_str() {
        "concert" => Ok(EventType::Concert),
        "show" | "spectacle" => Ok(EventType::Show),
        "conference" => Ok(EventType::Conference),
        _ => Err(BoxOfficeError::InvalidArgument(format!(
            "Invalid event type: {}",
            value
        ))),
    }
}

fn parse_label(value: &str) -> Result<CategoryLabel> {
    match value.to_lowercase().as_str() {
        "standard" => Ok(CategoryLabel::Standard),
        "vip" => Ok(CategoryLabel::Vip),
        "premium" => Ok(CategoryLabel::Premium),
        _ => Err(BoxOfficeError::InvalidArgument(format!(
            "Invalid category label: {}",
            value
        ))),
    }
}

fn parse_method(value: &str) -> Result<PaymentMethod> {
    match value.to_lowercase().as_str() {
        "card" => Ok(PaymentMethod::Card),
        "paypal" => Ok(PaymentMethod::PayPal),
        "stripe" => Ok(PaymentMethod::Stripe),
        "transfer" => Ok(PaymentMethod::Transfer),
        "cash" => Ok(PaymentMethod::Cash),
        _ => Err(BoxOfficeError::InvalidArgument(format!(
            "Invalid payment method: {}",
            value
        ))),
    }
}
