use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::schemas::{CategoryId, EventId, Money};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    Concert,
    Show,
    Conference,
}

/// Whether the event record is live. A deleted event stays readable but
/// accepts no new reservations.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventLifecycle {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "DELETED")]
    Deleted,
}

/// Display status, derived from time and the cancel flag
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventStatus {
    #[serde(rename = "A_VENIR")]
    Upcoming,
    #[serde(rename = "EN_COURS")]
    Ongoing,
    #[serde(rename = "TERMINE")]
    Finished,
    #[serde(rename = "ANNULE")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CategoryLabel {
    Standard,
    Vip,
    Premium,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TicketCategory {
    pub category_id: CategoryId,
    pub label: CategoryLabel,
    pub display_order: u32,
    pub unit_price: Money,
    pub capacity: u32,
    pub held: u32,
    pub confirmed: u32,
}

impl TicketCategory {
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.held + self.confirmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCategory {
    pub label: CategoryLabel,
    pub display_order: u32,
    pub unit_price: Money,
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewEvent {
    pub name: String,
    pub event_type: EventType,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub categories: Vec<NewCategory>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub event_id: EventId,
    pub name: String,
    pub event_type: EventType,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub lifecycle: EventLifecycle,
    pub cancelled: bool,
    pub categories: Vec<TicketCategory>,
}

impl Event {
    pub fn new(request: NewEvent) -> Self {
        let mut categories: Vec<TicketCategory> = request
            .categories
            .into_iter()
            .map(|category| TicketCategory {
                category_id: CategoryId::new(),
                label: category.label,
                display_order: category.display_order,
                unit_price: category.unit_price,
                capacity: category.capacity,
                held: 0,
                confirmed: 0,
            })
            .collect();
        categories.sort_by_key(|category| category.display_order);

        Self {
            event_id: EventId::new(),
            name: request.name,
            event_type: request.event_type,
            starts_at: request.starts_at,
            ends_at: request.ends_at,
            lifecycle: EventLifecycle::Active,
            cancelled: false,
            categories,
        }
    }

    pub fn status(&self, now: DateTime<Utc>) -> EventStatus {
        if self.cancelled {
            EventStatus::Cancelled
        } else if now < self.starts_at {
            EventStatus::Upcoming
        } else if now < self.ends_at {
            EventStatus::Ongoing
        } else {
            EventStatus::Finished
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.lifecycle == EventLifecycle::Deleted
    }

    /// Active, not cancelled and not yet started
    pub fn accepts_reservations(&self, now: DateTime<Utc>) -> bool {
        self.lifecycle == EventLifecycle::Active && self.status(now) == EventStatus::Upcoming
    }

    pub fn category(&self, category_id: &CategoryId) -> Option<&TicketCategory> {
        self.categories
            .iter()
            .find(|category| category.category_id == *category_id)
    }
}
