use std::fmt;
use uuid::Uuid;

// State store definitions
pub struct Stores;

impl Stores {
    pub const EVENT: &'static str = "Event";
    pub const RESERVATION: &'static str = "Reservation";
    pub const PAYMENT: &'static str = "Payment";
    pub const EVENT_RESERVATIONS: &'static str = "EventReservations";
}

// Utility functions for key generation
pub fn store_key(store: &str, id: &str) -> String {
    format!("{}/{}", store, id)
}

pub fn event_reservation_key(event_id: &str, reservation_id: &str) -> String {
    format!("{}/{}#{}", Stores::EVENT_RESERVATIONS, event_id, reservation_id)
}

pub fn event_reservation_prefix(event_id: &str) -> String {
    format!("{}/{}#", Stores::EVENT_RESERVATIONS, event_id)
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            pub const fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

uuid_id!(
    /// Identifier of a published event
    EventId
);
uuid_id!(
    /// Identifier of a ticket category within an event
    CategoryId
);
uuid_id!(
    /// Identifier of a customer reservation
    ReservationId
);
uuid_id!(
    /// Identifier of the payment linked to a reservation
    PaymentId
);
uuid_id!(
    /// Identifier of the customer owning a reservation
    CustomerId
);
uuid_id!(
    /// Identifier of an inventory hold
    HoldId
);

/// Money in integer cents
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Money(u64);

impl Money {
    pub const fn from_cents(cents: u64) -> Self {
        Self(cents)
    }

    pub const fn cents(&self) -> u64 {
        self.0
    }

    pub const fn checked_multiply(self, quantity: u32) -> Option<Self> {
        match self.0.checked_mul(quantity as u64) {
            Some(result) => Some(Self(result)),
            None => None,
        }
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}
