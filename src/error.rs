use chrono::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BoxOfficeError {
    #[error("Capacity exceeded for category {category}: requested {requested}, available {available}")]
    CapacityExceeded {
        category: String,
        requested: u32,
        available: u32,
    },

    #[error("Invalid hold token: {0}")]
    InvalidToken(String),

    #[error("Late cancellation refused: event starts in {} minutes", .remaining.num_minutes())]
    LateCancellation { remaining: Duration },

    #[error("Payment declined for reservation {reservation}: {reason}")]
    PaymentDeclined { reservation: String, reason: String },

    #[error("Payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Event {0} does not accept reservations")]
    EventNotBookable(String),

    #[error("Reservation {0} is already cancelled")]
    AlreadyCancelled(String),

    #[error("Hold for reservation {0} has expired")]
    HoldExpired(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("RocksDB error: {0}")]
    RocksDB(#[from] rocksdb::Error),

    #[error("Metrics error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

/// Discriminant of [`BoxOfficeError`], stable across payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    CapacityExceeded,
    InvalidToken,
    LateCancellation,
    PaymentDeclined,
    GatewayUnavailable,
    StorageUnavailable,
    StateConflict,
    NotFound,
    EventNotBookable,
    AlreadyCancelled,
    HoldExpired,
    InvalidArgument,
    Internal,
}

impl BoxOfficeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::InvalidToken(_) => ErrorKind::InvalidToken,
            Self::LateCancellation { .. } => ErrorKind::LateCancellation,
            Self::PaymentDeclined { .. } => ErrorKind::PaymentDeclined,
            Self::GatewayUnavailable(_) => ErrorKind::GatewayUnavailable,
            Self::StorageUnavailable(_) | Self::RocksDB(_) | Self::Io(_) => {
                ErrorKind::StorageUnavailable
            }
            Self::StateConflict(_) => ErrorKind::StateConflict,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::EventNotBookable(_) => ErrorKind::EventNotBookable,
            Self::AlreadyCancelled(_) => ErrorKind::AlreadyCancelled,
            Self::HoldExpired(_) => ErrorKind::HoldExpired,
            Self::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Self::Config(_) | Self::Json(_) | Self::Prometheus(_) => ErrorKind::Internal,
        }
    }

    /// Failures a customer can act on. Everything else is reported as a
    /// generic failure and logged as a defect.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::CapacityExceeded
                | ErrorKind::LateCancellation
                | ErrorKind::PaymentDeclined
                | ErrorKind::GatewayUnavailable
                | ErrorKind::StateConflict
                | ErrorKind::NotFound
                | ErrorKind::EventNotBookable
                | ErrorKind::AlreadyCancelled
                | ErrorKind::HoldExpired
                | ErrorKind::InvalidArgument
        )
    }

    /// Whether repeating the same call may succeed without the caller
    /// re-deciding anything.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::GatewayUnavailable)
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BoxOfficeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let late = BoxOfficeError::LateCancellation {
            remaining: Duration::hours(2),
        };
        assert_eq!(late.kind(), ErrorKind::LateCancellation);
        assert!(late.is_user_visible());
        assert!(!late.is_retryable());
        assert!(late.to_string().contains("120 minutes"));

        let token = BoxOfficeError::InvalidToken("released".to_string());
        assert!(!token.is_user_visible());

        let gateway = BoxOfficeError::GatewayUnavailable("timeout".to_string());
        assert!(gateway.is_retryable());

        let io = BoxOfficeError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(io.kind(), ErrorKind::StorageUnavailable);
    }
}
