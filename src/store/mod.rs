pub mod memory;
pub mod rocksdb_store;

pub use memory::MemoryStore;
pub use rocksdb_store::RocksDBStore;

use crate::config::{StorageBackend, StorageSettings};
use crate::domain::{
    event_reservation_key, event_reservation_prefix, store_key, Event, EventId, Payment,
    PaymentId, Reservation, ReservationId, Stores,
};
use crate::{BoxOfficeError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Display;
use std::sync::Arc;
use tracing::{debug, info};

/// Single write inside a batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put { key: String, value: Vec<u8> },
}

/// Condition on the current content of a key, checked before any write of
/// the batch is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Absent { key: String },
    Version { key: String, expected: u64 },
}

impl Precondition {
    pub fn key(&self) -> &str {
        match self {
            Self::Absent { key } | Self::Version { key, .. } => key,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub preconditions: Vec<Precondition>,
    pub writes: Vec<WriteOp>,
}

/// Byte-level key/value storage.
///
/// `commit` applies every write of the batch or none of them, and only if
/// every precondition holds.
pub trait StoreBackend: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>>;

    fn commit(&self, batch: WriteBatch) -> Result<()>;

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str;
}

/// Reads the optimistic version stored in a JSON record
pub(crate) fn record_version(bytes: &[u8]) -> Result<Option<u64>> {
    let value: serde_json::Value = serde_json::from_slice(bytes)?;
    Ok(value.get("version").and_then(|version| version.as_u64()))
}

/// Shared precondition check for backends
pub(crate) fn check_precondition(
    precondition: &Precondition,
    current: Option<&[u8]>,
) -> Result<()> {
    match (precondition, current) {
        (Precondition::Absent { .. }, None) => Ok(()),
        (Precondition::Absent { key }, Some(_)) => Err(BoxOfficeError::StateConflict(format!(
            "{} already exists",
            key
        ))),
        (Precondition::Version { key, .. }, None) => Err(BoxOfficeError::StateConflict(
            format!("{} disappeared", key),
        )),
        (Precondition::Version { key, expected }, Some(bytes)) => {
            let found = record_version(bytes)?;
            if found == Some(*expected) {
                Ok(())
            } else {
                Err(BoxOfficeError::StateConflict(format!(
                    "{} is at version {:?}, expected {}",
                    key, found, expected
                )))
            }
        }
    }
}

/// A stored record type
pub trait Entity: Serialize + DeserializeOwned {
    const STORE: &'static str;
    const NAME: &'static str;
    type Id: Display;

    fn id(&self) -> &Self::Id;

    /// Secondary index entries written alongside the record
    fn index_keys(&self) -> Vec<String> {
        Vec::new()
    }

    fn key_for(id: &Self::Id) -> String {
        store_key(Self::STORE, &id.to_string())
    }
}

impl Entity for Event {
    const STORE: &'static str = Stores::EVENT;
    const NAME: &'static str = "Event";
    type Id = EventId;

    fn id(&self) -> &EventId {
        &self.event_id
    }
}

impl Entity for Reservation {
    const STORE: &'static str = Stores::RESERVATION;
    const NAME: &'static str = "Reservation";
    type Id = ReservationId;

    fn id(&self) -> &ReservationId {
        &self.reservation_id
    }

    fn index_keys(&self) -> Vec<String> {
        vec![event_reservation_key(
            &self.event_id.to_string(),
            &self.reservation_id.to_string(),
        )]
    }
}

impl Entity for Payment {
    const STORE: &'static str = Stores::PAYMENT;
    const NAME: &'static str = "Payment";
    type Id = PaymentId;

    fn id(&self) -> &PaymentId {
        &self.payment_id
    }
}

/// Records written together or not at all
#[derive(Debug, Default)]
pub struct UnitOfWork {
    batch: WriteBatch,
}

impl UnitOfWork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put<T: Entity>(&mut self, entity: &T) -> Result<()> {
        let value = serde_json::to_vec(entity)?;
        self.batch.writes.push(WriteOp::Put {
            key: T::key_for(entity.id()),
            value,
        });
        for key in entity.index_keys() {
            self.batch.writes.push(WriteOp::Put {
                key,
                value: entity.id().to_string().into_bytes(),
            });
        }
        Ok(())
    }

    /// The commit fails with `StateConflict` unless the stored record is
    /// still at `version`
    pub fn expect_version<T: Entity>(&mut self, id: &T::Id, version: u64) {
        self.batch.preconditions.push(Precondition::Version {
            key: T::key_for(id),
            expected: version,
        });
    }

    pub fn expect_absent<T: Entity>(&mut self, id: &T::Id) {
        self.batch
            .preconditions
            .push(Precondition::Absent { key: T::key_for(id) });
    }

    pub fn is_empty(&self) -> bool {
        self.batch.writes.is_empty()
    }

    pub fn into_batch(self) -> WriteBatch {
        self.batch
    }
}

/// Typed access to the records of the engine
#[derive(Clone)]
pub struct EntityStore {
    backend: Arc<dyn StoreBackend>,
}

impl EntityStore {
    pub fn new(backend: Arc<dyn StoreBackend>) -> Self {
        Self { backend }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Opens the backend selected in `settings`
    pub fn open(settings: &StorageSettings) -> Result<Self> {
        let backend: Arc<dyn StoreBackend> = match settings.backend {
            StorageBackend::Memory => Arc::new(MemoryStore::new()),
            StorageBackend::RocksDb => Arc::new(RocksDBStore::new(&settings.state_dir)?),
        };
        info!("Opened {} store", backend.name());
        Ok(Self::new(backend))
    }

    pub fn backend(&self) -> &Arc<dyn StoreBackend> {
        &self.backend
    }

    pub fn find<T: Entity>(&self, id: &T::Id) -> Result<Option<T>> {
        match self.backend.get(&T::key_for(id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn load<T: Entity>(&self, id: &T::Id) -> Result<T> {
        self.find(id)?
            .ok_or_else(|| BoxOfficeError::not_found(T::NAME, id))
    }

    pub fn save<T: Entity>(&self, entity: &T) -> Result<()> {
        let mut unit = UnitOfWork::new();
        unit.put(entity)?;
        self.run_atomically(unit)
    }

    pub fn run_atomically(&self, unit: UnitOfWork) -> Result<()> {
        if unit.is_empty() {
            return Ok(());
        }
        let batch = unit.into_batch();
        debug!(
            "Committing {} writes with {} preconditions",
            batch.writes.len(),
            batch.preconditions.len()
        );
        self.backend.commit(batch)
    }

    pub fn all<T: Entity>(&self) -> Result<Vec<T>> {
        self.backend
            .scan_prefix(&format!("{}/", T::STORE))?
            .into_iter()
            .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(BoxOfficeError::from))
            .collect()
    }

    pub fn reservations_for_event(&self, event_id: &EventId) -> Result<Vec<Reservation>> {
        let prefix = event_reservation_prefix(&event_id.to_string());
        let mut reservations = Vec::new();
        for (_, value) in self.backend.scan_prefix(&prefix)? {
            let id: ReservationId = String::from_utf8_lossy(&value).parse().map_err(|_| {
                BoxOfficeError::StorageUnavailable(format!(
                    "corrupt reservation index entry under {}",
                    prefix
                ))
            })?;
            if let Some(reservation) = self.find::<Reservation>(&id)? {
                reservations.push(reservation);
            }
        }
        reservations.sort_by_key(|reservation| reservation.created_at);
        Ok(reservations)
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CategoryLabel, EventType, Money, NewCategory, NewEvent};
    use chrono::{Duration, Utc};

    fn event() -> Event {
        let starts_at = Utc::now() + Duration::days(7);
        Event::new(NewEvent {
            name: "Nuit du jazz".to_string(),
            event_type: EventType::Concert,
            starts_at,
            ends_at: starts_at + Duration::hours(3),
            categories: vec![NewCategory {
                label: CategoryLabel::Vip,
                display_order: 1,
                unit_price: Money::from_cents(12_000),
                capacity: 40,
            }],
        })
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let store = EntityStore::in_memory();
        let err = store.load::<Event>(&EventId::new()).unwrap_err();
        assert!(matches!(err, BoxOfficeError::NotFound { entity: "Event", .. }));
    }

    #[test]
    fn test_save_and_list() {
        let store = EntityStore::in_memory();
        let first = event();
        let second = event();
        store.save(&first).unwrap();
        store.save(&second).unwrap();

        assert_eq!(store.load::<Event>(&first.event_id).unwrap(), first);
        assert_eq!(store.all::<Event>().unwrap().len(), 2);
    }

    #[test]
    fn test_expect_absent_rejects_duplicates() {
        let store = EntityStore::in_memory();
        let event = event();
        store.save(&event).unwrap();

        let mut unit = UnitOfWork::new();
        unit.expect_absent::<Event>(&event.event_id);
        unit.put(&event).unwrap();
        let err = store.run_atomically(unit).unwrap_err();
        assert!(matches!(err, BoxOfficeError::StateConflict(_)));
    }

    #[test]
    fn test_version_precondition() {
        let current = br#"{"version":3}"#;
        let ok = Precondition::Version {
            key: "Reservation/x".to_string(),
            expected: 3,
        };
        let stale = Precondition::Version {
            key: "Reservation/x".to_string(),
            expected: 2,
        };
        assert!(check_precondition(&ok, Some(current)).is_ok());
        assert!(check_precondition(&stale, Some(current)).is_err());
        assert!(check_precondition(&ok, None).is_err());
    }
}
