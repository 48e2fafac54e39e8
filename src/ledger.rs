use crate::domain::{CategoryId, HoldId};
use crate::{BoxOfficeError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, warn};

/// Provisional claim on `quantity` units of one category
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HoldToken {
    pub hold_id: HoldId,
    pub category_id: CategoryId,
    pub quantity: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HoldState {
    Held,
    Confirmed,
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyReleased,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CategoryCounts {
    pub capacity: u32,
    pub held: u32,
    pub confirmed: u32,
}

impl CategoryCounts {
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.held + self.confirmed)
    }
}

#[derive(Debug, Default)]
struct CategoryBook {
    counts: CategoryCounts,
    tokens: HashMap<HoldId, (u32, HoldState)>,
}

impl CategoryBook {
    fn token_state(&self, token: &HoldToken) -> Result<HoldState> {
        match self.tokens.get(&token.hold_id) {
            Some((quantity, state)) if *quantity == token.quantity => Ok(*state),
            Some((quantity, _)) => Err(BoxOfficeError::InvalidToken(format!(
                "hold {} registered for {} units, token claims {}",
                token.hold_id, quantity, token.quantity
            ))),
            None => Err(BoxOfficeError::InvalidToken(format!(
                "hold {} is unknown to category {}",
                token.hold_id, token.category_id
            ))),
        }
    }

    fn set_state(&mut self, token: &HoldToken, state: HoldState) {
        self.tokens.insert(token.hold_id, (token.quantity, state));
    }
}

/// Per-category capacity accounting.
///
/// Every category has its own lock; hold, confirm and release on one
/// category are serialized while different categories never contend.
/// Locks are only taken inside these synchronous methods, so they can never
/// be held across a gateway call.
#[derive(Debug, Default)]
pub struct InventoryLedger {
    categories: DashMap<CategoryId, Arc<Mutex<CategoryBook>>>,
}

impl InventoryLedger {
    pub fn new() -> Self {
        Self {
            categories: DashMap::new(),
        }
    }

    /// Registers a category with an empty book. Registering a known
    /// category again is a no-op.
    pub fn register_category(&self, category_id: CategoryId, capacity: u32) {
        self.categories.entry(category_id).or_insert_with(|| {
            debug!("Registering category {} with capacity {}", category_id, capacity);
            Arc::new(Mutex::new(CategoryBook {
                counts: CategoryCounts {
                    capacity,
                    held: 0,
                    confirmed: 0,
                },
                tokens: HashMap::new(),
            }))
        });
    }

    fn book(&self, category_id: &CategoryId) -> Result<Arc<Mutex<CategoryBook>>> {
        self.categories
            .get(category_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| BoxOfficeError::not_found("Category", category_id))
    }

    fn lock(book: &Mutex<CategoryBook>) -> MutexGuard<'_, CategoryBook> {
        // The book is only mutated after all checks pass, so a panic while
        // holding the lock cannot leave it half-updated.
        book.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomically claims `quantity` units if `held + confirmed + quantity <= capacity`.
    pub fn hold(&self, category_id: CategoryId, quantity: u32) -> Result<HoldToken> {
        if quantity == 0 {
            return Err(BoxOfficeError::InvalidArgument(
                "quantity must be greater than zero".to_string(),
            ));
        }

        let book = self.book(&category_id)?;
        let mut book = Self::lock(&book);

        let available = book.counts.available();
        if quantity > available {
            debug!(
                "Hold refused on category {}: requested {}, available {}",
                category_id, quantity, available
            );
            return Err(BoxOfficeError::CapacityExceeded {
                category: category_id.to_string(),
                requested: quantity,
                available,
            });
        }

        let token = HoldToken {
            hold_id: HoldId::new(),
            category_id,
            quantity,
        };
        book.counts.held += quantity;
        book.set_state(&token, HoldState::Held);

        debug!(
            "Hold {} placed on category {} for {} units (held={}, confirmed={})",
            token.hold_id, category_id, quantity, book.counts.held, book.counts.confirmed
        );
        Ok(token)
    }

    /// Moves a hold from held to confirmed. Confirming twice is a no-op;
    /// confirming a released hold is a ledger defect.
    pub fn confirm(&self, token: &HoldToken) -> Result<()> {
        let book = self.book(&token.category_id)?;
        let mut book = Self::lock(&book);

        match book.token_state(token)? {
            HoldState::Held => {
                book.counts.held -= token.quantity;
                book.counts.confirmed += token.quantity;
                book.set_state(token, HoldState::Confirmed);
                debug!("Hold {} confirmed", token.hold_id);
                Ok(())
            }
            HoldState::Confirmed => Ok(()),
            HoldState::Released => {
                error!("Attempt to confirm released hold {}", token.hold_id);
                Err(BoxOfficeError::InvalidToken(format!(
                    "hold {} was already released",
                    token.hold_id
                )))
            }
        }
    }

    /// Returns a hold's units to the pool, whether held or confirmed.
    pub fn release(&self, token: &HoldToken) -> Result<ReleaseOutcome> {
        let book = self.book(&token.category_id)?;
        let mut book = Self::lock(&book);

        match book.token_state(token)? {
            HoldState::Held => {
                book.counts.held -= token.quantity;
            }
            HoldState::Confirmed => {
                book.counts.confirmed -= token.quantity;
            }
            HoldState::Released => {
                debug!("Hold {} already released", token.hold_id);
                return Ok(ReleaseOutcome::AlreadyReleased);
            }
        }
        book.set_state(token, HoldState::Released);

        debug!(
            "Hold {} released on category {} (held={}, confirmed={})",
            token.hold_id, token.category_id, book.counts.held, book.counts.confirmed
        );
        Ok(ReleaseOutcome::Released)
    }

    /// Re-registers a hold read back from storage
    pub fn adopt(&self, token: &HoldToken, state: HoldState) -> Result<()> {
        let book = self.book(&token.category_id)?;
        let mut book = Self::lock(&book);

        if book.tokens.contains_key(&token.hold_id) {
            return Ok(());
        }

        match state {
            HoldState::Held | HoldState::Confirmed => {
                if token.quantity > book.counts.available() {
                    warn!(
                        "Stored hold {} would overbook category {}",
                        token.hold_id, token.category_id
                    );
                    return Err(BoxOfficeError::InvalidToken(format!(
                        "stored hold {} exceeds capacity of category {}",
                        token.hold_id, token.category_id
                    )));
                }
                if state == HoldState::Held {
                    book.counts.held += token.quantity;
                } else {
                    book.counts.confirmed += token.quantity;
                }
            }
            HoldState::Released => {}
        }
        book.set_state(token, state);
        Ok(())
    }

    pub fn hold_state(&self, token: &HoldToken) -> Result<HoldState> {
        let book = self.book(&token.category_id)?;
        let book = Self::lock(&book);
        book.token_state(token)
    }

    pub fn snapshot(&self, category_id: &CategoryId) -> Result<CategoryCounts> {
        let book = self.book(category_id)?;
        let book = Self::lock(&book);
        Ok(book.counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    fn ledger_with(capacity: u32) -> (InventoryLedger, CategoryId) {
        let ledger = InventoryLedger::new();
        let category_id = CategoryId::new();
        ledger.register_category(category_id, capacity);
        (ledger, category_id)
    }

    #[test]
    fn test_hold_within_capacity() {
        let (ledger, category) = ledger_with(10);

        let token = ledger.hold(category, 10).unwrap();
        assert_eq!(token.quantity, 10);

        let counts = ledger.snapshot(&category).unwrap();
        assert_eq!(counts.held, 10);
        assert_eq!(counts.available(), 0);
    }

    #[test]
    fn test_hold_over_capacity_has_no_side_effect() {
        let (ledger, category) = ledger_with(10);
        ledger.hold(category, 10).unwrap();

        let err = ledger.hold(category, 1).unwrap_err();
        assert!(matches!(
            err,
            BoxOfficeError::CapacityExceeded { requested: 1, available: 0, .. }
        ));
        assert_eq!(ledger.snapshot(&category).unwrap().held, 10);
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let (ledger, category) = ledger_with(10);
        assert!(matches!(
            ledger.hold(category, 0),
            Err(BoxOfficeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_unknown_category() {
        let ledger = InventoryLedger::new();
        assert!(matches!(
            ledger.hold(CategoryId::new(), 1),
            Err(BoxOfficeError::NotFound { .. })
        ));
    }

    #[test]
    fn test_confirm_is_idempotent() {
        let (ledger, category) = ledger_with(5);
        let token = ledger.hold(category, 3).unwrap();

        ledger.confirm(&token).unwrap();
        ledger.confirm(&token).unwrap();

        let counts = ledger.snapshot(&category).unwrap();
        assert_eq!(counts.held, 0);
        assert_eq!(counts.confirmed, 3);
    }

    #[test]
    fn test_confirm_after_release_is_invalid() {
        let (ledger, category) = ledger_with(5);
        let token = ledger.hold(category, 2).unwrap();
        ledger.release(&token).unwrap();

        assert!(matches!(
            ledger.confirm(&token),
            Err(BoxOfficeError::InvalidToken(_))
        ));
        assert_eq!(ledger.snapshot(&category).unwrap(), CategoryCounts {
            capacity: 5,
            held: 0,
            confirmed: 0,
        });
    }

    #[test]
    fn test_release_is_idempotent() {
        let (ledger, category) = ledger_with(5);
        let token = ledger.hold(category, 2).unwrap();

        assert_eq!(ledger.release(&token).unwrap(), ReleaseOutcome::Released);
        let once = ledger.snapshot(&category).unwrap();

        assert_eq!(ledger.release(&token).unwrap(), ReleaseOutcome::AlreadyReleased);
        assert_eq!(ledger.snapshot(&category).unwrap(), once);
    }

    #[test]
    fn test_release_confirmed_hold_returns_capacity() {
        let (ledger, category) = ledger_with(4);
        let token = ledger.hold(category, 4).unwrap();
        ledger.confirm(&token).unwrap();
        assert_eq!(ledger.snapshot(&category).unwrap().available(), 0);

        ledger.release(&token).unwrap();
        let counts = ledger.snapshot(&category).unwrap();
        assert_eq!(counts.confirmed, 0);
        assert_eq!(counts.available(), 4);
    }

    #[test]
    fn test_forged_token_is_invalid() {
        let (ledger, category) = ledger_with(4);
        let token = ledger.hold(category, 2).unwrap();

        let forged = HoldToken {
            quantity: 4,
            ..token.clone()
        };
        assert!(matches!(
            ledger.release(&forged),
            Err(BoxOfficeError::InvalidToken(_))
        ));

        let unknown = HoldToken {
            hold_id: HoldId::new(),
            ..token
        };
        assert!(matches!(
            ledger.confirm(&unknown),
            Err(BoxOfficeError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_adopt_rebuilds_counts() {
        let (ledger, category) = ledger_with(10);
        let held = HoldToken {
            hold_id: HoldId::new(),
            category_id: category,
            quantity: 3,
        };
        let confirmed = HoldToken {
            hold_id: HoldId::new(),
            category_id: category,
            quantity: 5,
        };
        let released = HoldToken {
            hold_id: HoldId::new(),
            category_id: category,
            quantity: 9,
        };

        ledger.adopt(&held, HoldState::Held).unwrap();
        ledger.adopt(&confirmed, HoldState::Confirmed).unwrap();
        ledger.adopt(&released, HoldState::Released).unwrap();
        // adopting twice must not double count
        ledger.adopt(&held, HoldState::Held).unwrap();

        let counts = ledger.snapshot(&category).unwrap();
        assert_eq!(counts.held, 3);
        assert_eq!(counts.confirmed, 5);
        assert_eq!(ledger.release(&released).unwrap(), ReleaseOutcome::AlreadyReleased);
    }

    #[test]
    fn test_concurrent_holds_never_exceed_capacity() {
        let (ledger, category) = ledger_with(25);
        let ledger = Arc::new(ledger);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || {
                    (0..10)
                        .filter(|_| ledger.hold(category, 1).is_ok())
                        .count()
                })
            })
            .collect();

        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 25);

        let counts = ledger.snapshot(&category).unwrap();
        assert_eq!(counts.held, 25);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Hold(u32),
        Confirm(usize),
        Release(usize),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1u32..6).prop_map(Op::Hold),
            any::<usize>().prop_map(Op::Confirm),
            any::<usize>().prop_map(Op::Release),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: whatever the sequence of operations, held + confirmed
        /// stays within capacity and matches the live tokens.
        #[test]
        fn held_plus_confirmed_within_capacity(
            capacity in 1u32..30,
            ops in prop::collection::vec(op_strategy(), 1..60)
        ) {
            let (ledger, category) = ledger_with(capacity);
            let mut tokens: Vec<(HoldToken, HoldState)> = Vec::new();

            for op in ops {
                match op {
                    Op::Hold(quantity) => {
                        if let Ok(token) = ledger.hold(category, quantity) {
                            tokens.push((token, HoldState::Held));
                        }
                    }
                    Op::Confirm(index) if !tokens.is_empty() => {
                        let slot = index % tokens.len();
                        let (token, state) = &mut tokens[slot];
                        match ledger.confirm(token) {
                            Ok(()) => *state = HoldState::Confirmed,
                            Err(_) => prop_assert_eq!(*state, HoldState::Released),
                        }
                    }
                    Op::Release(index) if !tokens.is_empty() => {
                        let slot = index % tokens.len();
                        let (token, state) = &mut tokens[slot];
                        ledger.release(token).unwrap();
                        *state = HoldState::Released;
                    }
                    Op::Confirm(_) | Op::Release(_) => {}
                }

                let counts = ledger.snapshot(&category).unwrap();
                prop_assert!(counts.held + counts.confirmed <= capacity);

                let expected_held: u32 = tokens
                    .iter()
                    .filter(|(_, state)| *state == HoldState::Held)
                    .map(|(token, _)| token.quantity)
                    .sum();
                let expected_confirmed: u32 = tokens
                    .iter()
                    .filter(|(_, state)| *state == HoldState::Confirmed)
                    .map(|(token, _)| token.quantity)
                    .sum();
                prop_assert_eq!(counts.held, expected_held);
                prop_assert_eq!(counts.confirmed, expected_confirmed);
            }
        }
    }
}
