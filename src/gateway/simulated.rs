use super::{ChargeStatus, GatewayResult, GatewayStatus, PaymentGateway};
use crate::domain::{Money, PaymentMethod};
use crate::{BoxOfficeError, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

/// Scripted answer for the next charge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Approve,
    Decline(String),
    /// Nothing reaches the processor
    Unavailable,
    /// The processor books the charge but the answer is lost
    ApproveThenUnavailable,
}

/// Scripted answer for the next refund
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefundOutcome {
    Approve,
    Decline(String),
    Unavailable,
}

#[derive(Debug, Clone)]
struct Transaction {
    amount: Money,
    refunded: bool,
}

/// In-process processor used in test mode.
///
/// Unscripted calls are approved. Charges are deduplicated on their
/// idempotency key, so only a key's first definitive answer is ever booked.
#[derive(Debug, Default)]
pub struct SimulatedGateway {
    charge_script: Mutex<VecDeque<ChargeOutcome>>,
    refund_script: Mutex<VecDeque<RefundOutcome>>,
    charges_by_key: DashMap<String, GatewayResult>,
    transactions: DashMap<String, Transaction>,
    charge_calls: AtomicUsize,
    refund_calls: AtomicUsize,
    refunds_booked: AtomicUsize,
    sequence: AtomicU64,
    latency: Option<Duration>,
}

impl SimulatedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call sleeps for `latency` before answering
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency: Some(latency),
            ..Self::default()
        }
    }

    pub fn script_charges(&self, outcomes: impl IntoIterator<Item = ChargeOutcome>) {
        self.charge_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(outcomes);
    }

    pub fn script_refunds(&self, outcomes: impl IntoIterator<Item = RefundOutcome>) {
        self.refund_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .extend(outcomes);
    }

    pub fn charge_calls(&self) -> usize {
        self.charge_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    /// Number of refunds that actually moved money
    pub fn refunds_booked(&self) -> usize {
        self.refunds_booked.load(Ordering::SeqCst)
    }

    /// Number of charges actually booked
    pub fn booked_charges(&self) -> usize {
        self.transactions.len()
    }

    /// Sum of booked charges that have not been refunded
    pub fn captured_total(&self) -> Money {
        let cents = self
            .transactions
            .iter()
            .filter(|entry| !entry.value().refunded)
            .map(|entry| entry.value().amount.cents())
            .sum();
        Money::from_cents(cents)
    }

    fn next_charge(&self) -> ChargeOutcome {
        self.charge_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or(ChargeOutcome::Approve)
    }

    fn next_refund(&self) -> RefundOutcome {
        self.refund_script
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or(RefundOutcome::Approve)
    }

    fn next_ref(&self, prefix: &str) -> String {
        format!("{}_{:06}", prefix, self.sequence.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn book_charge(&self, amount: Money) -> GatewayResult {
        let transaction_ref = self.next_ref("ch");
        self.transactions.insert(
            transaction_ref.clone(),
            Transaction {
                amount,
                refunded: false,
            },
        );
        GatewayResult::approved(transaction_ref)
    }
}

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn charge(
        &self,
        amount: Money,
        method: PaymentMethod,
        idempotency_key: &str,
    ) -> Result<GatewayResult> {
        self.charge_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        // The entry guard keeps two calls with one key from both booking
        let slot = match self.charges_by_key.entry(idempotency_key.to_string()) {
            Entry::Occupied(previous) => {
                debug!("Replaying charge result for key {}", idempotency_key);
                return Ok(previous.get().clone());
            }
            Entry::Vacant(slot) => slot,
        };

        match self.next_charge() {
            ChargeOutcome::Approve => {
                let result = self.book_charge(amount);
                slot.insert(result.clone());
                info!(
                    "Simulated charge of {} by {:?} approved ({:?})",
                    amount, method, result.transaction_ref
                );
                Ok(result)
            }
            ChargeOutcome::Decline(reason) => {
                let result = GatewayResult::declined(reason);
                slot.insert(result.clone());
                info!("Simulated charge of {} declined", amount);
                Ok(result)
            }
            ChargeOutcome::Unavailable => Err(BoxOfficeError::GatewayUnavailable(
                "simulated processor timeout".to_string(),
            )),
            ChargeOutcome::ApproveThenUnavailable => {
                let result = self.book_charge(amount);
                slot.insert(result);
                Err(BoxOfficeError::GatewayUnavailable(
                    "simulated response lost".to_string(),
                ))
            }
        }
    }

    async fn refund(&self, transaction_ref: &str, amount: Money) -> Result<GatewayResult> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        let already_refunded = match self.transactions.get(transaction_ref) {
            Some(transaction) => transaction.refunded,
            None => {
                return Ok(GatewayResult::declined(format!(
                    "unknown transaction {}",
                    transaction_ref
                )))
            }
        };
        if already_refunded {
            return Ok(GatewayResult::approved(format!("re_{}", transaction_ref)));
        }

        match self.next_refund() {
            RefundOutcome::Approve => {
                if let Some(mut transaction) = self.transactions.get_mut(transaction_ref) {
                    transaction.refunded = true;
                }
                self.refunds_booked.fetch_add(1, Ordering::SeqCst);
                info!("Simulated refund of {} on {}", amount, transaction_ref);
                Ok(GatewayResult::approved(format!("re_{}", transaction_ref)))
            }
            RefundOutcome::Decline(reason) => Ok(GatewayResult::declined(reason)),
            RefundOutcome::Unavailable => Err(BoxOfficeError::GatewayUnavailable(
                "simulated processor timeout".to_string(),
            )),
        }
    }

    async fn query_status(&self, reference: &str) -> Result<ChargeStatus> {
        self.simulate_latency().await;
        if self.transactions.contains_key(reference) {
            return Ok(ChargeStatus {
                status: GatewayStatus::Succeeded,
                transaction_ref: Some(reference.to_string()),
            });
        }
        Ok(match self.charges_by_key.get(reference) {
            Some(result) if result.success => ChargeStatus {
                status: GatewayStatus::Succeeded,
                transaction_ref: result.transaction_ref.clone(),
            },
            Some(_) => ChargeStatus {
                status: GatewayStatus::Failed,
                transaction_ref: None,
            },
            None => ChargeStatus::unknown(),
        })
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
