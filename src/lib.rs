pub mod clock;
pub mod config;
pub mod config_parser;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod policy;
pub mod retry;
pub mod shutdown;
pub mod store;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::*;
pub use domain::*;
pub use error::*;
pub use gateway::{build_gateway, ChargeStatus, GatewayResult, GatewayStatus, PaymentGateway};
pub use ledger::{CategoryCounts, HoldState, HoldToken, InventoryLedger, ReleaseOutcome};
pub use metrics::Metrics;
pub use orchestrator::{CancellationResult, LifecycleEngine, RefundState, RestoreReport};
pub use policy::{CancellationDecision, CancellationPolicy};
pub use store::{EntityStore, MemoryStore, RocksDBStore, StoreBackend, UnitOfWork};
