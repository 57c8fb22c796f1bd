//! Grid/DCA reconciliation engine
//!
//! One worker per (account, symbol) pair repeatedly calls
//! [`CoinReconciler::step`], which compares the stored position with the
//! exchange and places or cancels orders to converge them:
//!
//! - **Flat**: the entry price ratchets up with the market and one buy rung
//!   sits `entry * risk` below it.
//! - **Accumulating**: every buy fill adds a rung further down and re-prices
//!   the take-profit sell at `average_cost * (1 + risk)` for the full holding.
//! - **Sell fill**: income is booked, the pair goes flat, and a fresh buy is
//!   placed when the account has auto-rebuy enabled.
//!
//! [`WorkerSupervisor`] owns the worker tasks and the forced liquidation used
//! when a pair is deleted or trading stops.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dca_engine::config::EngineConfig;
//! use dca_engine::engine::{
//!     Account, CoinReconciler, Credentials, InstrumentSpec, MemoryStore, ReconcilerPolicy,
//!     StaticCatalog, WorkerSupervisor,
//! };
//! use dca_engine::engine::mock::MockExchange;
//!
//! # async fn run() -> dca_engine::engine::EngineResult<()> {
//! let store = Arc::new(MemoryStore::new());
//! store
//!     .insert_account(Account::new(1, 0.02, Credentials::default()), &["BTCUSDT".to_string()])
//!     .await?;
//! let catalog = Arc::new(StaticCatalog::new(vec![InstrumentSpec::new("BTCUSDT", 6, 2, 0.000048)]));
//! let gateway = Arc::new(MockExchange::new(65_000.0, 1_000.0));
//!
//! let config = EngineConfig::default();
//! let reconciler = CoinReconciler::new(gateway, store, catalog, ReconcilerPolicy::from(&config));
//! let supervisor = WorkerSupervisor::new(reconciler, config);
//! supervisor.start_trading(1).await?;
//! # Ok(())
//! # }
//! ```

pub mod errors;
pub mod gateway;
pub mod notify;
pub mod reconciler;
pub mod sizing;
pub mod store;
pub mod supervisor;
pub mod types;

pub use errors::{EngineError, EngineResult, Origin, StepFailure};
pub use gateway::{mock, ExchangeGateway, TimedGateway};
pub use notify::{Delivery, Notifier};
pub use reconciler::{CoinReconciler, ReconcilerPolicy, StepOutcome, StepReport};
pub use store::{IncomeRecord, InstrumentCatalog, MemoryStore, PositionStore, StaticCatalog};
pub use supervisor::WorkerSupervisor;
pub use types::{
    Account, AccountId, AccountUpdate, Credentials, InstrumentSpec, Message, MessageKind, OrderId, OrderReport,
    OrderSide, OrderState, Position, PositionState, PositionUpdate,
};
