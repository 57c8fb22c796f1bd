pub mod config;
pub mod engine;
pub mod helpers;
pub mod market;
pub mod runner;

pub use engine::{
    CoinReconciler, EngineError, EngineResult, ExchangeGateway, InstrumentCatalog, PositionStore, WorkerSupervisor,
};
pub use helpers::{round_float, truncate_float};
pub use runner::EngineRunner;
