//! Engine error types

use std::fmt;

use thiserror::Error;

use super::types::AccountId;

/// Errors that can occur while reconciling a trading pair
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    #[error("Exchange error: {0}")]
    Exchange(String),

    #[error("Timed out after {secs}s waiting for {operation}")]
    Timeout { operation: &'static str, secs: u64 },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Instrument not found in catalog: {0}")]
    InstrumentNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("Position not found: user {account_id}, symbol {symbol}")]
    PositionNotFound { account_id: AccountId, symbol: String },

    #[error("Inconsistent data: {0}")]
    DataInconsistency(String),

    #[error("Rejected position write: {0}")]
    InvalidPosition(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Liquidation order {order_id} not filled after {attempts} checks")]
    LiquidationTimeout { order_id: String, attempts: u32 },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("JSON parse error: {0}")]
    JsonParse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Worker panicked: {0}")]
    Panicked(String),
}

impl EngineError {
    /// Network, timeout and storage failures that the next tick may not hit again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Exchange(_)
                | EngineError::Timeout { .. }
                | EngineError::Store(_)
                | EngineError::Http(_)
                | EngineError::Io(_)
        )
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            EngineError::Timeout {
                operation: "http request",
                secs: 0,
            }
        } else {
            EngineError::Http(err.to_string())
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::JsonParse(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(err.to_string())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::InvalidConfig(err.to_string())
    }
}

/// Result type for engine operations
pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Where a failure happened, rendered into operator alerts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub account_id: AccountId,
    pub symbol: String,
    pub order_id: Option<String>,
    pub stage: &'static str,
}

impl Origin {
    pub fn new(account_id: AccountId, symbol: impl Into<String>, stage: &'static str) -> Self {
        Self {
            account_id,
            symbol: symbol.into(),
            order_id: None,
            stage,
        }
    }

    pub fn with_order(mut self, order_id: impl Into<String>) -> Self {
        self.order_id = Some(order_id.into());
        self
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "user={} symbol={}", self.account_id, self.symbol)?;
        if let Some(order_id) = &self.order_id {
            write!(f, " order={}", order_id)?;
        }
        write!(f, " stage={}", self.stage)
    }
}

/// A reconciliation step that failed, with its origin tag attached
#[derive(Error, Debug, Clone)]
#[error("{error} ({origin})")]
pub struct StepFailure {
    pub origin: Origin,
    #[source]
    pub error: EngineError,
}

impl StepFailure {
    pub fn new(origin: Origin, error: EngineError) -> Self {
        Self { origin, error }
    }
}
