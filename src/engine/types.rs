//! Core data types for the reconciliation engine

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::helpers::{format_decimals, round_float, truncate_float};

use super::errors::{EngineError, EngineResult, StepFailure};
use super::sizing;

/// Stable user identifier (the chat user id in the delivery layer)
pub type AccountId = i64;

/// Exchange-assigned order identifier
pub type OrderId = String;

/// Exchange API credentials
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
}

impl Credentials {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// Per-user account record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// USDT equity, refreshed from the exchange every step
    pub equity_usdt: f64,
    /// Fraction used for rung spacing and take-profit markup (e.g. 0.02)
    pub risk_percent: f64,
    pub trading_enabled: bool,
    /// Place a fresh buy right after a sell closes the cycle
    pub auto_rebuy_after_sell: bool,
    pub credentials: Credentials,
}

impl Account {
    pub fn new(id: AccountId, risk_percent: f64, credentials: Credentials) -> Self {
        Self {
            id,
            equity_usdt: 0.0,
            risk_percent,
            trading_enabled: false,
            auto_rebuy_after_sell: true,
            credentials,
        }
    }

    pub fn with_auto_rebuy(mut self, auto_rebuy: bool) -> Self {
        self.auto_rebuy_after_sell = auto_rebuy;
        self
    }
}

/// Partial account write: `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub equity_usdt: Option<f64>,
    pub risk_percent: Option<f64>,
    pub trading_enabled: Option<bool>,
    pub auto_rebuy_after_sell: Option<bool>,
}

impl AccountUpdate {
    pub fn equity(equity_usdt: f64) -> Self {
        Self {
            equity_usdt: Some(equity_usdt),
            ..Self::default()
        }
    }

    pub fn trading_enabled(enabled: bool) -> Self {
        Self {
            trading_enabled: Some(enabled),
            ..Self::default()
        }
    }

    pub fn apply(&self, account: &mut Account) {
        if let Some(equity) = self.equity_usdt {
            account.equity_usdt = equity;
        }
        if let Some(risk) = self.risk_percent {
            account.risk_percent = risk;
        }
        if let Some(enabled) = self.trading_enabled {
            account.trading_enabled = enabled;
        }
        if let Some(auto_rebuy) = self.auto_rebuy_after_sell {
            account.auto_rebuy_after_sell = auto_rebuy;
        }
    }
}

/// Lifecycle state of a pair, derived from the position fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    /// Nothing held; possibly a buy rung resting on the book
    Flat { awaiting_buy: bool },
    /// Inventory held; a next rung and/or a take-profit sell may be resting
    Accumulating { awaiting_buy: bool, awaiting_sell: bool },
}

impl PositionState {
    pub fn is_flat(&self) -> bool {
        matches!(self, PositionState::Flat { .. })
    }
}

/// Grid/DCA position for one (user, symbol) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    /// Ratcheted local high while flat
    pub entry_price: f64,
    /// Absolute price drop between rungs
    pub decrement: f64,
    pub quantity_held: f64,
    /// Buy fill prices of the current cycle, oldest first
    #[serde(default)]
    pub fill_prices: Vec<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_buy_order_id: Option<OrderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_sell_order_id: Option<OrderId>,
    /// Income of the last closed cycle
    #[serde(default)]
    pub realized_income: f64,
}

impl Position {
    /// Zero-valued position, as created when a user adds a symbol
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            entry_price: 0.0,
            decrement: 0.0,
            quantity_held: 0.0,
            fill_prices: Vec::new(),
            open_buy_order_id: None,
            open_sell_order_id: None,
            realized_income: 0.0,
        }
    }

    pub fn state(&self) -> PositionState {
        let awaiting_buy = self.open_buy_order_id.is_some();
        if self.quantity_held == 0.0 {
            PositionState::Flat { awaiting_buy }
        } else {
            PositionState::Accumulating {
                awaiting_buy,
                awaiting_sell: self.open_sell_order_id.is_some(),
            }
        }
    }

    pub fn is_flat(&self) -> bool {
        self.state().is_flat()
    }

    /// Mean buy price of the current cycle; `None` while nothing was bought
    pub fn average_cost(&self) -> Option<f64> {
        sizing::weighted_average_cost(&self.fill_prices)
    }

    pub fn last_fill_price(&self) -> Option<f64> {
        self.fill_prices.last().copied()
    }

    /// Check the flat/holding invariants enforced at the store boundary
    pub fn validate(&self) -> EngineResult<()> {
        if self.quantity_held < 0.0 {
            return Err(EngineError::InvalidPosition(format!(
                "{}: negative quantity {}",
                self.symbol, self.quantity_held
            )));
        }
        if self.quantity_held == 0.0 {
            if !self.fill_prices.is_empty() {
                return Err(EngineError::InvalidPosition(format!(
                    "{}: flat but {} fills recorded",
                    self.symbol,
                    self.fill_prices.len()
                )));
            }
            if let Some(sell) = &self.open_sell_order_id {
                return Err(EngineError::InvalidPosition(format!(
                    "{}: flat with open sell order {}",
                    self.symbol, sell
                )));
            }
        } else if self.fill_prices.is_empty() {
            return Err(EngineError::InvalidPosition(format!(
                "{}: holding {} without fill history",
                self.symbol, self.quantity_held
            )));
        }
        Ok(())
    }
}

/// Partial position write: `None` fields are left untouched.
///
/// Order ids use a nested option so a write can clear them (`Some(None)`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionUpdate {
    pub entry_price: Option<f64>,
    pub decrement: Option<f64>,
    pub quantity_held: Option<f64>,
    pub fill_prices: Option<Vec<f64>>,
    pub open_buy_order_id: Option<Option<OrderId>>,
    pub open_sell_order_id: Option<Option<OrderId>>,
    pub realized_income: Option<f64>,
}

impl PositionUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to flat with the given anchor; clears holdings and both orders
    pub fn flat(entry_price: f64, decrement: f64) -> Self {
        Self {
            entry_price: Some(entry_price),
            decrement: Some(decrement),
            quantity_held: Some(0.0),
            fill_prices: Some(Vec::new()),
            open_buy_order_id: Some(None),
            open_sell_order_id: Some(None),
            realized_income: None,
        }
    }

    pub fn entry(mut self, entry_price: f64, decrement: f64) -> Self {
        self.entry_price = Some(entry_price);
        self.decrement = Some(decrement);
        self
    }

    pub fn holdings(mut self, quantity_held: f64, fill_prices: Vec<f64>) -> Self {
        self.quantity_held = Some(quantity_held);
        self.fill_prices = Some(fill_prices);
        self
    }

    pub fn buy_order(mut self, order_id: Option<OrderId>) -> Self {
        self.open_buy_order_id = Some(order_id);
        self
    }

    pub fn sell_order(mut self, order_id: Option<OrderId>) -> Self {
        self.open_sell_order_id = Some(order_id);
        self
    }

    pub fn income(mut self, income: f64) -> Self {
        self.realized_income = Some(income);
        self
    }

    pub fn apply(&self, position: &mut Position) {
        if let Some(entry) = self.entry_price {
            position.entry_price = entry;
        }
        if let Some(decrement) = self.decrement {
            position.decrement = decrement;
        }
        if let Some(quantity) = self.quantity_held {
            position.quantity_held = quantity;
        }
        if let Some(fills) = &self.fill_prices {
            position.fill_prices = fills.clone();
        }
        if let Some(buy) = &self.open_buy_order_id {
            position.open_buy_order_id = buy.clone();
        }
        if let Some(sell) = &self.open_sell_order_id {
            position.open_sell_order_id = sell.clone();
        }
        if let Some(income) = self.realized_income {
            position.realized_income = income;
        }
    }
}

/// Per-symbol trading constraints from the instrument catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentSpec {
    pub symbol: String,
    pub qty_decimals: u32,
    pub price_decimals: u32,
    #[serde(default)]
    pub min_order_qty: f64,
}

impl InstrumentSpec {
    pub fn new(symbol: impl Into<String>, qty_decimals: u32, price_decimals: u32, min_order_qty: f64) -> Self {
        Self {
            symbol: symbol.into(),
            qty_decimals,
            price_decimals,
            min_order_qty,
        }
    }

    /// Quantities are truncated so an order never asks for more than is held
    pub fn round_qty(&self, qty: f64) -> f64 {
        truncate_float(qty, self.qty_decimals)
    }

    pub fn round_price(&self, price: f64) -> f64 {
        round_float(price, self.price_decimals)
    }

    pub fn meets_minimum(&self, qty: f64) -> bool {
        qty > 0.0 && qty >= self.min_order_qty
    }

    pub fn format_qty(&self, qty: f64) -> String {
        format_decimals(qty, self.qty_decimals)
    }

    pub fn format_price(&self, price: f64) -> String {
        format_decimals(price, self.price_decimals)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

impl From<&str> for OrderSide {
    fn from(s: &str) -> Self {
        match s.to_uppercase().as_str() {
            "B" | "BUY" => OrderSide::Buy,
            _ => OrderSide::Sell,
        }
    }
}

/// Exchange-side order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    New,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl From<&str> for OrderState {
    fn from(s: &str) -> Self {
        match s {
            "Filled" => OrderState::Filled,
            "PartiallyFilled" => OrderState::PartiallyFilled,
            "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderState::Cancelled,
            "Rejected" => OrderState::Rejected,
            _ => OrderState::New,
        }
    }
}

/// Result of querying an order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderReport {
    pub order_id: OrderId,
    pub side: OrderSide,
    pub state: OrderState,
    pub filled_qty: f64,
    /// Average execution price
    pub filled_price: f64,
    /// Cumulative fee; base asset for buys, quote asset for sells
    pub fee: f64,
}

impl OrderReport {
    pub fn is_filled(&self) -> bool {
        self.state == OrderState::Filled
    }

    /// Cancelled or rejected without executing anything; the order is gone
    pub fn is_void(&self) -> bool {
        matches!(self.state, OrderState::Cancelled | OrderState::Rejected) && self.filled_qty <= 0.0
    }
}

/// What happened, for the notification sink
#[derive(Debug, Clone, PartialEq)]
pub enum MessageKind {
    Buy { fill_price: f64, quantity: f64 },
    Sell { fill_price: f64, quantity: f64, income: f64 },
    Error { origin: String, text: String },
}

/// Outbound notification event
#[derive(Debug, Clone)]
pub struct Message {
    pub account_id: AccountId,
    pub equity_usdt: Option<f64>,
    pub position: Option<Position>,
    pub kind: MessageKind,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn buy(account: &Account, position: &Position, fill_price: f64, quantity: f64) -> Self {
        Self {
            account_id: account.id,
            equity_usdt: Some(account.equity_usdt),
            position: Some(position.clone()),
            kind: MessageKind::Buy { fill_price, quantity },
            created_at: Utc::now(),
        }
    }

    pub fn sell(account: &Account, position: &Position, fill_price: f64, quantity: f64, income: f64) -> Self {
        Self {
            account_id: account.id,
            equity_usdt: Some(account.equity_usdt),
            position: Some(position.clone()),
            kind: MessageKind::Sell {
                fill_price,
                quantity,
                income,
            },
            created_at: Utc::now(),
        }
    }

    pub fn error(failure: &StepFailure) -> Self {
        Self {
            account_id: failure.origin.account_id,
            equity_usdt: None,
            position: None,
            kind: MessageKind::Error {
                origin: failure.origin.to_string(),
                text: failure.error.to_string(),
            },
            created_at: Utc::now(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, MessageKind::Error { .. })
    }

    pub fn symbol(&self) -> Option<&str> {
        self.position.as_ref().map(|p| p.symbol.as_str())
    }

    /// Human-readable notification text
    pub fn render(&self) -> String {
        let symbol = self.symbol().unwrap_or("-");
        match &self.kind {
            MessageKind::Buy { fill_price, quantity } => {
                let avg = self
                    .position
                    .as_ref()
                    .and_then(Position::average_cost)
                    .unwrap_or(*fill_price);
                format!(
                    "Bought {} {} at {:.6}, average cost {:.6}",
                    quantity, symbol, fill_price, avg
                )
            }
            MessageKind::Sell {
                fill_price,
                quantity,
                income,
            } => format!(
                "Sold {} {} at {:.6}, income {:.4} USDT",
                quantity, symbol, fill_price, income
            ),
            MessageKind::Error { origin, text } => format!("Error [{}]: {}", origin, text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::errors::Origin;

    fn holding(qty: f64, fills: Vec<f64>) -> Position {
        let mut position = Position::new("BTCUSDT");
        position.quantity_held = qty;
        position.fill_prices = fills;
        position
    }

    #[test]
    fn test_position_state() {
        let mut position = Position::new("BTCUSDT");
        assert_eq!(position.state(), PositionState::Flat { awaiting_buy: false });

        position.open_buy_order_id = Some("b1".into());
        assert_eq!(position.state(), PositionState::Flat { awaiting_buy: true });

        let mut position = holding(0.5, vec![98.0]);
        position.open_sell_order_id = Some("s1".into());
        assert_eq!(
            position.state(),
            PositionState::Accumulating {
                awaiting_buy: false,
                awaiting_sell: true
            }
        );
        assert!(!position.is_flat());
    }

    #[test]
    fn test_validate_rejects_illegal_combinations() {
        assert!(Position::new("BTCUSDT").validate().is_ok());
        assert!(holding(0.999, vec![98.0]).validate().is_ok());

        let mut flat_with_sell = Position::new("BTCUSDT");
        flat_with_sell.open_sell_order_id = Some("s1".into());
        assert!(matches!(
            flat_with_sell.validate(),
            Err(EngineError::InvalidPosition(_))
        ));

        assert!(holding(0.0, vec![98.0]).validate().is_err());
        assert!(holding(1.0, vec![]).validate().is_err());
        assert!(holding(-1.0, vec![98.0]).validate().is_err());
    }

    #[test]
    fn test_position_update_is_partial() {
        let mut position = holding(0.999, vec![98.0]);
        position.open_sell_order_id = Some("s1".into());
        position.entry_price = 100.0;

        PositionUpdate::new().buy_order(Some("b2".into())).apply(&mut position);
        assert_eq!(position.open_buy_order_id.as_deref(), Some("b2"));
        assert_eq!(position.open_sell_order_id.as_deref(), Some("s1"));
        assert_eq!(position.entry_price, 100.0);
        assert_eq!(position.quantity_held, 0.999);

        PositionUpdate::flat(99.96, 1.9992).apply(&mut position);
        assert!(position.is_flat());
        assert!(position.fill_prices.is_empty());
        assert_eq!(position.open_buy_order_id, None);
        assert_eq!(position.open_sell_order_id, None);
        assert_eq!(position.entry_price, 99.96);
    }

    #[test]
    fn test_instrument_rounding() {
        let spec = InstrumentSpec::new("BTCUSDT", 3, 2, 0.001);
        assert_eq!(spec.round_qty(1.0 - 0.001), 0.999);
        assert_eq!(spec.round_qty(0.12399), 0.123);
        assert_eq!(spec.round_price(98.0 * 1.02), 99.96);
        assert!(spec.meets_minimum(0.001));
        assert!(!spec.meets_minimum(0.0));
        assert_eq!(spec.format_qty(0.5), "0.500");
        assert_eq!(spec.format_price(98.0), "98.00");
    }

    #[test]
    fn test_order_state_from_exchange() {
        assert_eq!(OrderState::from("Filled"), OrderState::Filled);
        assert_eq!(OrderState::from("New"), OrderState::New);
        assert_eq!(OrderState::from("Cancelled"), OrderState::Cancelled);
        assert_eq!(OrderSide::from("buy"), OrderSide::Buy);
        assert_eq!(OrderSide::from("Sell"), OrderSide::Sell);
    }

    #[test]
    fn test_void_orders() {
        let mut report = OrderReport {
            order_id: "o-1".into(),
            side: OrderSide::Buy,
            state: OrderState::Rejected,
            filled_qty: 0.0,
            filled_price: 0.0,
            fee: 0.0,
        };
        assert!(report.is_void());

        report.state = OrderState::New;
        assert!(!report.is_void());

        // a partial fill before the cancel still holds coins
        report.state = OrderState::Cancelled;
        report.filled_qty = 0.1;
        assert!(!report.is_void());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials::new("key", "super-secret");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("key"));
        assert!(!debug.contains("super-secret"));
    }

    #[test]
    fn test_message_render() {
        let account = Account::new(1, 0.02, Credentials::default());
        let position = holding(0.999, vec![98.0, 96.0]);

        let buy = Message::buy(&account, &position, 96.0, 0.999);
        assert!(buy.render().contains("average cost 97.000000"));

        let sell = Message::sell(&account, &Position::new("BTCUSDT"), 99.96, 0.999, 2.958);
        assert_eq!(sell.render(), "Sold 0.999 BTCUSDT at 99.960000, income 2.9580 USDT");

        let failure = StepFailure::new(
            Origin::new(1, "BTCUSDT", "get_price"),
            EngineError::Exchange("boom".into()),
        );
        let error = Message::error(&failure);
        assert!(error.is_error());
        assert_eq!(
            error.render(),
            "Error [user=1 symbol=BTCUSDT stage=get_price]: Exchange error: boom"
        );
    }
}
