//! Exchange abstraction for the reconciler - enables mocking for tests

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::errors::{EngineError, EngineResult};
use super::types::{Credentials, OrderId, OrderReport, OrderSide};

/// Exchange operations the engine consumes; the signed HTTP client lives behind this.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Last traded price for a symbol
    async fn get_price(&self, symbol: &str) -> EngineResult<f64>;

    /// Wallet equity in USDT
    async fn get_equity(&self, credentials: &Credentials) -> EngineResult<f64>;

    /// Place a resting limit order; quantities and prices arrive already rounded
    async fn place_limit_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
    ) -> EngineResult<OrderId>;

    /// Place a market order
    async fn place_market_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
    ) -> EngineResult<OrderId>;

    /// Cancel an order. `Ok(false)` means the order was no longer open.
    async fn cancel_order(&self, credentials: &Credentials, order_id: &str, symbol: &str) -> EngineResult<bool>;

    /// Query an order. `Ok(None)` means the exchange has no record yet, which
    /// callers treat as "not filled".
    async fn get_order_status(
        &self,
        credentials: &Credentials,
        order_id: &str,
        symbol: &str,
    ) -> EngineResult<Option<OrderReport>>;
}

// ============================================================================
// Timeout decorator
// ============================================================================

/// Bounds every gateway call with a timeout; an elapsed call becomes a
/// transient `EngineError::Timeout`.
pub struct TimedGateway<G> {
    inner: G,
    timeout: Duration,
}

impl<G: ExchangeGateway> TimedGateway<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn timed<T, F>(&self, operation: &'static str, fut: F) -> EngineResult<T>
    where
        T: Send,
        F: Future<Output = EngineResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                operation,
                secs: self.timeout.as_secs(),
            }),
        }
    }
}

#[async_trait]
impl<G: ExchangeGateway> ExchangeGateway for TimedGateway<G> {
    async fn get_price(&self, symbol: &str) -> EngineResult<f64> {
        self.timed("get_price", self.inner.get_price(symbol)).await
    }

    async fn get_equity(&self, credentials: &Credentials) -> EngineResult<f64> {
        self.timed("get_equity", self.inner.get_equity(credentials)).await
    }

    async fn place_limit_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
    ) -> EngineResult<OrderId> {
        self.timed(
            "place_limit_order",
            self.inner.place_limit_order(credentials, symbol, side, qty, price),
        )
        .await
    }

    async fn place_market_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
    ) -> EngineResult<OrderId> {
        self.timed(
            "place_market_order",
            self.inner.place_market_order(credentials, symbol, side, qty),
        )
        .await
    }

    async fn cancel_order(&self, credentials: &Credentials, order_id: &str, symbol: &str) -> EngineResult<bool> {
        self.timed("cancel_order", self.inner.cancel_order(credentials, order_id, symbol))
            .await
    }

    async fn get_order_status(
        &self,
        credentials: &Credentials,
        order_id: &str,
        symbol: &str,
    ) -> EngineResult<Option<OrderReport>> {
        self.timed(
            "get_order_status",
            self.inner.get_order_status(credentials, order_id, symbol),
        )
        .await
    }
}

// ============================================================================
// Mock Implementation for Testing
// ============================================================================

/// Scriptable exchange for reconciler tests.
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use crate::engine::types::OrderState;

    /// An order submitted to the mock
    #[derive(Debug, Clone, PartialEq)]
    pub struct PlacedOrder {
        pub order_id: OrderId,
        pub symbol: String,
        pub side: OrderSide,
        pub qty: f64,
        /// `None` for market orders
        pub price: Option<f64>,
    }

    pub struct MockExchange {
        pub price: Arc<Mutex<f64>>,
        pub equity: Arc<Mutex<f64>>,
        pub placed: Arc<Mutex<Vec<PlacedOrder>>>,
        pub cancelled: Arc<Mutex<Vec<OrderId>>>,
        pub reports: Arc<Mutex<HashMap<OrderId, OrderReport>>>,
        /// Reports that land just before a cancel for the same id arrives
        pub fill_on_cancel: Arc<Mutex<HashMap<OrderId, OrderReport>>>,
        pub should_fail: Arc<Mutex<bool>>,
        /// Market orders fill at the current price as soon as they are placed
        pub fill_market_orders: Arc<Mutex<bool>>,
        next_oid: AtomicU64,
    }

    impl MockExchange {
        pub fn new(price: f64, equity: f64) -> Self {
            Self {
                price: Arc::new(Mutex::new(price)),
                equity: Arc::new(Mutex::new(equity)),
                placed: Arc::new(Mutex::new(Vec::new())),
                cancelled: Arc::new(Mutex::new(Vec::new())),
                reports: Arc::new(Mutex::new(HashMap::new())),
                fill_on_cancel: Arc::new(Mutex::new(HashMap::new())),
                should_fail: Arc::new(Mutex::new(false)),
                fill_market_orders: Arc::new(Mutex::new(true)),
                next_oid: AtomicU64::new(1),
            }
        }

        pub async fn set_price(&self, price: f64) {
            *self.price.lock().await = price;
        }

        pub async fn set_should_fail(&self, fail: bool) {
            *self.should_fail.lock().await = fail;
        }

        pub async fn set_fill_market_orders(&self, fill: bool) {
            *self.fill_market_orders.lock().await = fill;
        }

        /// Mark a previously placed order as filled
        pub async fn fill(&self, order_id: &str, filled_qty: f64, filled_price: f64, fee: f64) {
            let side = self
                .placed
                .lock()
                .await
                .iter()
                .find(|o| o.order_id == order_id)
                .map(|o| o.side)
                .unwrap_or(OrderSide::Buy);
            self.reports.lock().await.insert(
                order_id.to_string(),
                OrderReport {
                    order_id: order_id.to_string(),
                    side,
                    state: OrderState::Filled,
                    filled_qty,
                    filled_price,
                    fee,
                },
            );
        }

        /// Script a report for any order id, including ones the mock never placed
        pub async fn set_report(&self, report: OrderReport) {
            self.reports.lock().await.insert(report.order_id.clone(), report);
        }

        /// Let an order fill at the moment something tries to cancel it
        pub async fn fill_when_cancelled(&self, report: OrderReport) {
            self.fill_on_cancel.lock().await.insert(report.order_id.clone(), report);
        }

        pub async fn placed_orders(&self) -> Vec<PlacedOrder> {
            self.placed.lock().await.clone()
        }

        pub async fn last_placed(&self, side: OrderSide) -> Option<PlacedOrder> {
            self.placed
                .lock()
                .await
                .iter()
                .rev()
                .find(|o| o.side == side)
                .cloned()
        }

        pub async fn cancelled_orders(&self) -> Vec<OrderId> {
            self.cancelled.lock().await.clone()
        }

        async fn fail_if_scripted(&self) -> EngineResult<()> {
            if *self.should_fail.lock().await {
                return Err(EngineError::Exchange("Mock failure".into()));
            }
            Ok(())
        }

        async fn record(&self, symbol: &str, side: OrderSide, qty: f64, price: Option<f64>) -> OrderId {
            let order_id = format!("mock-{}", self.next_oid.fetch_add(1, Ordering::SeqCst));
            self.placed.lock().await.push(PlacedOrder {
                order_id: order_id.clone(),
                symbol: symbol.to_string(),
                side,
                qty,
                price,
            });
            order_id
        }
    }

    #[async_trait]
    impl ExchangeGateway for MockExchange {
        async fn get_price(&self, _symbol: &str) -> EngineResult<f64> {
            self.fail_if_scripted().await?;
            Ok(*self.price.lock().await)
        }

        async fn get_equity(&self, _credentials: &Credentials) -> EngineResult<f64> {
            self.fail_if_scripted().await?;
            Ok(*self.equity.lock().await)
        }

        async fn place_limit_order(
            &self,
            _credentials: &Credentials,
            symbol: &str,
            side: OrderSide,
            qty: f64,
            price: f64,
        ) -> EngineResult<OrderId> {
            self.fail_if_scripted().await?;
            Ok(self.record(symbol, side, qty, Some(price)).await)
        }

        async fn place_market_order(
            &self,
            _credentials: &Credentials,
            symbol: &str,
            side: OrderSide,
            qty: f64,
        ) -> EngineResult<OrderId> {
            self.fail_if_scripted().await?;
            let order_id = self.record(symbol, side, qty, None).await;
            if *self.fill_market_orders.lock().await {
                let price = *self.price.lock().await;
                self.fill(&order_id, qty, price, 0.0).await;
            }
            Ok(order_id)
        }

        async fn cancel_order(&self, _credentials: &Credentials, order_id: &str, _symbol: &str) -> EngineResult<bool> {
            self.fail_if_scripted().await?;
            if let Some(report) = self.fill_on_cancel.lock().await.remove(order_id) {
                self.reports.lock().await.insert(order_id.to_string(), report);
            }
            let already_filled = self
                .reports
                .lock()
                .await
                .get(order_id)
                .map(OrderReport::is_filled)
                .unwrap_or(false);
            if already_filled {
                return Ok(false);
            }
            self.cancelled.lock().await.push(order_id.to_string());
            Ok(true)
        }

        async fn get_order_status(
            &self,
            _credentials: &Credentials,
            order_id: &str,
            _symbol: &str,
        ) -> EngineResult<Option<OrderReport>> {
            self.fail_if_scripted().await?;
            Ok(self.reports.lock().await.get(order_id).cloned())
        }
    }
}
