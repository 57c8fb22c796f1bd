//! Paper exchange
//!
//! Takes prices from a [`PriceSource`] and simulates execution locally.
//! Limit orders fill at their limit price the first time the order is queried
//! while the market has crossed it; market orders fill immediately. Every
//! API key gets its own wallet seeded with `initial_cash` USDT.
//!
//! Fees follow the spot convention the engine expects: a buy pays its fee in
//! the base asset, a sell in USDT.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, info};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::ticker::PriceSource;
use crate::config::PaperConfig;
use crate::engine::{
    Credentials, EngineError, EngineResult, ExchangeGateway, OrderId, OrderReport, OrderSide, OrderState,
};

/// Dust left by float arithmetic on wallet balances
const BALANCE_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone)]
struct PaperOrder {
    api_key: String,
    symbol: String,
    side: OrderSide,
    qty: f64,
    /// `None` for market orders
    limit_price: Option<f64>,
    state: OrderState,
    filled_price: f64,
    fee: f64,
}

impl PaperOrder {
    fn crosses(&self, price: f64) -> bool {
        match (self.side, self.limit_price) {
            (_, None) => true,
            (OrderSide::Buy, Some(limit)) => price <= limit,
            (OrderSide::Sell, Some(limit)) => price >= limit,
        }
    }

    fn report(&self, order_id: &str) -> OrderReport {
        let filled = self.state == OrderState::Filled;
        OrderReport {
            order_id: order_id.to_string(),
            side: self.side,
            state: self.state,
            filled_qty: if filled { self.qty } else { 0.0 },
            filled_price: self.filled_price,
            fee: self.fee,
        }
    }
}

/// One simulated spot wallet
#[derive(Debug, Clone, Default)]
pub struct PaperWallet {
    pub cash: f64,
    pub holdings: HashMap<String, f64>,
}

impl PaperWallet {
    fn holding(&self, symbol: &str) -> f64 {
        self.holdings.get(symbol).copied().unwrap_or(0.0)
    }
}

#[derive(Default)]
struct Book {
    wallets: HashMap<String, PaperWallet>,
    orders: HashMap<OrderId, PaperOrder>,
}

pub struct PaperExchange<P> {
    prices: P,
    fee_rate: f64,
    initial_cash: f64,
    book: Mutex<Book>,
}

impl<P: PriceSource> PaperExchange<P> {
    pub fn new(prices: P, config: &PaperConfig) -> Self {
        Self {
            prices,
            fee_rate: config.fee_rate,
            initial_cash: config.initial_cash,
            book: Mutex::new(Book::default()),
        }
    }

    pub fn prices(&self) -> &P {
        &self.prices
    }

    /// Snapshot of a wallet; unknown keys report a fresh wallet
    pub async fn wallet(&self, credentials: &Credentials) -> PaperWallet {
        let mut book = self.book.lock().await;
        self.wallet_mut(&mut book, &credentials.api_key).clone()
    }

    fn wallet_mut<'a>(&self, book: &'a mut Book, api_key: &str) -> &'a mut PaperWallet {
        book.wallets
            .entry(api_key.to_string())
            .or_insert_with(|| PaperWallet {
                cash: self.initial_cash,
                holdings: HashMap::new(),
            })
    }

    fn check_funds(wallet: &PaperWallet, symbol: &str, side: OrderSide, qty: f64, price: f64) -> EngineResult<()> {
        match side {
            OrderSide::Buy if wallet.cash + BALANCE_EPSILON < qty * price => Err(EngineError::Exchange(format!(
                "insufficient USDT: need {:.4}, have {:.4}",
                qty * price,
                wallet.cash
            ))),
            OrderSide::Sell if wallet.holding(symbol) + BALANCE_EPSILON < qty => Err(EngineError::Exchange(
                format!("insufficient {}: need {}, have {}", symbol, qty, wallet.holding(symbol)),
            )),
            _ => Ok(()),
        }
    }

    async fn submit(
        &self,
        credentials: &Credentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        limit_price: Option<f64>,
    ) -> EngineResult<OrderId> {
        if !(qty > 0.0) {
            return Err(EngineError::Exchange(format!("invalid order quantity {}", qty)));
        }
        if limit_price.is_some_and(|p| !(p > 0.0)) {
            return Err(EngineError::Exchange(format!("invalid limit price {:?}", limit_price)));
        }
        let market_price = self.prices.last_price(symbol).await?;

        let mut book = self.book.lock().await;
        let wallet = self.wallet_mut(&mut book, &credentials.api_key);
        Self::check_funds(wallet, symbol, side, qty, limit_price.unwrap_or(market_price))?;

        let order_id = Uuid::new_v4().to_string();
        let order = PaperOrder {
            api_key: credentials.api_key.clone(),
            symbol: symbol.to_string(),
            side,
            qty,
            limit_price,
            state: OrderState::New,
            filled_price: 0.0,
            fee: 0.0,
        };
        info!(
            "Paper {} {} {} @ {}",
            side.as_str(),
            qty,
            symbol,
            limit_price.map_or("market".to_string(), |p| p.to_string())
        );
        book.orders.insert(order_id.clone(), order);
        if limit_price.is_none() {
            self.try_fill(&mut book, &order_id, market_price);
        }
        Ok(order_id)
    }

    /// Fill a resting order if the market crossed it and the wallet covers it
    fn try_fill(&self, book: &mut Book, order_id: &str, market_price: f64) {
        let Some(order) = book.orders.get(order_id).cloned() else {
            return;
        };
        if order.state != OrderState::New || !order.crosses(market_price) {
            return;
        }
        let price = order.limit_price.unwrap_or(market_price);
        let fee_rate = self.fee_rate;

        let wallet = self.wallet_mut(book, &order.api_key);
        let (state, fee) = match Self::check_funds(wallet, &order.symbol, order.side, order.qty, price) {
            Err(e) => {
                info!("Paper order {} rejected at fill: {}", order_id, e);
                (OrderState::Rejected, 0.0)
            }
            Ok(()) => match order.side {
                OrderSide::Buy => {
                    let fee = order.qty * fee_rate;
                    wallet.cash -= order.qty * price;
                    *wallet.holdings.entry(order.symbol.clone()).or_insert(0.0) += order.qty - fee;
                    (OrderState::Filled, fee)
                }
                OrderSide::Sell => {
                    let fee = order.qty * price * fee_rate;
                    let held = wallet.holdings.entry(order.symbol.clone()).or_insert(0.0);
                    *held = (*held - order.qty).max(0.0);
                    wallet.cash += order.qty * price - fee;
                    (OrderState::Filled, fee)
                }
            },
        };

        if let Some(stored) = book.orders.get_mut(order_id) {
            stored.state = state;
            if state == OrderState::Filled {
                stored.filled_price = price;
                stored.fee = fee;
                debug!("Paper order {} filled {} @ {} fee {}", order_id, stored.qty, price, fee);
            }
        }
    }
}

#[async_trait]
impl<P: PriceSource> ExchangeGateway for PaperExchange<P> {
    async fn get_price(&self, symbol: &str) -> EngineResult<f64> {
        self.prices.last_price(symbol).await
    }

    async fn get_equity(&self, credentials: &Credentials) -> EngineResult<f64> {
        let wallet = self.wallet(credentials).await;
        let mut equity = wallet.cash;
        for (symbol, qty) in &wallet.holdings {
            if *qty > BALANCE_EPSILON {
                equity += qty * self.prices.last_price(symbol).await?;
            }
        }
        Ok(equity)
    }

    async fn place_limit_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
    ) -> EngineResult<OrderId> {
        self.submit(credentials, symbol, side, qty, Some(price)).await
    }

    async fn place_market_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
    ) -> EngineResult<OrderId> {
        self.submit(credentials, symbol, side, qty, None).await
    }

    async fn cancel_order(&self, credentials: &Credentials, order_id: &str, _symbol: &str) -> EngineResult<bool> {
        let mut book = self.book.lock().await;
        match book.orders.get_mut(order_id) {
            Some(order) if order.api_key == credentials.api_key && order.state == OrderState::New => {
                order.state = OrderState::Cancelled;
                debug!("Paper order {} cancelled", order_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_order_status(
        &self,
        credentials: &Credentials,
        order_id: &str,
        symbol: &str,
    ) -> EngineResult<Option<OrderReport>> {
        let market_price = self.prices.last_price(symbol).await?;
        let mut book = self.book.lock().await;
        match book.orders.get(order_id) {
            Some(order) if order.api_key == credentials.api_key => {}
            _ => return Ok(None),
        }
        self.try_fill(&mut book, order_id, market_price);
        Ok(book.orders.get(order_id).map(|o| o.report(order_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::FixedPrices;
    use approx::assert_relative_eq;

    const BTC: &str = "BTCUSDT";

    async fn exchange(price: f64) -> PaperExchange<FixedPrices> {
        let prices = FixedPrices::new();
        prices.set_price(BTC, price).await;
        let config = PaperConfig {
            fee_rate: 0.001,
            initial_cash: 1000.0,
            ..PaperConfig::default()
        };
        PaperExchange::new(prices, &config)
    }

    fn creds() -> Credentials {
        Credentials::new("paper-1", "")
    }

    #[tokio::test]
    async fn test_limit_buy_fills_when_price_crosses() {
        let exchange = exchange(100.0).await;
        let order_id = exchange
            .place_limit_order(&creds(), BTC, OrderSide::Buy, 1.0, 98.0)
            .await
            .unwrap();

        let report = exchange.get_order_status(&creds(), &order_id, BTC).await.unwrap().unwrap();
        assert_eq!(report.state, OrderState::New);

        exchange.prices().set_price(BTC, 97.5).await;
        let report = exchange.get_order_status(&creds(), &order_id, BTC).await.unwrap().unwrap();
        assert!(report.is_filled());
        assert_eq!(report.filled_price, 98.0);
        assert_relative_eq!(report.fee, 0.001);

        let wallet = exchange.wallet(&creds()).await;
        assert_relative_eq!(wallet.cash, 902.0);
        assert_relative_eq!(wallet.holding(BTC), 0.999);

        // 902 + 0.999 * 97.5
        assert_relative_eq!(exchange.get_equity(&creds()).await.unwrap(), 999.4025, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_market_sell_pays_fee_in_quote() {
        let exchange = exchange(100.0).await;
        exchange
            .place_market_order(&creds(), BTC, OrderSide::Buy, 2.0)
            .await
            .unwrap();

        exchange.prices().set_price(BTC, 110.0).await;
        let order_id = exchange
            .place_market_order(&creds(), BTC, OrderSide::Sell, 1.998)
            .await
            .unwrap();
        let report = exchange.get_order_status(&creds(), &order_id, BTC).await.unwrap().unwrap();
        assert!(report.is_filled());
        assert_eq!(report.side, OrderSide::Sell);
        assert_relative_eq!(report.fee, 1.998 * 110.0 * 0.001);

        let wallet = exchange.wallet(&creds()).await;
        assert_relative_eq!(wallet.holding(BTC), 0.0, epsilon = 1e-12);
        assert_relative_eq!(wallet.cash, 800.0 + 1.998 * 110.0 * 0.999, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_cancel_only_open_orders() {
        let exchange = exchange(100.0).await;
        let resting = exchange
            .place_limit_order(&creds(), BTC, OrderSide::Buy, 1.0, 90.0)
            .await
            .unwrap();
        assert!(exchange.cancel_order(&creds(), &resting, BTC).await.unwrap());
        assert!(!exchange.cancel_order(&creds(), &resting, BTC).await.unwrap());

        // a cancelled order never fills
        exchange.prices().set_price(BTC, 80.0).await;
        let report = exchange.get_order_status(&creds(), &resting, BTC).await.unwrap().unwrap();
        assert_eq!(report.state, OrderState::Cancelled);

        let filled = exchange
            .place_market_order(&creds(), BTC, OrderSide::Buy, 1.0)
            .await
            .unwrap();
        assert!(!exchange.cancel_order(&creds(), &filled, BTC).await.unwrap());
        assert!(!exchange.cancel_order(&creds(), "unknown", BTC).await.unwrap());
    }

    #[tokio::test]
    async fn test_funds_are_checked() {
        let exchange = exchange(100.0).await;
        let err = exchange
            .place_limit_order(&creds(), BTC, OrderSide::Buy, 20.0, 99.0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Exchange(_)));

        let err = exchange
            .place_limit_order(&creds(), BTC, OrderSide::Sell, 1.0, 120.0)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Exchange(_)));
    }

    #[tokio::test]
    async fn test_wallets_are_isolated() {
        let exchange = exchange(100.0).await;
        let other = Credentials::new("paper-2", "");
        let order_id = exchange
            .place_market_order(&creds(), BTC, OrderSide::Buy, 1.0)
            .await
            .unwrap();

        assert!(exchange.get_order_status(&other, &order_id, BTC).await.unwrap().is_none());
        assert_relative_eq!(exchange.get_equity(&other).await.unwrap(), 1000.0);
        assert!(exchange.get_order_status(&creds(), "unknown", BTC).await.unwrap().is_none());
    }
}
