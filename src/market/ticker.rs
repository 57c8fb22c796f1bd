//! Price sources for the paper exchange

use std::collections::HashMap;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;

use crate::engine::{EngineError, EngineResult};

/// Last traded price lookup
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn last_price(&self, symbol: &str) -> EngineResult<f64>;
}

/// Public spot ticker of the Bybit v5 REST API
pub struct BybitTicker {
    base_url: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerResponse {
    ret_code: i64,
    ret_msg: String,
    result: Option<TickerResult>,
}

#[derive(Debug, Deserialize)]
struct TickerResult {
    #[serde(default)]
    list: Vec<TickerEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TickerEntry {
    symbol: String,
    last_price: String,
}

impl BybitTicker {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }
}

fn parse_ticker(symbol: &str, body: TickerResponse) -> EngineResult<f64> {
    if body.ret_code != 0 {
        return Err(EngineError::Exchange(format!(
            "ticker {} rejected: {} ({})",
            symbol, body.ret_msg, body.ret_code
        )));
    }
    let entry = body
        .result
        .and_then(|r| r.list.into_iter().find(|e| e.symbol == symbol))
        .ok_or_else(|| EngineError::Exchange(format!("no ticker for {}", symbol)))?;
    entry
        .last_price
        .parse::<f64>()
        .map_err(|e| EngineError::JsonParse(format!("lastPrice {:?}: {}", entry.last_price, e)))
}

#[async_trait]
impl PriceSource for BybitTicker {
    async fn last_price(&self, symbol: &str) -> EngineResult<f64> {
        let url = format!("{}/v5/market/tickers", self.base_url);
        let body: TickerResponse = self
            .http
            .get(&url)
            .query(&[("category", "spot"), ("symbol", symbol)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let price = parse_ticker(symbol, body)?;
        debug!("{} last price {}", symbol, price);
        Ok(price)
    }
}

/// In-memory prices, set by hand
#[derive(Default)]
pub struct FixedPrices {
    prices: RwLock<HashMap<String, f64>>,
}

impl FixedPrices {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_price(&self, symbol: &str, price: f64) {
        self.prices.write().await.insert(symbol.to_string(), price);
    }
}

#[async_trait]
impl PriceSource for FixedPrices {
    async fn last_price(&self, symbol: &str) -> EngineResult<f64> {
        self.prices
            .read()
            .await
            .get(symbol)
            .copied()
            .ok_or_else(|| EngineError::Exchange(format!("no price for {}", symbol)))
    }
}
