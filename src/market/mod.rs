//! Paper trading collaborators
//!
//! [`PaperExchange`] implements the engine's `ExchangeGateway` on top of any
//! [`PriceSource`]: live Bybit spot tickers for paper runs, or
//! [`FixedPrices`] in tests.

mod paper;
mod ticker;

pub use paper::{PaperExchange, PaperWallet};
pub use ticker::{BybitTicker, FixedPrices, PriceSource};
