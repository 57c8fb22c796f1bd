//! Coin reconciler - one reconciliation step for one (user, symbol) pair
//!
//! A step reads the account, the position and the exchange, decides which
//! transition applies and writes the result back:
//!
//! 1. refresh equity and price, compute the capacity flag
//! 2. ratchet the entry price while flat and re-arm the first rung
//! 3. on a filled buy: record the fill, place the next rung and move the
//!    take-profit sell
//! 4. on a filled sell: book the income, reset to flat and optionally rebuy
//! 5. repair a holding pair that lost its sell or its next rung, including
//!    orders the exchange cancelled or rejected
//!
//! Every failure is returned as a `StepFailure` tagged with the stage and,
//! where one is involved, the order id.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::EngineConfig;

use super::errors::{EngineError, Origin, StepFailure};
use super::gateway::ExchangeGateway;
use super::sizing;
use super::store::{InstrumentCatalog, PositionStore};
use super::types::{
    Account, AccountId, AccountUpdate, Credentials, InstrumentSpec, Message, OrderId, OrderReport, OrderSide,
    Position, PositionUpdate,
};

/// Tunables of the reconciliation rules
#[derive(Debug, Clone, Copy)]
pub struct ReconcilerPolicy {
    /// Share of equity that may be deployed before new buys are suppressed
    pub capacity_threshold: f64,
    /// Share of equity spent on the first rung of a cycle
    pub initial_buy_equity_fraction: f64,
    pub liquidation_poll_interval: Duration,
    pub liquidation_poll_attempts: u32,
}

impl Default for ReconcilerPolicy {
    fn default() -> Self {
        Self {
            capacity_threshold: 0.95,
            initial_buy_equity_fraction: 0.015,
            liquidation_poll_interval: Duration::from_millis(1000),
            liquidation_poll_attempts: 30,
        }
    }
}

impl From<&EngineConfig> for ReconcilerPolicy {
    fn from(config: &EngineConfig) -> Self {
        Self {
            capacity_threshold: config.capacity_threshold,
            initial_buy_equity_fraction: config.initial_buy_equity_fraction,
            liquidation_poll_interval: Duration::from_millis(config.liquidation_poll_interval_ms),
            liquidation_poll_attempts: config.liquidation_poll_attempts,
        }
    }
}

/// Which transition a step took
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do this tick
    Wait,
    /// Entry price raised or first rung re-armed
    Ratcheted,
    Bought,
    Sold,
    /// Missing sell or rung re-placed
    Repaired,
    /// Cycle closed and the account does not rebuy; the worker should stop
    Retire,
}

#[derive(Debug, Clone)]
pub struct StepReport {
    pub outcome: StepOutcome,
    pub message: Option<Message>,
}

impl StepReport {
    fn new(outcome: StepOutcome, message: Option<Message>) -> Self {
        Self { outcome, message }
    }

    fn wait() -> Self {
        Self::new(StepOutcome::Wait, None)
    }
}

/// Log and error context of one pair
#[derive(Debug, Clone, Copy)]
struct Pair<'a> {
    account_id: AccountId,
    symbol: &'a str,
}

impl<'a> Pair<'a> {
    fn at(self, stage: &'static str) -> impl FnOnce(EngineError) -> StepFailure + 'a {
        move |error| StepFailure::new(Origin::new(self.account_id, self.symbol, stage), error)
    }

    fn at_order(self, stage: &'static str, order_id: &str) -> impl FnOnce(EngineError) -> StepFailure + 'a {
        let order_id = order_id.to_string();
        move |error| StepFailure::new(Origin::new(self.account_id, self.symbol, stage).with_order(order_id), error)
    }
}

impl fmt::Display for Pair<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[user={} symbol={}]", self.account_id, self.symbol)
    }
}

/// Everything a step observed before deciding on a transition
struct StepContext<'a> {
    pair: Pair<'a>,
    account: Account,
    position: Position,
    spec: InstrumentSpec,
    price: f64,
    capacity: bool,
}

impl StepContext<'_> {
    fn credentials(&self) -> &Credentials {
        &self.account.credentials
    }
}

pub struct CoinReconciler<G, S, C> {
    gateway: Arc<G>,
    store: Arc<S>,
    catalog: Arc<C>,
    policy: ReconcilerPolicy,
}

impl<G, S, C> CoinReconciler<G, S, C>
where
    G: ExchangeGateway,
    S: PositionStore,
    C: InstrumentCatalog,
{
    pub fn new(gateway: Arc<G>, store: Arc<S>, catalog: Arc<C>, policy: ReconcilerPolicy) -> Self {
        Self {
            gateway,
            store,
            catalog,
            policy,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run one reconciliation step for a pair
    pub async fn step(&self, account_id: AccountId, symbol: &str) -> Result<StepReport, StepFailure> {
        let pair = Pair { account_id, symbol };

        let account = self
            .store
            .load_account(account_id)
            .await
            .map_err(pair.at("load_account"))?;
        let equity = self
            .gateway
            .get_equity(&account.credentials)
            .await
            .map_err(pair.at("get_equity"))?;
        let account = self
            .store
            .update_account(account_id, AccountUpdate::equity(equity))
            .await
            .map_err(pair.at("save_equity"))?;

        let price = self.gateway.get_price(symbol).await.map_err(pair.at("get_price"))?;
        if !price.is_finite() || price <= 0.0 {
            return Err(pair.at("get_price")(EngineError::DataInconsistency(format!(
                "unusable price {}",
                price
            ))));
        }
        let spec = self.catalog.instrument(symbol).map_err(pair.at("instrument"))?;

        let positions = self
            .store
            .list_positions(account_id)
            .await
            .map_err(pair.at("load_positions"))?;
        let utilization = sizing::capital_utilization(&positions);
        let capacity = sizing::has_capacity(utilization, account.equity_usdt, self.policy.capacity_threshold);
        if !capacity {
            debug!(
                "{} capacity exhausted: {:.2} of {:.2} USDT deployed, new buys suppressed",
                pair, utilization, account.equity_usdt
            );
        }
        let position = positions
            .into_iter()
            .find(|p| p.symbol == symbol)
            .ok_or_else(|| {
                pair.at("load_position")(EngineError::PositionNotFound {
                    account_id,
                    symbol: symbol.to_string(),
                })
            })?;

        let mut ctx = StepContext {
            pair,
            account,
            position,
            spec,
            price,
            capacity,
        };

        if ctx.position.is_flat() && (price > ctx.position.entry_price || ctx.position.open_buy_order_id.is_none()) {
            return self.ratchet(&ctx).await;
        }

        let mut void_orders = PositionUpdate::new();
        let mut has_void = false;

        if let Some(buy_id) = &ctx.position.open_buy_order_id {
            match self.order_report(ctx.credentials(), pair, buy_id, "buy_status").await? {
                Some(report) if report.is_filled() => return self.on_buy_fill(&ctx, report).await,
                Some(report) if report.is_void() => {
                    warn!("{} buy {} is {:?} on the exchange, dropping it", pair, buy_id, report.state);
                    void_orders = void_orders.buy_order(None);
                    has_void = true;
                }
                _ => {}
            }
        }

        if let Some(sell_id) = &ctx.position.open_sell_order_id {
            match self.order_report(ctx.credentials(), pair, sell_id, "sell_status").await? {
                Some(report) if report.is_filled() => return self.on_sell_fill(&ctx, report).await,
                Some(report) if report.is_void() => {
                    warn!("{} sell {} is {:?} on the exchange, dropping it", pair, sell_id, report.state);
                    void_orders = void_orders.sell_order(None);
                    has_void = true;
                }
                _ => {}
            }
        }

        if has_void {
            ctx.position = self.save(pair, void_orders, "clear_void_orders").await?;
            if ctx.position.is_flat() {
                return self.ratchet(&ctx).await;
            }
        }

        if !ctx.position.is_flat() {
            if let Some(report) = self.repair(&ctx).await? {
                return Ok(report);
            }
        }

        if has_void {
            return Ok(StepReport::new(StepOutcome::Repaired, None));
        }

        debug!("{} waiting at {}", pair, price);
        Ok(StepReport::wait())
    }

    /// Raise the entry price while flat and re-arm the first rung
    async fn ratchet(&self, ctx: &StepContext<'_>) -> Result<StepReport, StepFailure> {
        let pair = ctx.pair;
        let previous_entry = ctx.position.entry_price;
        let entry = sizing::ratchet_entry(previous_entry, ctx.price);
        let decrement = sizing::first_rung_decrement(entry, ctx.account.risk_percent);

        if let Some(stale) = &ctx.position.open_buy_order_id {
            if !self.cancel(ctx.credentials(), pair, stale, "cancel_stale_buy").await? {
                warn!("{} stale buy {} could not be cancelled, checking for a fill", pair, stale);
                if let Some(report) = self.filled_order(ctx, stale, "stale_buy_status").await? {
                    return self.on_buy_fill(ctx, report).await;
                }
            }
        }

        let buy_id = if ctx.capacity {
            let qty = sizing::initial_rung_qty(
                ctx.account.equity_usdt,
                self.policy.initial_buy_equity_fraction,
                ctx.price,
            );
            self.place_buy(ctx, qty, sizing::next_rung_price(entry, decrement), "ratchet_buy")
                .await?
        } else {
            None
        };

        if entry == previous_entry && buy_id.is_none() && ctx.position.open_buy_order_id.is_none() {
            debug!("{} flat at {}, no rung placed", pair, ctx.price);
            return Ok(StepReport::wait());
        }

        self.save(
            pair,
            PositionUpdate::new().entry(entry, decrement).buy_order(buy_id.clone()),
            "save_ratchet",
        )
        .await?;

        info!(
            "{} entry {} -> {}, decrement {:.8}, buy order {}",
            pair,
            previous_entry,
            entry,
            decrement,
            buy_id.as_deref().unwrap_or("none")
        );
        Ok(StepReport::new(StepOutcome::Ratcheted, None))
    }

    async fn on_buy_fill(&self, ctx: &StepContext<'_>, report: OrderReport) -> Result<StepReport, StepFailure> {
        let pair = ctx.pair;
        let order_id = report.order_id.as_str();
        let net_qty = self.net_buy_qty(ctx, &report)?;
        let fill_price = report.filled_price;

        // the take-profit may have filled while this rung was resting
        let closed = match &ctx.position.open_sell_order_id {
            Some(old_sell) => {
                self.settle_opposite(ctx, old_sell, "cancel_sell", "sell_status")
                    .await?
            }
            None => None,
        };

        let mut update = PositionUpdate::new().buy_order(None).sell_order(None);
        let mut booked = None;
        match &closed {
            Some(sell) => {
                // the sell closed the previous cycle; this fill opens the next one
                let income = self.sell_income(ctx, sell)?;
                self.record_income(ctx, sell, income).await?;
                let decrement = sizing::first_rung_decrement(sell.filled_price, ctx.account.risk_percent);
                update = update
                    .entry(sell.filled_price, decrement)
                    .income(income)
                    .holdings(ctx.spec.round_qty(net_qty), vec![fill_price]);
                booked = Some((sell.filled_price, ctx.position.quantity_held, income));
            }
            None => {
                let mut fills = ctx.position.fill_prices.clone();
                fills.push(fill_price);
                update = update.holdings(ctx.spec.round_qty(ctx.position.quantity_held + net_qty), fills);
            }
        }

        let mut position = self.save(pair, update, "save_buy_fill").await?;
        info!(
            "{} buy {} filled: {} @ {}, holding {}",
            pair, order_id, net_qty, fill_price, position.quantity_held
        );

        if ctx.capacity {
            if let Some(qty) = sizing::next_rung_qty(position.quantity_held, position.fill_prices.len()) {
                let rung_price = sizing::next_rung_price(fill_price, position.decrement);
                if let Some(buy_id) = self.place_buy(ctx, qty, rung_price, "next_rung").await? {
                    position = self
                        .save(pair, PositionUpdate::new().buy_order(Some(buy_id)), "save_next_rung")
                        .await?;
                }
            }
        }

        let sell_id = self.place_take_profit(ctx, &position).await?;
        if sell_id.is_some() {
            position = self
                .save(pair, PositionUpdate::new().sell_order(sell_id), "save_sell")
                .await?;
        }

        // one message per step: a closed cycle outranks the rung that reopened it
        let message = match booked {
            Some((sell_price, sold_qty, income)) => {
                Message::sell(&ctx.account, &position, sell_price, sold_qty, income)
            }
            None => Message::buy(&ctx.account, &position, fill_price, net_qty),
        };
        Ok(StepReport::new(StepOutcome::Bought, Some(message)))
    }

    async fn on_sell_fill(&self, ctx: &StepContext<'_>, report: OrderReport) -> Result<StepReport, StepFailure> {
        let pair = ctx.pair;
        let order_id = report.order_id.as_str();
        let income = self.sell_income(ctx, &report)?;
        let fill_price = report.filled_price;
        let quantity = ctx.position.quantity_held;

        // a rung that filled alongside the sell starts the next cycle
        let rung = match &ctx.position.open_buy_order_id {
            Some(stale) => {
                self.settle_opposite(ctx, stale, "cancel_stale_buy", "stale_buy_status")
                    .await?
            }
            None => None,
        };
        let rung_qty = match &rung {
            Some(rung) => Some(self.net_buy_qty(ctx, rung)?),
            None => None,
        };

        self.record_income(ctx, &report, income).await?;

        let decrement = sizing::first_rung_decrement(fill_price, ctx.account.risk_percent);
        let mut update = PositionUpdate::flat(fill_price, decrement).income(income);
        if let (Some(rung), Some(rung_qty)) = (&rung, rung_qty) {
            update = update.holdings(ctx.spec.round_qty(rung_qty), vec![rung.filled_price]);
        }
        let mut position = self.save(pair, update, "save_sell_fill").await?;
        info!(
            "{} sell {} filled: {} @ {}, income {:.8}",
            pair, order_id, quantity, fill_price, income
        );

        let outcome = if !position.is_flat() {
            info!(
                "{} rung {} filled with the sell, carrying {} into the next cycle",
                pair,
                rung.as_ref().map_or("-", |r| r.order_id.as_str()),
                position.quantity_held
            );
            if let Some(sell_id) = self.place_take_profit(ctx, &position).await? {
                position = self
                    .save(pair, PositionUpdate::new().sell_order(Some(sell_id)), "save_sell")
                    .await?;
            }
            StepOutcome::Sold
        } else if ctx.account.auto_rebuy_after_sell {
            if self.has_capacity_without(ctx).await? {
                let qty = sizing::initial_rung_qty(
                    ctx.account.equity_usdt,
                    self.policy.initial_buy_equity_fraction,
                    fill_price,
                );
                let price = sizing::next_rung_price(fill_price, decrement);
                if let Some(buy_id) = self.place_buy(ctx, qty, price, "rebuy").await? {
                    position = self
                        .save(pair, PositionUpdate::new().buy_order(Some(buy_id)), "save_rebuy")
                        .await?;
                }
            }
            StepOutcome::Sold
        } else {
            info!("{} cycle closed, rebuy disabled, retiring pair", pair);
            StepOutcome::Retire
        };

        let message = Message::sell(&ctx.account, &position, fill_price, quantity, income);
        Ok(StepReport::new(outcome, Some(message)))
    }

    /// Net base quantity a filled buy adds to the holding
    fn net_buy_qty(&self, ctx: &StepContext<'_>, report: &OrderReport) -> Result<f64, StepFailure> {
        let order_id = report.order_id.as_str();
        if report.side != OrderSide::Buy {
            return Err(ctx.pair.at_order("buy_fill", order_id)(EngineError::DataInconsistency(format!(
                "order {} tracked as buy but reported as {}",
                order_id,
                report.side.as_str()
            ))));
        }
        let net_qty = ctx.spec.round_qty(report.filled_qty - report.fee);
        if net_qty <= 0.0 {
            return Err(ctx.pair.at_order("buy_fill", order_id)(EngineError::DataInconsistency(format!(
                "buy {} filled {} with fee {}, nothing left to hold",
                order_id, report.filled_qty, report.fee
            ))));
        }
        Ok(net_qty)
    }

    /// Income of a filled take-profit against the cycle's average cost
    fn sell_income(&self, ctx: &StepContext<'_>, report: &OrderReport) -> Result<f64, StepFailure> {
        let order_id = report.order_id.as_str();
        if report.side != OrderSide::Sell {
            return Err(ctx.pair.at_order("sell_fill", order_id)(EngineError::DataInconsistency(format!(
                "order {} tracked as sell but reported as {}",
                order_id,
                report.side.as_str()
            ))));
        }
        let average_cost = ctx.position.average_cost().ok_or_else(|| {
            ctx.pair.at_order("sell_fill", order_id)(EngineError::DataInconsistency(
                "sell filled with an empty fill history".into(),
            ))
        })?;
        Ok(sizing::realized_income(
            report.filled_price,
            average_cost,
            ctx.position.quantity_held,
        ))
    }

    async fn record_income(&self, ctx: &StepContext<'_>, sell: &OrderReport, income: f64) -> Result<(), StepFailure> {
        self.store
            .record_income(ctx.pair.account_id, ctx.pair.symbol, income, ctx.position.quantity_held)
            .await
            .map_err(ctx.pair.at_order("record_income", &sell.order_id))
    }

    /// Cancel the order on the other side of a fill. Returns its report when
    /// the cancel came too late because it had filled as well.
    async fn settle_opposite(
        &self,
        ctx: &StepContext<'_>,
        order_id: &str,
        cancel_stage: &'static str,
        status_stage: &'static str,
    ) -> Result<Option<OrderReport>, StepFailure> {
        if self.cancel(ctx.credentials(), ctx.pair, order_id, cancel_stage).await? {
            return Ok(None);
        }
        let report = self.filled_order(ctx, order_id, status_stage).await?;
        if report.is_none() {
            warn!("{} order {} was no longer open", ctx.pair, order_id);
        }
        Ok(report)
    }

    /// Re-place a missing take-profit sell or next rung on a holding pair
    async fn repair(&self, ctx: &StepContext<'_>) -> Result<Option<StepReport>, StepFailure> {
        let pair = ctx.pair;
        let mut repaired = false;

        if ctx.position.open_sell_order_id.is_none() {
            if let Some(sell_id) = self.place_take_profit(ctx, &ctx.position).await? {
                warn!("{} holding without a sell order, placed {}", pair, sell_id);
                self.save(pair, PositionUpdate::new().sell_order(Some(sell_id)), "save_repair_sell")
                    .await?;
                repaired = true;
            }
        }

        if ctx.position.open_buy_order_id.is_none() && ctx.capacity {
            let last_fill = ctx.position.last_fill_price();
            let qty = sizing::next_rung_qty(ctx.position.quantity_held, ctx.position.fill_prices.len());
            if let (Some(last_fill), Some(qty)) = (last_fill, qty) {
                let price = sizing::next_rung_price(last_fill, ctx.position.decrement);
                if let Some(buy_id) = self.place_buy(ctx, qty, price, "rearm_rung").await? {
                    info!("{} re-armed next rung {}", pair, buy_id);
                    self.save(pair, PositionUpdate::new().buy_order(Some(buy_id)), "save_repair_buy")
                        .await?;
                    repaired = true;
                }
            }
        }

        Ok(repaired.then(|| StepReport::new(StepOutcome::Repaired, None)))
    }

    /// Cancel both orders, market-sell the holdings, book the income and
    /// reset the pair to a zero-valued flat position.
    ///
    /// An order that filled before its cancel landed is settled as it stands:
    /// a filled take-profit closes the cycle without a market sell, a filled
    /// rung joins the holdings that get sold. Returns one Sell message per
    /// sale booked.
    pub async fn liquidate(&self, account_id: AccountId, symbol: &str) -> Result<Vec<Message>, StepFailure> {
        let pair = Pair { account_id, symbol };
        let account = self
            .store
            .load_account(account_id)
            .await
            .map_err(pair.at("load_account"))?;
        let position = self
            .store
            .load_position(account_id, symbol)
            .await
            .map_err(pair.at("load_position"))?;
        let spec = self.catalog.instrument(symbol).map_err(pair.at("instrument"))?;
        let credentials = &account.credentials;

        let late_buy = match &position.open_buy_order_id {
            Some(buy_id) => self.late_fill(credentials, pair, buy_id, OrderSide::Buy, "liquidate_cancel_buy").await?,
            None => None,
        };
        let late_sell = match &position.open_sell_order_id {
            Some(sell_id) => {
                self.late_fill(credentials, pair, sell_id, OrderSide::Sell, "liquidate_cancel_sell")
                    .await?
            }
            None => None,
        };

        let mut sales = Vec::new();
        let mut quantity = position.quantity_held;
        let mut fills = position.fill_prices.clone();

        if let Some(sell) = &late_sell {
            let average_cost = position.average_cost().ok_or_else(|| {
                pair.at_order("liquidate_sell_fill", &sell.order_id)(EngineError::DataInconsistency(
                    "sell filled with an empty fill history".into(),
                ))
            })?;
            let income = sizing::realized_income(sell.filled_price, average_cost, quantity);
            self.store
                .record_income(account_id, symbol, income, quantity)
                .await
                .map_err(pair.at_order("record_income", &sell.order_id))?;
            info!(
                "{} take-profit {} filled before removal: {} @ {}, income {:.8}",
                pair, sell.order_id, quantity, sell.filled_price, income
            );
            sales.push((sell.filled_price, quantity, income));
            quantity = 0.0;
            fills.clear();
        }

        if let Some(buy) = &late_buy {
            let net_qty = spec.round_qty(buy.filled_qty - buy.fee);
            if net_qty > 0.0 {
                info!("{} rung {} filled before removal, adding {}", pair, buy.order_id, net_qty);
                quantity += net_qty;
                fills.push(buy.filled_price);
            }
        }

        let quantity = spec.round_qty(quantity);
        if quantity <= 0.0 {
            let mut reset = PositionUpdate::flat(0.0, 0.0);
            if let Some((_, _, income)) = sales.last() {
                reset = reset.income(*income);
            }
            let position = self.save(pair, reset, "liquidate_reset").await?;
            if sales.is_empty() {
                info!("{} removed, nothing held", pair);
            }
            return Ok(Self::sale_messages(&account, &position, &sales));
        }

        let holding = self
            .save(
                pair,
                PositionUpdate::new()
                    .holdings(quantity, fills)
                    .buy_order(None)
                    .sell_order(None),
                "liquidate_clear_orders",
            )
            .await?;
        let average_cost = holding.average_cost().ok_or_else(|| {
            pair.at("liquidate")(EngineError::DataInconsistency(
                "holding without fill history".into(),
            ))
        })?;

        let order_id = self
            .gateway
            .place_market_order(credentials, symbol, OrderSide::Sell, quantity)
            .await
            .map_err(pair.at("liquidate_sell"))?;
        info!("{} liquidating {} with market sell {}", pair, quantity, order_id);

        let report = self.await_fill(credentials, pair, &order_id).await?;
        let income = sizing::realized_income(report.filled_price, average_cost, quantity);

        self.store
            .record_income(account_id, symbol, income, quantity)
            .await
            .map_err(pair.at_order("record_income", &order_id))?;
        let position = self
            .save(pair, PositionUpdate::flat(0.0, 0.0).income(income), "liquidate_reset")
            .await?;
        info!(
            "{} liquidated {} @ {}, income {:.8}",
            pair, quantity, report.filled_price, income
        );
        sales.push((report.filled_price, quantity, income));

        Ok(Self::sale_messages(&account, &position, &sales))
    }

    /// Cancel an order being removed; when the cancel is refused, return the
    /// report if the order turns out to have filled on the expected side.
    async fn late_fill(
        &self,
        credentials: &Credentials,
        pair: Pair<'_>,
        order_id: &str,
        side: OrderSide,
        stage: &'static str,
    ) -> Result<Option<OrderReport>, StepFailure> {
        if self.cancel(credentials, pair, order_id, stage).await? {
            return Ok(None);
        }
        let report = self
            .order_report(credentials, pair, order_id, "liquidate_status")
            .await?
            .filter(OrderReport::is_filled);
        match report {
            Some(report) if report.side != side => Err(pair.at_order("liquidate_status", order_id)(
                EngineError::DataInconsistency(format!(
                    "order {} tracked as {} but reported as {}",
                    order_id,
                    side.as_str(),
                    report.side.as_str()
                )),
            )),
            Some(report) => Ok(Some(report)),
            None => {
                warn!("{} order {} was no longer open", pair, order_id);
                Ok(None)
            }
        }
    }

    fn sale_messages(account: &Account, position: &Position, sales: &[(f64, f64, f64)]) -> Vec<Message> {
        sales
            .iter()
            .map(|&(price, quantity, income)| Message::sell(account, position, price, quantity, income))
            .collect()
    }

    async fn await_fill(
        &self,
        credentials: &Credentials,
        pair: Pair<'_>,
        order_id: &OrderId,
    ) -> Result<OrderReport, StepFailure> {
        let attempts = self.policy.liquidation_poll_attempts.max(1);
        for attempt in 1..=attempts {
            let report = self
                .gateway
                .get_order_status(credentials, order_id, pair.symbol)
                .await
                .map_err(pair.at_order("liquidate_status", order_id))?;
            if let Some(report) = report.filter(OrderReport::is_filled) {
                return Ok(report);
            }
            debug!("{} market sell {} not filled yet ({}/{})", pair, order_id, attempt, attempts);
            if attempt < attempts {
                tokio::time::sleep(self.policy.liquidation_poll_interval).await;
            }
        }
        Err(pair.at_order("liquidate_status", order_id)(EngineError::LiquidationTimeout {
            order_id: order_id.clone(),
            attempts,
        }))
    }

    /// Capacity with this pair's just-closed holdings left out
    async fn has_capacity_without(&self, ctx: &StepContext<'_>) -> Result<bool, StepFailure> {
        let others: Vec<Position> = self
            .store
            .list_positions(ctx.pair.account_id)
            .await
            .map_err(ctx.pair.at("load_positions"))?
            .into_iter()
            .filter(|p| p.symbol != ctx.pair.symbol)
            .collect();
        let utilization = sizing::capital_utilization(&others);
        Ok(sizing::has_capacity(
            utilization,
            ctx.account.equity_usdt,
            self.policy.capacity_threshold,
        ))
    }

    async fn filled_order(
        &self,
        ctx: &StepContext<'_>,
        order_id: &str,
        stage: &'static str,
    ) -> Result<Option<OrderReport>, StepFailure> {
        let report = self.order_report(ctx.credentials(), ctx.pair, order_id, stage).await?;
        Ok(report.filter(OrderReport::is_filled))
    }

    async fn order_report(
        &self,
        credentials: &Credentials,
        pair: Pair<'_>,
        order_id: &str,
        stage: &'static str,
    ) -> Result<Option<OrderReport>, StepFailure> {
        self.gateway
            .get_order_status(credentials, order_id, pair.symbol)
            .await
            .map_err(pair.at_order(stage, order_id))
    }

    async fn cancel(
        &self,
        credentials: &Credentials,
        pair: Pair<'_>,
        order_id: &str,
        stage: &'static str,
    ) -> Result<bool, StepFailure> {
        let cancelled = self
            .gateway
            .cancel_order(credentials, order_id, pair.symbol)
            .await
            .map_err(pair.at_order(stage, order_id))?;
        if cancelled {
            debug!("{} cancelled order {}", pair, order_id);
        }
        Ok(cancelled)
    }

    /// Round and place a limit buy; below-minimum orders are skipped
    async fn place_buy(
        &self,
        ctx: &StepContext<'_>,
        qty: f64,
        price: f64,
        stage: &'static str,
    ) -> Result<Option<OrderId>, StepFailure> {
        self.place_limit(ctx, OrderSide::Buy, qty, price, stage).await
    }

    /// Take-profit sell for the whole inventory at average cost plus markup
    async fn place_take_profit(
        &self,
        ctx: &StepContext<'_>,
        position: &Position,
    ) -> Result<Option<OrderId>, StepFailure> {
        let average_cost = position.average_cost().ok_or_else(|| {
            ctx.pair.at("take_profit")(EngineError::DataInconsistency(
                "average cost of an empty fill history".into(),
            ))
        })?;
        let price = sizing::take_profit_price(average_cost, ctx.account.risk_percent);
        self.place_limit(ctx, OrderSide::Sell, position.quantity_held, price, "take_profit")
            .await
    }

    async fn place_limit(
        &self,
        ctx: &StepContext<'_>,
        side: OrderSide,
        qty: f64,
        price: f64,
        stage: &'static str,
    ) -> Result<Option<OrderId>, StepFailure> {
        let pair = ctx.pair;
        let (qty, price) = sizing::round_to_instrument(&ctx.spec, qty, price);
        if !ctx.spec.meets_minimum(qty) || price <= 0.0 {
            warn!(
                "{} {} of {} @ {} below instrument minimum {}, skipped",
                pair,
                side.as_str(),
                ctx.spec.format_qty(qty),
                ctx.spec.format_price(price),
                ctx.spec.min_order_qty
            );
            return Ok(None);
        }

        let order_id = self
            .gateway
            .place_limit_order(ctx.credentials(), pair.symbol, side, qty, price)
            .await
            .map_err(pair.at(stage))?;
        info!(
            "{} placed {} {}: {} @ {}",
            pair,
            side.as_str(),
            order_id,
            ctx.spec.format_qty(qty),
            ctx.spec.format_price(price)
        );
        Ok(Some(order_id))
    }

    async fn save(&self, pair: Pair<'_>, update: PositionUpdate, stage: &'static str) -> Result<Position, StepFailure> {
        self.store
            .save_position(pair.account_id, pair.symbol, update)
            .await
            .map_err(pair.at(stage))
    }
}
