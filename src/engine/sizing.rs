//! Grid sizing arithmetic
//!
//! Pure functions behind the reconciler: the entry-price ratchet, rung
//! placement, cost averaging and the capital-utilization cap. Nothing in
//! here performs I/O, so every rule can be checked in isolation.

use super::types::{InstrumentSpec, Position};

/// Raise the entry anchor to `price` if it is higher; never lowers it.
pub fn ratchet_entry(entry_price: f64, price: f64) -> f64 {
    entry_price.max(price)
}

/// First-rung price drop for a freshly ratcheted anchor
pub fn first_rung_decrement(entry_price: f64, risk_percent: f64) -> f64 {
    entry_price * risk_percent
}

/// Price of the next buy rung below `anchor`
pub fn next_rung_price(anchor: f64, decrement: f64) -> f64 {
    anchor - decrement
}

/// Size of the opening rung: a fixed share of equity converted at `price`
pub fn initial_rung_qty(equity_usdt: f64, equity_fraction: f64, price: f64) -> f64 {
    if price <= 0.0 {
        return 0.0;
    }
    equity_usdt * equity_fraction / price
}

/// Size of a follow-up rung: the average quantity bought per fill so far.
///
/// Returns `None` with no fill history.
pub fn next_rung_qty(quantity_held: f64, fill_count: usize) -> Option<f64> {
    if fill_count == 0 {
        return None;
    }
    Some(quantity_held / fill_count as f64)
}

/// Mean of the cycle's buy fill prices; every rung carries equal weight.
///
/// Returns `None` for an empty history so callers cannot divide by zero.
pub fn weighted_average_cost(fill_prices: &[f64]) -> Option<f64> {
    if fill_prices.is_empty() {
        return None;
    }
    Some(fill_prices.iter().sum::<f64>() / fill_prices.len() as f64)
}

/// Take-profit price for the whole inventory
pub fn take_profit_price(average_cost: f64, risk_percent: f64) -> f64 {
    average_cost * (1.0 + risk_percent)
}

/// Income realized by selling `quantity` at `fill_price` against `average_cost`
pub fn realized_income(fill_price: f64, average_cost: f64, quantity: f64) -> f64 {
    fill_price * quantity - average_cost * quantity
}

/// USDT deployed across positions at their average cost basis
pub fn capital_utilization(positions: &[Position]) -> f64 {
    positions
        .iter()
        .filter_map(|p| p.average_cost().map(|avg| avg * p.quantity_held))
        .sum()
}

/// Whether new buys may be placed given deployed capital and equity
pub fn has_capacity(utilization: f64, equity_usdt: f64, threshold: f64) -> bool {
    utilization <= equity_usdt * threshold
}

/// Round an order to the instrument's declared precision: quantity truncated,
/// price rounded to the nearest tick.
pub fn round_to_instrument(spec: &InstrumentSpec, qty: f64, price: f64) -> (f64, f64) {
    (spec.round_qty(qty), spec.round_price(price))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn holding(symbol: &str, qty: f64, fills: Vec<f64>) -> Position {
        let mut position = Position::new(symbol);
        position.quantity_held = qty;
        position.fill_prices = fills;
        position
    }

    #[test]
    fn test_first_rung_from_ratchet() {
        let entry = ratchet_entry(0.0, 100.0);
        let decrement = first_rung_decrement(entry, 0.02);
        assert_eq!(entry, 100.0);
        assert_relative_eq!(decrement, 2.0);
        assert_relative_eq!(next_rung_price(entry, decrement), 98.0);
    }

    #[test]
    fn test_ratchet_never_lowers() {
        assert_eq!(ratchet_entry(100.0, 95.0), 100.0);
        assert_eq!(ratchet_entry(100.0, 101.5), 101.5);
    }

    #[test]
    fn test_initial_rung_qty() {
        // 1.5% of 1000 USDT at 100 = 0.15
        assert_relative_eq!(initial_rung_qty(1000.0, 0.015, 100.0), 0.15);
        assert_eq!(initial_rung_qty(1000.0, 0.015, 0.0), 0.0);
    }

    #[test]
    fn test_next_rung_qty() {
        assert_eq!(next_rung_qty(0.999, 0), None);
        assert_relative_eq!(next_rung_qty(0.999, 1).unwrap(), 0.999);
        assert_relative_eq!(next_rung_qty(1.998, 2).unwrap(), 0.999);
    }

    #[test]
    fn test_average_and_take_profit() {
        assert_eq!(weighted_average_cost(&[]), None);
        let avg = weighted_average_cost(&[98.0, 96.0]).unwrap();
        assert_relative_eq!(avg, 97.0);
        assert_relative_eq!(take_profit_price(avg, 0.02), 98.94);
        assert_relative_eq!(take_profit_price(98.0, 0.02), 99.96);
    }

    #[test]
    fn test_realized_income() {
        let income = realized_income(99.96, 97.0, 0.999);
        assert_relative_eq!(income, 2.957_04, epsilon = 1e-9);
    }

    #[test]
    fn test_capacity_threshold() {
        // 96% of equity deployed exceeds the 95% cap
        let positions = vec![holding("BTCUSDT", 9.6, vec![100.0])];
        let utilization = capital_utilization(&positions);
        assert_relative_eq!(utilization, 960.0);
        assert!(!has_capacity(utilization, 1000.0, 0.95));
        assert!(has_capacity(950.0, 1000.0, 0.95));
    }

    #[test]
    fn test_capital_utilization_of_flat_positions_is_zero() {
        let positions = vec![Position::new("BTCUSDT"), Position::new("ETHUSDT")];
        assert_eq!(capital_utilization(&positions), 0.0);
    }

    #[test]
    fn test_round_to_instrument() {
        let spec = InstrumentSpec::new("BTCUSDT", 3, 2, 0.0);
        let (qty, price) = round_to_instrument(&spec, 0.15678, 97.996);
        assert_eq!(qty, 0.156);
        assert_eq!(price, 98.0);
    }

    proptest! {
        #[test]
        fn prop_entry_tracks_running_max(prices in prop::collection::vec(0.01f64..100_000.0, 1..50)) {
            let mut entry = 0.0;
            let mut max_seen: f64 = 0.0;
            for price in prices {
                let next = ratchet_entry(entry, price);
                prop_assert!(next >= entry);
                max_seen = max_seen.max(price);
                entry = next;
                prop_assert_eq!(entry, max_seen);
            }
        }

        #[test]
        fn prop_average_is_chunk_associative(
            fills in prop::collection::vec(0.01f64..100_000.0, 2..40),
            split in 1usize..39,
        ) {
            let split = split.min(fills.len() - 1);
            let (left, right) = fills.split_at(split);
            let whole = weighted_average_cost(&fills).unwrap();
            let combined = (weighted_average_cost(left).unwrap() * left.len() as f64
                + weighted_average_cost(right).unwrap() * right.len() as f64)
                / fills.len() as f64;
            prop_assert!((whole - combined).abs() <= 1e-9 * whole.abs().max(1.0));
        }

        #[test]
        fn prop_utilization_grows_with_quantity(
            price in 0.01f64..100_000.0,
            qty in 0.0001f64..1_000.0,
            extra in 0.0001f64..1_000.0,
        ) {
            let smaller = capital_utilization(&[holding("A", qty, vec![price])]);
            let larger = capital_utilization(&[holding("A", qty + extra, vec![price])]);
            prop_assert!(larger > smaller);
        }

        #[test]
        fn prop_rounding_is_idempotent(
            qty in 0.0f64..1_000_000.0,
            price in 0.0f64..1_000_000.0,
            qty_decimals in 0u32..8,
            price_decimals in 0u32..8,
        ) {
            let spec = InstrumentSpec::new("X", qty_decimals, price_decimals, 0.0);
            let once = round_to_instrument(&spec, qty, price);
            let twice = round_to_instrument(&spec, once.0, once.1);
            prop_assert_eq!(once, twice);
        }
    }
}
