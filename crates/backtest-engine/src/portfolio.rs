use anyhow::{bail, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;

use strategy_core::MarketData;

use crate::models::{ExecutedTrade, OrderSide, Portfolio, Position};

/// Fold a fill into a portfolio, returning the successor state.
///
/// Pure transition: the input portfolio is never mutated, so snapshots held
/// in the equity history stay valid. Buys accumulate into a volume-weighted
/// average price; sells realize `(price - average) * qty - commission` and a
/// position is dropped when its quantity reaches zero. A sell larger than
/// the held quantity is rejected; short inventory is not modeled.
pub fn apply_trade(portfolio: &Portfolio, trade: &ExecutedTrade) -> Result<Portfolio> {
    if trade.quantity == 0 {
        bail!("trade for {} has zero quantity", trade.symbol);
    }
    let mut next = portfolio.clone();
    let quantity = Decimal::from(trade.quantity);
    let value = trade.execution_price * quantity;
    let date = trade.timestamp.date_naive();

    match trade.side {
        OrderSide::Buy => {
            let cost = value + trade.commission;
            if cost > next.cash {
                bail!(
                    "insufficient cash for {} x{} (cost {}, cash {})",
                    trade.symbol,
                    trade.quantity,
                    cost,
                    next.cash
                );
            }
            next.cash -= cost;

            let position = next
                .positions
                .entry(trade.symbol.clone())
                .or_insert_with(|| Position {
                    symbol: trade.symbol.clone(),
                    quantity: 0,
                    average_price: Decimal::ZERO,
                    market_value: Decimal::ZERO,
                    unrealized_pnl: Decimal::ZERO,
                    realized_pnl: Decimal::ZERO,
                    last_updated: date,
                });

            let held = Decimal::from(position.quantity);
            let new_quantity = position.quantity + trade.quantity;
            position.average_price =
                (position.average_price * held + value) / Decimal::from(new_quantity);
            position.quantity = new_quantity;
            position.market_value = trade.execution_price * Decimal::from(new_quantity);
            position.unrealized_pnl =
                (trade.execution_price - position.average_price) * Decimal::from(new_quantity);
            position.last_updated = date;
        }
        OrderSide::Sell => {
            let held = next.positions.get(&trade.symbol).map(|p| p.quantity).unwrap_or(0);
            if trade.quantity > held {
                bail!(
                    "sell of {} x{} exceeds held quantity {}",
                    trade.symbol,
                    trade.quantity,
                    held
                );
            }
            next.cash += value - trade.commission;

            let position = next
                .positions
                .get_mut(&trade.symbol)
                .expect("held quantity checked above");
            let realized =
                (trade.execution_price - position.average_price) * quantity - trade.commission;
            position.realized_pnl += realized;
            position.quantity -= trade.quantity;
            position.last_updated = date;

            if position.quantity == 0 {
                next.positions.remove(&trade.symbol);
            } else {
                let remaining = Decimal::from(position.quantity);
                position.market_value = trade.execution_price * remaining;
                position.unrealized_pnl =
                    (trade.execution_price - position.average_price) * remaining;
            }
        }
    }

    next.trades.push(trade.clone());
    next.timestamp = date;
    next.total_value = next.cash + next.positions_value();
    Ok(next)
}

/// Revalue every position at the day's closing prices.
///
/// Symbols without a bar today keep their previous mark.
pub fn mark_to_market(portfolio: &Portfolio, day_data: &[MarketData], date: NaiveDate) -> Portfolio {
    let mut next = portfolio.clone();
    for position in next.positions.values_mut() {
        if let Some(bar) = day_data.iter().find(|d| d.symbol == position.symbol) {
            let quantity = Decimal::from(position.quantity);
            position.market_value = bar.close * quantity;
            position.unrealized_pnl = (bar.close - position.average_price) * quantity;
            position.last_updated = date;
        }
    }
    next.timestamp = date;
    next.total_value = next.cash + next.positions_value();
    next
}
