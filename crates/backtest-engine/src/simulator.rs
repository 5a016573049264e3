use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::US::Eastern;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use strategy_core::MarketData;

use crate::error::EngineError;
use crate::models::{
    ExecutedTrade, MarketCondition, Order, OrderSide, OrderStatus, OrderType, TrendDirection,
};

/// Friction model parameters. Defaults mirror a liquid US-equity book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Commission as a fraction of trade value.
    pub commission_rate: f64,
    /// Per-trade commission floor, in currency.
    pub min_commission: f64,
    /// Baseline slippage rate before volume and volatility terms.
    pub base_slippage: f64,
    /// Square-root market impact coefficient.
    pub impact_coefficient: f64,
    /// Baseline execution latency before scaling.
    pub base_delay_ms: u64,
    /// When true, orders outside US/Eastern 09:30-16:00 weekdays are queued
    /// instead of filled.
    pub enforce_market_hours: bool,
    /// Fills never price below this floor.
    pub min_price: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            commission_rate: 0.001,
            min_commission: 1.0,
            base_slippage: 0.0005,
            impact_coefficient: 0.1,
            base_delay_ms: 100,
            enforce_market_hours: false,
            min_price: 0.01,
        }
    }
}

/// Converts intended orders into realistic fills and owns the queue of
/// orders waiting for the market to open.
pub struct TradeSimulator {
    config: SimulatorConfig,
    pending: Vec<Order>,
}

impl TradeSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            config,
            pending: Vec::new(),
        }
    }

    pub fn pending_orders(&self) -> &[Order] {
        &self.pending
    }

    /// Simulate a fill for `order` against the day's bar for its symbol.
    ///
    /// With market-hours enforcement on and the market closed at the order's
    /// timestamp, the order is queued and [`EngineError::MarketClosed`] is
    /// returned; the caller retries via [`Self::process_queued_orders`] on
    /// the next open.
    pub fn simulate_trade(
        &mut self,
        mut order: Order,
        data: &MarketData,
    ) -> Result<ExecutedTrade, EngineError> {
        if self.config.enforce_market_hours && !is_market_open(order.timestamp) {
            let ts = order.timestamp;
            self.queue_order(order);
            return Err(EngineError::MarketClosed(ts));
        }

        let condition = derive_market_condition(data);
        let base = base_price(&order, data.close);
        let fill = self.fill(&order, data, &condition, base, order.timestamp);
        order.status = OrderStatus::Filled;
        Ok(fill)
    }

    /// Park an order until the next market open.
    pub fn queue_order(&mut self, mut order: Order) {
        order.status = OrderStatus::Pending;
        tracing::debug!(
            symbol = %order.symbol,
            quantity = order.quantity,
            "order queued for next market open"
        );
        self.pending.push(order);
    }

    /// Replay queued orders at the day's opening price. Called once per
    /// simulated day, before new signals are processed.
    ///
    /// Orders whose symbol has no bar today are marked Rejected and dropped.
    /// If the market is not open on `date` at all, the queue is left intact.
    pub fn process_queued_orders(
        &mut self,
        date: NaiveDate,
        day_data: &[MarketData],
    ) -> Vec<ExecutedTrade> {
        if self.pending.is_empty() {
            return Vec::new();
        }

        let open_ts = market_open_instant(date);
        if !is_market_open(open_ts) {
            return Vec::new();
        }

        let mut fills = Vec::new();
        for mut order in std::mem::take(&mut self.pending) {
            let Some(data) = day_data.iter().find(|d| d.symbol == order.symbol) else {
                order.status = OrderStatus::Rejected;
                tracing::warn!(symbol = %order.symbol, %date, "queued order rejected: no market data");
                continue;
            };

            let condition = derive_market_condition(data);
            let base = base_price(&order, data.open);
            let fill = self.fill(&order, data, &condition, base, open_ts);
            order.status = OrderStatus::Filled;
            fills.push(fill);
        }
        fills
    }

    /// Build the executed trade: base price plus half-spread, slippage and
    /// market impact, each signed by order direction.
    fn fill(
        &self,
        order: &Order,
        data: &MarketData,
        condition: &MarketCondition,
        base: Decimal,
        timestamp: DateTime<Utc>,
    ) -> ExecutedTrade {
        let direction = match order.side {
            OrderSide::Buy => Decimal::ONE,
            OrderSide::Sell => -Decimal::ONE,
        };

        let half_spread = condition.bid_ask_spread / Decimal::TWO;

        // Slippage: base rate + volume participation (capped at 1%) + half
        // the day's volatility, applied to the base price.
        let quantity_f = order.quantity as f64;
        let volume_ratio = if data.volume > 0.0 {
            (quantity_f / data.volume).min(0.01)
        } else {
            0.01
        };
        let slippage_rate = self.config.base_slippage + volume_ratio + condition.volatility / 2.0;
        let slippage = base * Decimal::from_f64(slippage_rate).unwrap_or(Decimal::ZERO);

        // Square-root impact: proportional to sqrt(order size / ADV).
        let avg_volume = if data.average_volume > 0.0 {
            data.average_volume
        } else {
            data.volume.max(1.0)
        };
        let impact_fraction = self.config.impact_coefficient * (quantity_f / avg_volume).sqrt();
        let market_impact = data.close * Decimal::from_f64(impact_fraction).unwrap_or(Decimal::ZERO);

        let floor = Decimal::from_f64(self.config.min_price).unwrap_or(Decimal::ONE);
        let execution_price =
            (base + direction * (half_spread + slippage + market_impact)).max(floor);

        let trade_value = execution_price * Decimal::from(order.quantity);
        let commission = self.commission(trade_value);
        let delay = self.execution_delay(order, data, condition);

        ExecutedTrade {
            order_id: order.id,
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            execution_price,
            commission,
            slippage,
            market_impact,
            execution_delay_ms: delay,
            timestamp,
            market_condition: condition.clone(),
        }
    }

    /// `max(min_commission, trade_value * commission_rate)`.
    fn commission(&self, trade_value: Decimal) -> Decimal {
        let rate_based =
            trade_value * Decimal::from_f64(self.config.commission_rate).unwrap_or(Decimal::ZERO);
        let floor = Decimal::from_f64(self.config.min_commission).unwrap_or(Decimal::ONE);
        rate_based.max(floor)
    }

    /// Latency model: base delay scaled by order-size ratio, volatility and
    /// order type (market orders jump the book), clamped to [50ms, 5000ms].
    fn execution_delay(&self, order: &Order, data: &MarketData, condition: &MarketCondition) -> u64 {
        let avg_volume = data.average_volume.max(1.0);
        let size_ratio = order.quantity as f64 / avg_volume;
        let type_factor = match order.order_type {
            OrderType::Market => 0.5,
            _ => 1.0,
        };
        let delay = self.config.base_delay_ms as f64
            * (1.0 + size_ratio * 100.0)
            * (1.0 + condition.volatility * 10.0)
            * type_factor;
        (delay as u64).clamp(50, 5_000)
    }
}

/// Choose the friction-free starting price: the reference price, or the
/// favorable side of a limit.
fn base_price(order: &Order, reference: Decimal) -> Decimal {
    match (order.order_type, order.limit_price, order.side) {
        (OrderType::Limit | OrderType::StopLimit, Some(limit), OrderSide::Buy) => {
            reference.min(limit)
        }
        (OrderType::Limit | OrderType::StopLimit, Some(limit), OrderSide::Sell) => {
            reference.max(limit)
        }
        _ => reference,
    }
}

/// Derive the market-condition snapshot embedded in every fill.
pub fn derive_market_condition(data: &MarketData) -> MarketCondition {
    let midpoint = data.midpoint();
    let volatility = if midpoint > Decimal::ZERO {
        ((data.high - data.low) / midpoint).to_f64().unwrap_or(0.0)
    } else {
        0.0
    };

    // Spread widens with volatility and with volume scarcity versus the
    // trailing average.
    let scarcity = if data.volume > 0.0 {
        (data.average_volume / data.volume).min(10.0)
    } else {
        10.0
    };
    let spread_rate = 0.001 + 0.1 * volatility + 0.0005 * scarcity;
    let bid_ask_spread = data.close * Decimal::from_f64(spread_rate).unwrap_or(Decimal::ZERO);

    let trend = if data.open > Decimal::ZERO {
        let change = ((data.close - data.open) / data.open)
            .to_f64()
            .unwrap_or(0.0);
        if change > 0.01 {
            TrendDirection::Bullish
        } else if change < -0.01 {
            TrendDirection::Bearish
        } else {
            TrendDirection::Sideways
        }
    } else {
        TrendDirection::Sideways
    };

    MarketCondition {
        volatility,
        volume: data.volume,
        bid_ask_spread,
        trend,
    }
}

/// Regular US equity session: weekdays 09:30-16:00 Eastern.
pub fn is_market_open(timestamp: DateTime<Utc>) -> bool {
    let local = timestamp.with_timezone(&Eastern);
    if matches!(local.weekday(), Weekday::Sat | Weekday::Sun) {
        return false;
    }
    let minutes = local.hour() * 60 + local.minute();
    (9 * 60 + 30..16 * 60).contains(&minutes)
}

/// 09:30 Eastern on `date`, as a UTC instant.
pub fn market_open_instant(date: NaiveDate) -> DateTime<Utc> {
    Eastern
        .with_ymd_and_hms(date.year(), date.month(), date.day(), 9, 30, 0)
        .single()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&date.and_hms_opt(14, 30, 0).unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bar(open: f64, high: f64, low: f64, close: f64, volume: f64) -> MarketData {
        MarketData {
            symbol: "AAPL".to_string(),
            date: NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            open: Decimal::from_f64(open).unwrap(),
            high: Decimal::from_f64(high).unwrap(),
            low: Decimal::from_f64(low).unwrap(),
            close: Decimal::from_f64(close).unwrap(),
            volume,
            average_volume: volume,
        }
    }

    fn market_order(side: OrderSide, quantity: u64) -> Order {
        // Wednesday 2024-01-03, 10:00 Eastern = 15:00 UTC.
        let ts = Utc.with_ymd_and_hms(2024, 1, 3, 15, 0, 0).unwrap();
        Order::market(1, "AAPL", side, quantity, ts)
    }

    #[test]
    fn buys_fill_above_and_sells_below_the_close() {
        let data = bar(100.0, 102.0, 98.0, 100.0, 1_000_000.0);
        let mut sim = TradeSimulator::new(SimulatorConfig::default());

        let buy = sim
            .simulate_trade(market_order(OrderSide::Buy, 100), &data)
            .unwrap();
        let sell = sim
            .simulate_trade(market_order(OrderSide::Sell, 100), &data)
            .unwrap();

        assert!(buy.execution_price > data.close);
        assert!(sell.execution_price < data.close);
    }

    #[test]
    fn commission_never_drops_below_the_floor() {
        let data = bar(10.0, 10.1, 9.9, 10.0, 1_000_000.0);
        let mut sim = TradeSimulator::new(SimulatorConfig::default());

        // One share at ~$10: rate-based commission would be about a cent.
        let trade = sim
            .simulate_trade(market_order(OrderSide::Buy, 1), &data)
            .unwrap();
        assert!(trade.commission >= dec!(1.0));
    }

    #[test]
    fn volatility_and_trend_derivation() {
        let cond = derive_market_condition(&bar(100.0, 105.0, 95.0, 103.0, 1_000_000.0));
        // (105 - 95) / 100 = 10% range over midpoint.
        assert!((cond.volatility - 0.10).abs() < 1e-9);
        assert_eq!(cond.trend, TrendDirection::Bullish);

        let flat = derive_market_condition(&bar(100.0, 100.5, 99.5, 100.2, 1_000_000.0));
        assert_eq!(flat.trend, TrendDirection::Sideways);

        let down = derive_market_condition(&bar(100.0, 100.5, 96.0, 97.0, 1_000_000.0));
        assert_eq!(down.trend, TrendDirection::Bearish);
    }

    #[test]
    fn limit_orders_start_from_the_favorable_side() {
        let data = bar(100.0, 102.0, 98.0, 100.0, 1_000_000.0);
        let mut sim = TradeSimulator::new(SimulatorConfig::default());

        let mut order = market_order(OrderSide::Buy, 10);
        order.order_type = OrderType::Limit;
        order.limit_price = Some(dec!(95));
        let fill = sim.simulate_trade(order, &data).unwrap();

        // Base is min(close, limit) = 95; frictions stay well under 5%.
        assert!(fill.execution_price < data.close);
    }

    #[test]
    fn execution_delay_is_clamped() {
        let calm = bar(100.0, 100.1, 99.9, 100.0, 1_000_000.0);
        let wild = bar(100.0, 160.0, 60.0, 100.0, 100.0);
        let mut sim = TradeSimulator::new(SimulatorConfig::default());

        let fast = sim
            .simulate_trade(market_order(OrderSide::Buy, 1), &calm)
            .unwrap();
        assert!(fast.execution_delay_ms >= 50);

        let slow = sim
            .simulate_trade(market_order(OrderSide::Buy, 100), &wild)
            .unwrap();
        assert!(slow.execution_delay_ms <= 5_000);
    }

    #[test]
    fn market_closed_orders_queue_and_replay_at_open() {
        let mut config = SimulatorConfig::default();
        config.enforce_market_hours = true;
        let mut sim = TradeSimulator::new(config);

        // Tuesday 2024-01-02, 23:00 UTC = 18:00 Eastern, after the close.
        let after_hours = Utc.with_ymd_and_hms(2024, 1, 2, 23, 0, 0).unwrap();
        let order = Order::market(7, "AAPL", OrderSide::Buy, 50, after_hours);
        let data = bar(100.0, 102.0, 98.0, 100.0, 1_000_000.0);

        let err = sim.simulate_trade(order, &data).unwrap_err();
        assert!(err.is_market_closed());
        assert_eq!(sim.pending_orders().len(), 1);

        // Next trading day: replay at the open.
        let next_day = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let fills = sim.process_queued_orders(next_day, &[bar(104.0, 108.0, 102.0, 106.0, 1_000_000.0)]);
        assert_eq!(fills.len(), 1);
        assert!(sim.pending_orders().is_empty());
        // Fill is anchored at the open (104), not the close (106).
        assert!(fills[0].execution_price < dec!(106));
        assert_eq!(fills[0].order_id, 7);
    }

    #[test]
    fn queued_order_without_data_is_rejected() {
        let mut config = SimulatorConfig::default();
        config.enforce_market_hours = true;
        let mut sim = TradeSimulator::new(config);

        let after_hours = Utc.with_ymd_and_hms(2024, 1, 2, 23, 0, 0).unwrap();
        sim.queue_order(Order::market(9, "MSFT", OrderSide::Buy, 10, after_hours));

        let next_day = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
        let fills = sim.process_queued_orders(next_day, &[bar(100.0, 101.0, 99.0, 100.5, 1_000.0)]);
        assert!(fills.is_empty());
        assert!(sim.pending_orders().is_empty());
    }

    #[test]
    fn weekend_keeps_the_queue_intact() {
        let mut config = SimulatorConfig::default();
        config.enforce_market_hours = true;
        let mut sim = TradeSimulator::new(config);

        let ts = Utc.with_ymd_and_hms(2024, 1, 5, 23, 0, 0).unwrap();
        sim.queue_order(Order::market(3, "AAPL", OrderSide::Buy, 10, ts));

        // Saturday: nothing fills, nothing is dropped.
        let saturday = NaiveDate::from_ymd_opt(2024, 1, 6).unwrap();
        let fills = sim.process_queued_orders(saturday, &[bar(100.0, 101.0, 99.0, 100.5, 1_000.0)]);
        assert!(fills.is_empty());
        assert_eq!(sim.pending_orders().len(), 1);
    }
}
