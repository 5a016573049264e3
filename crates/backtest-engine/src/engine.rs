use std::sync::Arc;

use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use strategy_core::{HistoricalDataProvider, Signal, SignalAction, Strategy};

use crate::drawdown::drawdown_analysis;
use crate::error::EngineError;
use crate::metrics::PerformanceCalculator;
use crate::models::{
    BacktestConfig, BacktestMetadata, BacktestResult, Order, OrderSide, Portfolio,
    ValidationResult,
};
use crate::portfolio::{apply_trade, mark_to_market};
use crate::simulator::TradeSimulator;
use crate::sink::ResultsSink;

/// End-to-end backtest orchestration: strategy validation, the sequential
/// day-by-day simulation loop, and result assembly.
///
/// The loop is the one true state machine in the system: portfolio state on
/// day N depends on day N-1, so days are never reordered. Individual day or
/// trade failures become warnings on the result; they never halt the run.
pub struct BacktestEngine {
    sink: Option<Arc<dyn ResultsSink>>,
}

impl Default for BacktestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BacktestEngine {
    pub fn new() -> Self {
        Self { sink: None }
    }

    /// Attach a best-effort results sink. Persistence failures are logged
    /// and swallowed; they never fail a backtest.
    pub fn with_sink(mut self, sink: Arc<dyn ResultsSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Check a strategy before any simulation happens.
    ///
    /// Out-of-range stop-loss/take-profit are warnings, not errors.
    pub fn validate_strategy(strategy: &dyn Strategy) -> ValidationResult {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        if !strategy.validate() {
            errors.push("strategy validate() returned false: no analyze capability".to_string());
        }

        let config = strategy.config();
        if !(config.max_position_size > 0.0 && config.max_position_size <= 1.0) {
            errors.push(format!(
                "max_position_size must be in (0, 1], got {}",
                config.max_position_size
            ));
        }
        if config.lookback_period == 0 {
            errors.push("lookback_period must be greater than zero".to_string());
        }
        if let Some(stop_loss) = config.stop_loss_percent {
            if !(0.0..=1.0).contains(&stop_loss) {
                warnings.push(format!("stop_loss_percent {} outside (0, 1)", stop_loss));
            }
        }
        if let Some(take_profit) = config.take_profit_percent {
            if !(0.0..=1.0).contains(&take_profit) {
                warnings.push(format!("take_profit_percent {} outside (0, 1)", take_profit));
            }
        }

        ValidationResult {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Run a full backtest of `strategy` over the configured date range.
    pub async fn run_backtest(
        &self,
        strategy: &dyn Strategy,
        provider: &dyn HistoricalDataProvider,
        config: &BacktestConfig,
    ) -> Result<BacktestResult, EngineError> {
        // 1. Fail fast on a misconfigured strategy.
        let validation = Self::validate_strategy(strategy);
        if !validation.is_valid {
            return Err(EngineError::ValidationFailed(validation));
        }
        let mut warnings = validation.warnings;

        // 2. Load and sanity-check the data.
        let data = provider
            .load_historical_data(&config.symbols, &config.range())
            .await?;
        if data.is_empty() {
            return Err(EngineError::NoData {
                symbols: config.symbols.clone(),
                start: config.start_date,
                end: config.end_date,
            });
        }
        let report = provider.validate_historical_data(&data);
        for issue in report.issues {
            warnings.push(format!("data quality: {}", issue));
        }

        let position_fraction = config.position_size_fraction.unwrap_or(0.1);
        let calculator = PerformanceCalculator::new(config.risk_free_rate.unwrap_or(0.02));
        let mut simulator = TradeSimulator::new(config.simulator);
        let mut portfolio = Portfolio::new(config.initial_capital, config.start_date);
        let mut history: Vec<Portfolio> = Vec::with_capacity(data.len());
        let mut next_order_id: u64 = 1;
        let mut total_signals = 0usize;
        let mut rejected_orders = 0usize;

        tracing::debug!(
            strategy = strategy.name(),
            days = data.len(),
            symbols = ?config.symbols,
            "starting backtest"
        );

        for (date, day_data) in &data {
            // 3. Orders queued from a prior day execute first, at the open.
            for fill in simulator.process_queued_orders(*date, day_data) {
                match apply_trade(&portfolio, &fill) {
                    Ok(next) => portfolio = next,
                    Err(e) => warnings.push(format!("{}: queued {} fill dropped: {}", date, fill.symbol, e)),
                }
            }

            // 4. Ask the strategy for today's signals.
            let signals = match strategy.analyze(day_data).await {
                Ok(signals) => signals,
                Err(e) => {
                    tracing::warn!(%date, error = %e, "strategy analysis failed; day skipped");
                    warnings.push(format!("{}: strategy analysis failed: {}", date, e));
                    Vec::new()
                }
            };
            total_signals += signals.len();

            // 5. Translate actionable signals into orders and simulate them.
            for signal in signals.iter().filter(|s| s.is_actionable()) {
                let Some(bar) = day_data.iter().find(|d| d.symbol == signal.symbol) else {
                    warnings.push(format!("{}: no market data for signal on {}", date, signal.symbol));
                    continue;
                };

                let Some(order) =
                    build_order(signal, &portfolio, position_fraction, next_order_id)
                else {
                    continue;
                };
                next_order_id += 1;

                match simulator.simulate_trade(order, bar) {
                    Ok(fill) => match apply_trade(&portfolio, &fill) {
                        Ok(next) => portfolio = next,
                        Err(e) => {
                            rejected_orders += 1;
                            warnings.push(format!("{}: {} trade dropped: {}", date, signal.symbol, e));
                        }
                    },
                    Err(e) if e.is_market_closed() => {
                        // Queued inside the simulator; retried at next open.
                        tracing::debug!(%date, symbol = %signal.symbol, "market closed, order queued");
                    }
                    Err(e) => {
                        rejected_orders += 1;
                        warnings.push(format!("{}: simulation failed for {}: {}", date, signal.symbol, e));
                    }
                }
            }

            // 6. Mark to market at the close and snapshot into the history.
            portfolio = mark_to_market(&portfolio, day_data, *date);
            history.push(portfolio.clone());
        }

        // 7. Derive the statistics.
        let equity = calculator.generate_equity_curve(&history);
        let performance = calculator.calculate_performance(
            &portfolio.trades,
            &equity,
            config.benchmark_returns.as_deref(),
        );
        let drawdowns = drawdown_analysis(&equity);

        let result = BacktestResult {
            strategy_name: strategy.name().to_string(),
            config: config.clone(),
            trades: portfolio.trades.clone(),
            portfolio,
            performance,
            equity,
            drawdowns,
            start_date: config.start_date,
            end_date: config.end_date,
            duration_days: (config.end_date - config.start_date).num_days(),
            warnings,
            metadata: BacktestMetadata {
                data_days: data.len(),
                total_signals,
                rejected_orders,
            },
        };

        // 8. Best-effort persistence; never fails the run.
        if let Some(sink) = &self.sink {
            if let Err(e) = sink.store_backtest_result(&result).await {
                tracing::warn!(error = %e, "failed to persist backtest result");
            }
            if let Err(e) = sink
                .store_performance_metrics(&result.strategy_name, &result.performance)
                .await
            {
                tracing::warn!(error = %e, "failed to persist performance metrics");
            }
        }

        Ok(result)
    }
}

/// Size an order for a signal: `floor(cash * fraction / price)` shares, with
/// sells clamped to the held quantity. Returns None when nothing tradeable
/// remains (zero quantity, non-positive price).
fn build_order(
    signal: &Signal,
    portfolio: &Portfolio,
    default_fraction: f64,
    order_id: u64,
) -> Option<Order> {
    if signal.price <= Decimal::ZERO {
        return None;
    }
    let fraction = signal.size.filter(|s| *s > 0.0).unwrap_or(default_fraction);
    let budget = portfolio.cash * Decimal::from_f64(fraction)?;
    let mut quantity = (budget / signal.price).floor().to_u64().unwrap_or(0);

    let side = match signal.action {
        SignalAction::Buy => OrderSide::Buy,
        SignalAction::Sell => OrderSide::Sell,
        SignalAction::Hold => return None,
    };
    if side == OrderSide::Sell {
        quantity = quantity.min(portfolio.held_quantity(&signal.symbol));
    }
    if quantity == 0 {
        return None;
    }

    Some(Order::market(
        order_id,
        &signal.symbol,
        side,
        quantity,
        signal.timestamp,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    use strategy_core::{MarketData, StrategyConfig, StrategyConfigPatch};

    struct FixedConfigStrategy {
        config: StrategyConfig,
        valid: bool,
    }

    #[async_trait]
    impl Strategy for FixedConfigStrategy {
        fn name(&self) -> &str {
            "fixed"
        }
        fn validate(&self) -> bool {
            self.valid
        }
        async fn analyze(&self, _data: &[MarketData]) -> anyhow::Result<Vec<Signal>> {
            Ok(Vec::new())
        }
        fn config(&self) -> StrategyConfig {
            self.config.clone()
        }
        fn update_config(&self, _patch: StrategyConfigPatch) {}
    }

    #[test]
    fn validation_rejects_bad_position_size_and_lookback() {
        let strategy = FixedConfigStrategy {
            config: StrategyConfig {
                max_position_size: 1.5,
                lookback_period: 0,
                ..StrategyConfig::default()
            },
            valid: true,
        };
        let result = BacktestEngine::validate_strategy(&strategy);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn out_of_range_stops_are_warnings_not_errors() {
        let strategy = FixedConfigStrategy {
            config: StrategyConfig {
                stop_loss_percent: Some(1.5),
                take_profit_percent: Some(-0.2),
                ..StrategyConfig::default()
            },
            valid: true,
        };
        let result = BacktestEngine::validate_strategy(&strategy);
        assert!(result.is_valid);
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn missing_analyze_capability_is_an_error() {
        let strategy = FixedConfigStrategy {
            config: StrategyConfig::default(),
            valid: false,
        };
        let result = BacktestEngine::validate_strategy(&strategy);
        assert!(!result.is_valid);
    }

    #[test]
    fn order_sizing_follows_cash_fraction_and_clamps_sells() {
        let portfolio = Portfolio::new(dec!(100000), chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        let signal = Signal {
            action: SignalAction::Buy,
            symbol: "AAPL".to_string(),
            size: None,
            price: dec!(150),
            timestamp: Utc.with_ymd_and_hms(2024, 1, 3, 15, 0, 0).unwrap(),
            confidence: 0.9,
        };

        // floor(100000 * 0.1 / 150) = 66
        let order = build_order(&signal, &portfolio, 0.1, 1).unwrap();
        assert_eq!(order.quantity, 66);
        assert_eq!(order.side, OrderSide::Buy);

        // Sell with nothing held: no order at all.
        let sell = Signal {
            action: SignalAction::Sell,
            ..signal.clone()
        };
        assert!(build_order(&sell, &portfolio, 0.1, 2).is_none());
    }
}
