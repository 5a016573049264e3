use std::collections::HashMap;

use rayon::prelude::*;
use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::models::{
    BenchmarkMetrics, EquityCurve, EquityPoint, ExecutedTrade, OrderSide, PerformanceMetrics,
    Portfolio, ReturnMetrics, RiskMetrics, TradeStatistics,
};

/// Trading days per year, the annualization base for daily series.
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

/// Rolling Sharpe window, roughly one quarter.
const ROLLING_SHARPE_WINDOW: usize = 63;

/// Pure statistics over a trade history and an equity curve.
///
/// Identical inputs always produce identical output; the only state carried
/// is the annual risk-free rate used for excess returns.
#[derive(Debug, Clone, Copy)]
pub struct PerformanceCalculator {
    risk_free_rate: f64,
}

impl Default for PerformanceCalculator {
    fn default() -> Self {
        Self {
            risk_free_rate: 0.02,
        }
    }
}

impl PerformanceCalculator {
    pub fn new(risk_free_rate: f64) -> Self {
        Self { risk_free_rate }
    }

    /// Build the equity curve from a chronological portfolio history,
    /// computing running-peak drawdown in a single left-to-right pass.
    pub fn generate_equity_curve(&self, history: &[Portfolio]) -> EquityCurve {
        if history.is_empty() {
            return EquityCurve::empty();
        }

        let mut points = Vec::with_capacity(history.len());
        let mut peak = history[0].total_value;
        let mut trough = history[0].total_value;

        for snapshot in history {
            let value = snapshot.total_value;
            if value > peak {
                peak = value;
            }
            if value < trough {
                trough = value;
            }
            let drawdown = if peak > Decimal::ZERO {
                ((peak - value) / peak).to_f64().unwrap_or(0.0)
            } else {
                0.0
            };
            points.push(EquityPoint {
                timestamp: snapshot.timestamp,
                portfolio_value: value,
                cash: snapshot.cash,
                positions_value: snapshot.positions_value(),
                drawdown,
            });
        }

        EquityCurve {
            start_value: history[0].total_value,
            end_value: history[history.len() - 1].total_value,
            peak_value: peak,
            trough_value: trough,
            points,
        }
    }

    /// Total, annualized and compounded returns over the curve.
    pub fn return_metrics(&self, curve: &EquityCurve) -> ReturnMetrics {
        let initial = curve.start_value.to_f64().unwrap_or(0.0);
        let final_value = curve.end_value.to_f64().unwrap_or(0.0);

        let total_return = if initial > 0.0 {
            (final_value - initial) / initial
        } else {
            0.0
        };

        let days = curve
            .points
            .last()
            .zip(curve.points.first())
            .map(|(last, first)| (last.timestamp - first.timestamp).num_days())
            .unwrap_or(0);
        let annualized_return = if days > 0 && 1.0 + total_return > 0.0 {
            (1.0 + total_return).powf(365.25 / days as f64) - 1.0
        } else {
            0.0
        };

        let cumulative_return = curve
            .daily_returns()
            .iter()
            .fold(1.0, |acc, r| acc * (1.0 + r))
            - 1.0;

        ReturnMetrics {
            total_return,
            annualized_return,
            cumulative_return,
        }
    }

    /// Volatility, Sharpe, Sortino and Calmar from the daily return series.
    pub fn risk_metrics(&self, curve: &EquityCurve, annualized_return: f64) -> RiskMetrics {
        let returns = curve.daily_returns();
        let max_drawdown = curve
            .points
            .iter()
            .map(|p| p.drawdown)
            .fold(0.0_f64, f64::max);

        if returns.len() < 2 {
            return RiskMetrics {
                volatility: 0.0,
                sharpe_ratio: None,
                sortino_ratio: None,
                calmar_ratio: None,
                max_drawdown,
                rolling_sharpe: Vec::new(),
            };
        }

        let rf_daily = self.risk_free_rate / TRADING_DAYS_PER_YEAR;
        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        // Sample standard deviation (Bessel's correction).
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let volatility = variance.sqrt() * TRADING_DAYS_PER_YEAR.sqrt();

        let annualized_excess = (mean - rf_daily) * TRADING_DAYS_PER_YEAR;
        let sharpe_ratio = if volatility > 0.0 {
            Some(annualized_excess / volatility)
        } else {
            None
        };

        // Sortino divides the same numerator by downside deviation only.
        let downside: Vec<f64> = returns.iter().copied().filter(|r| *r < 0.0).collect();
        let sortino_ratio = if downside.is_empty() {
            None
        } else {
            let downside_dev = (downside.iter().map(|r| r.powi(2)).sum::<f64>()
                / downside.len() as f64)
                .sqrt()
                * TRADING_DAYS_PER_YEAR.sqrt();
            if downside_dev > 0.0 {
                Some(annualized_excess / downside_dev)
            } else {
                None
            }
        };

        let calmar_ratio = if max_drawdown > 0.0 {
            Some(annualized_return / max_drawdown)
        } else {
            None
        };

        RiskMetrics {
            volatility,
            sharpe_ratio,
            sortino_ratio,
            calmar_ratio,
            max_drawdown,
            rolling_sharpe: self.rolling_sharpe(&returns, ROLLING_SHARPE_WINDOW),
        }
    }

    /// Trailing-window Sharpe over the return series, windows in parallel.
    fn rolling_sharpe(&self, returns: &[f64], window: usize) -> Vec<f64> {
        if returns.len() < window {
            return Vec::new();
        }
        let rf_daily = self.risk_free_rate / TRADING_DAYS_PER_YEAR;
        let indices: Vec<usize> = (window..=returns.len()).collect();
        indices
            .par_iter()
            .map(|&i| {
                let slice = &returns[i - window..i];
                let n = slice.len() as f64;
                let mean = slice.iter().sum::<f64>() / n;
                let var = slice.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0).max(1.0);
                let std = var.sqrt();
                if std > 1e-10 {
                    ((mean - rf_daily) / std) * TRADING_DAYS_PER_YEAR.sqrt()
                } else {
                    0.0
                }
            })
            .collect()
    }

    /// Round-trip trade statistics.
    ///
    /// P&L samples are reconstructed by replaying fills per symbol against a
    /// running (quantity, average price): buys update the volume-weighted
    /// average, each sell realizes against it. A sell exceeding the held
    /// quantity realizes only the held part; the excess is ignored.
    pub fn trade_statistics(&self, trades: &[ExecutedTrade]) -> TradeStatistics {
        let mut open: HashMap<&str, (u64, Decimal)> = HashMap::new();
        let mut samples: Vec<Decimal> = Vec::new();

        for trade in trades {
            let quantity = Decimal::from(trade.quantity);
            match trade.side {
                OrderSide::Buy => {
                    let (held, average) = open.entry(trade.symbol.as_str()).or_insert((0, Decimal::ZERO));
                    let held_dec = Decimal::from(*held);
                    let new_quantity = *held + trade.quantity;
                    *average = (*average * held_dec + trade.execution_price * quantity)
                        / Decimal::from(new_quantity);
                    *held = new_quantity;
                }
                OrderSide::Sell => {
                    if let Some((held, average)) = open.get_mut(trade.symbol.as_str()) {
                        if *held == 0 {
                            continue;
                        }
                        let matched = trade.quantity.min(*held);
                        let pnl = (trade.execution_price - *average) * Decimal::from(matched)
                            - trade.commission;
                        samples.push(pnl);
                        *held -= matched;
                    }
                }
            }
        }

        let total_trades = samples.len() as u32;
        let wins: Vec<Decimal> = samples.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
        let losses: Vec<Decimal> = samples.iter().copied().filter(|p| *p < Decimal::ZERO).collect();
        let winning_trades = wins.len() as u32;
        let losing_trades = losses.len() as u32;

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|p| p.abs()).sum();

        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };
        let profit_factor = if gross_loss > Decimal::ZERO {
            Some((gross_profit / gross_loss).to_f64().unwrap_or(0.0))
        } else {
            None
        };

        TradeStatistics {
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            profit_factor,
            average_win: (!wins.is_empty()).then(|| gross_profit / Decimal::from(wins.len())),
            average_loss: (!losses.is_empty()).then(|| gross_loss / Decimal::from(losses.len())),
            largest_win: wins.iter().copied().max(),
            largest_loss: losses.iter().copied().min(),
        }
    }

    /// CAPM-style comparison against a benchmark's daily returns.
    ///
    /// Beta defaults to 1.0 when the series lengths mismatch or benchmark
    /// variance is ~0; returns None when there is too little overlap.
    pub fn benchmark_metrics(
        &self,
        portfolio_returns: &[f64],
        benchmark_returns: &[f64],
        annualized_return: f64,
    ) -> Option<BenchmarkMetrics> {
        let n = portfolio_returns.len().min(benchmark_returns.len());
        if n < 2 {
            return None;
        }
        let r = &portfolio_returns[..n];
        let b = &benchmark_returns[..n];

        let mean_r = r.iter().sum::<f64>() / n as f64;
        let mean_b = b.iter().sum::<f64>() / n as f64;
        let covariance = r
            .iter()
            .zip(b)
            .map(|(ri, bi)| (ri - mean_r) * (bi - mean_b))
            .sum::<f64>()
            / (n - 1) as f64;
        let variance_b = b.iter().map(|bi| (bi - mean_b).powi(2)).sum::<f64>() / (n - 1) as f64;

        let beta = if portfolio_returns.len() != benchmark_returns.len() || variance_b < 1e-15 {
            1.0
        } else {
            covariance / variance_b
        };

        let benchmark_annualized = mean_b * TRADING_DAYS_PER_YEAR;
        let alpha = annualized_return
            - (self.risk_free_rate + beta * (benchmark_annualized - self.risk_free_rate));

        let diffs: Vec<f64> = r.iter().zip(b).map(|(ri, bi)| ri - bi).collect();
        let mean_diff = diffs.iter().sum::<f64>() / n as f64;
        let tracking_error = (diffs.iter().map(|d| (d - mean_diff).powi(2)).sum::<f64>()
            / (n - 1) as f64)
            .sqrt()
            * TRADING_DAYS_PER_YEAR.sqrt();
        let information_ratio = (tracking_error > 0.0).then(|| alpha / tracking_error);

        Some(BenchmarkMetrics {
            alpha,
            beta,
            tracking_error,
            information_ratio,
        })
    }

    /// Assemble the full metrics record for a run.
    pub fn calculate_performance(
        &self,
        trades: &[ExecutedTrade],
        curve: &EquityCurve,
        benchmark_returns: Option<&[f64]>,
    ) -> PerformanceMetrics {
        let returns = self.return_metrics(curve);
        let risk = self.risk_metrics(curve, returns.annualized_return);
        let trade_stats = self.trade_statistics(trades);
        let benchmark = benchmark_returns.and_then(|bench| {
            self.benchmark_metrics(&curve.daily_returns(), bench, returns.annualized_return)
        });

        PerformanceMetrics {
            returns,
            risk,
            trade_stats,
            benchmark,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone, Utc};
    use rust_decimal_macros::dec;

    use crate::models::{MarketCondition, TrendDirection};

    fn day(n: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(n as u64)
    }

    fn history(values: &[f64]) -> Vec<Portfolio> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                Portfolio::new(Decimal::from_f64(*v).unwrap(), day(i as u32))
            })
            .collect()
    }

    fn fill(side: OrderSide, quantity: u64, price: Decimal, commission: Decimal) -> ExecutedTrade {
        ExecutedTrade {
            order_id: 0,
            symbol: "AAPL".to_string(),
            side,
            quantity,
            execution_price: price,
            commission,
            slippage: Decimal::ZERO,
            market_impact: Decimal::ZERO,
            execution_delay_ms: 100,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 3, 15, 0, 0).unwrap(),
            market_condition: MarketCondition {
                volatility: 0.01,
                volume: 1_000_000.0,
                bid_ask_spread: dec!(0.1),
                trend: TrendDirection::Sideways,
            },
        }
    }

    #[test]
    fn monotonic_curve_has_zero_drawdown() {
        let calc = PerformanceCalculator::default();
        let curve = calc.generate_equity_curve(&history(&[100.0, 101.0, 102.5, 104.0, 110.0]));

        assert!(curve.points.iter().all(|p| p.drawdown == 0.0));
        let risk = calc.risk_metrics(&curve, 0.1);
        assert_eq!(risk.max_drawdown, 0.0);
        assert!(risk.calmar_ratio.is_none());
        assert!(risk.sortino_ratio.is_none());
    }

    #[test]
    fn drawdown_tracks_the_running_peak() {
        let calc = PerformanceCalculator::default();
        let curve = calc.generate_equity_curve(&history(&[100.0, 120.0, 90.0, 126.0]));

        assert_eq!(curve.points[0].drawdown, 0.0);
        assert_eq!(curve.points[1].drawdown, 0.0);
        assert!((curve.points[2].drawdown - 0.25).abs() < 1e-12);
        assert_eq!(curve.points[3].drawdown, 0.0);
        assert_eq!(curve.peak_value, dec!(126));
        assert_eq!(curve.trough_value, dec!(90));
    }

    #[test]
    fn total_and_annualized_returns() {
        let calc = PerformanceCalculator::default();
        // 366 days from 2024-01-01: just over one 365.25-day year.
        let mut values = vec![100_000.0];
        values.extend(std::iter::repeat(100_000.0).take(364));
        values.push(110_000.0);
        let curve = calc.generate_equity_curve(&history(&values));
        let returns = calc.return_metrics(&curve);

        assert!((returns.total_return - 0.10).abs() < 1e-12);
        // 365 elapsed days: (1.1)^(365.25/365) - 1, a touch over 10%.
        assert!(returns.annualized_return > 0.0999);
        assert!(returns.annualized_return < 0.102);
        assert!((returns.cumulative_return - returns.total_return).abs() < 1e-9);
    }

    #[test]
    fn sharpe_is_undefined_on_a_flat_curve() {
        let calc = PerformanceCalculator::default();
        let curve = calc.generate_equity_curve(&history(&[100.0, 100.0, 100.0, 100.0]));
        let risk = calc.risk_metrics(&curve, 0.0);
        assert_eq!(risk.volatility, 0.0);
        assert!(risk.sharpe_ratio.is_none());
    }

    #[test]
    fn trade_statistics_reconstruct_round_trips() {
        let calc = PerformanceCalculator::default();
        let trades = vec![
            fill(OrderSide::Buy, 100, dec!(150), dec!(1)),
            fill(OrderSide::Buy, 100, dec!(160), dec!(1)),
            // Average is now 155; selling 150 realizes (170-155)*150 - 2.
            fill(OrderSide::Sell, 150, dec!(170), dec!(2)),
            // Remaining 50 @ 155 sold at a loss: (150-155)*50 - 1.
            fill(OrderSide::Sell, 50, dec!(150), dec!(1)),
        ];

        let stats = calc.trade_statistics(&trades);
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.winning_trades, 1);
        assert_eq!(stats.losing_trades, 1);
        assert!((stats.win_rate - 0.5).abs() < 1e-12);
        assert_eq!(stats.largest_win, Some(dec!(2248)));
        assert_eq!(stats.largest_loss, Some(dec!(-251)));
        let pf = stats.profit_factor.unwrap();
        assert!((pf - 2248.0 / 251.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_sell_realizes_only_the_held_part() {
        let calc = PerformanceCalculator::default();
        let trades = vec![
            fill(OrderSide::Buy, 50, dec!(100), dec!(1)),
            fill(OrderSide::Sell, 80, dec!(110), dec!(1)),
        ];
        let stats = calc.trade_statistics(&trades);
        assert_eq!(stats.total_trades, 1);
        // (110-100)*50 - 1, not *80.
        assert_eq!(stats.largest_win, Some(dec!(499)));
    }

    #[test]
    fn beta_defaults_to_one_on_length_mismatch() {
        let calc = PerformanceCalculator::default();
        let portfolio = vec![0.01, -0.005, 0.002, 0.007];
        let benchmark = vec![0.008, -0.004, 0.001];
        let metrics = calc
            .benchmark_metrics(&portfolio, &benchmark, 0.1)
            .unwrap();
        assert_eq!(metrics.beta, 1.0);
    }

    #[test]
    fn beta_matches_covariance_over_variance() {
        let calc = PerformanceCalculator::default();
        // Portfolio moves exactly 2x the benchmark.
        let benchmark = vec![0.01, -0.02, 0.015, 0.005, -0.01];
        let portfolio: Vec<f64> = benchmark.iter().map(|r| r * 2.0).collect();
        let metrics = calc
            .benchmark_metrics(&portfolio, &benchmark, 0.2)
            .unwrap();
        assert!((metrics.beta - 2.0).abs() < 1e-9);
        assert!(metrics.tracking_error > 0.0);
    }

    #[test]
    fn calculate_performance_is_idempotent() {
        let calc = PerformanceCalculator::default();
        let trades = vec![
            fill(OrderSide::Buy, 10, dec!(100), dec!(1)),
            fill(OrderSide::Sell, 10, dec!(108), dec!(1)),
        ];
        let curve = calc.generate_equity_curve(&history(&[100.0, 101.0, 99.0, 103.0, 102.0]));

        let first = calc.calculate_performance(&trades, &curve, None);
        let second = calc.calculate_performance(&trades, &curve, None);
        assert_eq!(first, second);
    }

    #[test]
    fn rolling_sharpe_is_empty_for_short_series() {
        let calc = PerformanceCalculator::default();
        let curve = calc.generate_equity_curve(&history(&[100.0; 30]));
        let risk = calc.risk_metrics(&curve, 0.0);
        assert!(risk.rolling_sharpe.is_empty());

        let long: Vec<f64> = (0..80).map(|i| 100.0 + (i % 7) as f64).collect();
        let curve = calc.generate_equity_curve(&history(&long));
        let risk = calc.risk_metrics(&curve, 0.0);
        // 79 returns, 63-day window: 17 rolling points.
        assert_eq!(risk.rolling_sharpe.len(), 17);
    }
}
