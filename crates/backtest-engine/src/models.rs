use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use strategy_core::DateRange;

// --- Orders and fills ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
    Stop,
    StopLimit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

/// An intended trade, produced by signal translation and consumed by the
/// trade simulator (the only component that moves its status).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    /// Whole shares; always positive.
    pub quantity: u64,
    pub limit_price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub status: OrderStatus,
}

impl Order {
    pub fn market(id: u64, symbol: &str, side: OrderSide, quantity: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id,
            symbol: symbol.to_string(),
            order_type: OrderType::Market,
            side,
            quantity,
            limit_price: None,
            stop_price: None,
            timestamp,
            status: OrderStatus::Pending,
        }
    }
}

/// Direction of the day's open-to-close move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrendDirection {
    Bullish,
    Bearish,
    Sideways,
}

/// Snapshot of market conditions at execution time, embedded in every fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketCondition {
    /// Intraday range over midpoint, e.g. 0.02 = 2%.
    pub volatility: f64,
    pub volume: f64,
    pub bid_ask_spread: Decimal,
    pub trend: TrendDirection,
}

/// Immutable record of a fill. Created once by the simulator, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedTrade {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: u64,
    pub execution_price: Decimal,
    pub commission: Decimal,
    /// Per-share price concession versus the friction-free base price.
    pub slippage: Decimal,
    /// Per-share price move attributed to the order itself.
    pub market_impact: Decimal,
    pub execution_delay_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub market_condition: MarketCondition,
}

impl ExecutedTrade {
    /// Notional value of the fill, before commission.
    pub fn trade_value(&self) -> Decimal {
        self.execution_price * Decimal::from(self.quantity)
    }
}

// --- Portfolio state ---

/// Holdings in a single symbol. Quantity can never go negative; a position
/// is removed from the portfolio when it reaches zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: u64,
    /// Volume-weighted average entry price across all buys.
    pub average_price: Decimal,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
    pub last_updated: NaiveDate,
}

/// Full portfolio snapshot. Transitions are pure: folding a trade in yields
/// a new `Portfolio` value (see [`crate::portfolio::apply_trade`]).
///
/// Invariant: `total_value == cash + Σ position.market_value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Portfolio {
    pub cash: Decimal,
    pub total_value: Decimal,
    pub positions: HashMap<String, Position>,
    pub trades: Vec<ExecutedTrade>,
    pub timestamp: NaiveDate,
}

impl Portfolio {
    pub fn new(initial_capital: Decimal, timestamp: NaiveDate) -> Self {
        Self {
            cash: initial_capital,
            total_value: initial_capital,
            positions: HashMap::new(),
            trades: Vec::new(),
            timestamp,
        }
    }

    /// Combined market value of all open positions.
    pub fn positions_value(&self) -> Decimal {
        self.positions.values().map(|p| p.market_value).sum()
    }

    pub fn held_quantity(&self, symbol: &str) -> u64 {
        self.positions.get(symbol).map(|p| p.quantity).unwrap_or(0)
    }
}

// --- Equity curve and drawdowns ---

/// One day of the equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: NaiveDate,
    pub portfolio_value: Decimal,
    pub cash: Decimal,
    pub positions_value: Decimal,
    /// Decline from the running peak, as a fraction in [0, 1].
    pub drawdown: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityCurve {
    pub points: Vec<EquityPoint>,
    pub start_value: Decimal,
    pub end_value: Decimal,
    pub peak_value: Decimal,
    pub trough_value: Decimal,
}

impl EquityCurve {
    pub fn empty() -> Self {
        Self {
            points: Vec::new(),
            start_value: Decimal::ZERO,
            end_value: Decimal::ZERO,
            peak_value: Decimal::ZERO,
            trough_value: Decimal::ZERO,
        }
    }

    /// Daily simple returns between consecutive points.
    pub fn daily_returns(&self) -> Vec<f64> {
        use rust_decimal::prelude::ToPrimitive;
        self.points
            .windows(2)
            .map(|w| {
                let e0 = w[0].portfolio_value.to_f64().unwrap_or(1.0);
                let e1 = w[1].portfolio_value.to_f64().unwrap_or(1.0);
                if e0 > 0.0 {
                    e1 / e0 - 1.0
                } else {
                    0.0
                }
            })
            .collect()
    }
}

/// One peak-to-recovery episode on the equity curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownPeriod {
    pub start_date: NaiveDate,
    /// Last date inside the period: the recovery date for resolved periods,
    /// the final curve date for an open-ended one.
    pub end_date: NaiveDate,
    pub peak_value: Decimal,
    pub trough_value: Decimal,
    /// (peak - trough) / peak, in [0, 1].
    pub drawdown_percent: f64,
    pub duration_days: i64,
    /// Date the running peak was regained; None while still underwater.
    pub recovery_date: Option<NaiveDate>,
    pub recovery_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrawdownAnalysis {
    pub periods: Vec<DrawdownPeriod>,
    /// Deepest drawdown across all periods, as a fraction.
    pub max_drawdown: f64,
    /// Mean recovery time across resolved periods.
    pub average_recovery_days: Option<f64>,
}

// --- Performance metrics ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReturnMetrics {
    /// (final - initial) / initial.
    pub total_return: f64,
    /// Geometric annualization over 365.25-day years.
    pub annualized_return: f64,
    /// Compounded product of daily returns minus one.
    pub cumulative_return: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    /// Annualized standard deviation of daily returns.
    pub volatility: f64,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,
    pub calmar_ratio: Option<f64>,
    pub max_drawdown: f64,
    /// Trailing 63-day Sharpe series; empty when the curve is shorter than
    /// the window.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rolling_sharpe: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeStatistics {
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Fraction of round trips that closed profitably, 0.0-1.0.
    pub win_rate: f64,
    /// Gross profits over absolute gross losses.
    pub profit_factor: Option<f64>,
    pub average_win: Option<Decimal>,
    pub average_loss: Option<Decimal>,
    pub largest_win: Option<Decimal>,
    pub largest_loss: Option<Decimal>,
}

/// CAPM-style comparison against a benchmark return series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMetrics {
    pub alpha: f64,
    pub beta: f64,
    pub tracking_error: f64,
    pub information_ratio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub returns: ReturnMetrics,
    pub risk: RiskMetrics,
    pub trade_stats: TradeStatistics,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub benchmark: Option<BenchmarkMetrics>,
}

// --- Backtest configuration and result ---

/// Configuration for a single backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub initial_capital: Decimal,
    /// Fraction of cash committed per actionable signal. Default 0.1.
    #[serde(default)]
    pub position_size_fraction: Option<f64>,
    /// Annual risk-free rate for Sharpe/Sortino/alpha. Default 0.02.
    #[serde(default)]
    pub risk_free_rate: Option<f64>,
    #[serde(default)]
    pub simulator: crate::simulator::SimulatorConfig,
    /// Pre-aligned daily benchmark returns for alpha/beta/tracking error.
    #[serde(default)]
    pub benchmark_returns: Option<Vec<f64>>,
}

impl BacktestConfig {
    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }
}

/// Outcome of pre-run strategy validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetadata {
    /// Trading days simulated.
    pub data_days: usize,
    /// Signals received from the strategy, actionable or not.
    pub total_signals: usize,
    /// Orders the simulator rejected (no data, zero size, ...).
    pub rejected_orders: usize,
}

/// Complete artifact of one backtest run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub strategy_name: String,
    pub config: BacktestConfig,
    pub trades: Vec<ExecutedTrade>,
    pub portfolio: Portfolio,
    pub performance: PerformanceMetrics,
    pub equity: EquityCurve,
    pub drawdowns: DrawdownAnalysis,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub duration_days: i64,
    pub warnings: Vec<String>,
    pub metadata: BacktestMetadata,
}

// --- Walk-forward analysis ---

/// Inclusive numeric sweep for one strategy parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParameterRange {
    /// Number of grid points this range contributes.
    pub fn len(&self) -> usize {
        if self.step <= 0.0 || self.max < self.min {
            return 0;
        }
        (((self.max - self.min) / self.step) + 1e-9) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grid value at `index`, clamped to `max` against float creep.
    pub fn value_at(&self, index: usize) -> f64 {
        (self.min + self.step * index as f64).min(self.max)
    }
}

/// Which metric the in-sample grid search maximizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OptimizationMetric {
    SharpeRatio,
    TotalReturn,
    CalmarRatio,
    SortinoRatio,
}

impl OptimizationMetric {
    /// Extract the scored value from a metrics record. Undefined ratios
    /// score negative infinity so they never win the search.
    pub fn score(&self, metrics: &PerformanceMetrics) -> f64 {
        match self {
            OptimizationMetric::SharpeRatio => {
                metrics.risk.sharpe_ratio.unwrap_or(f64::NEG_INFINITY)
            }
            OptimizationMetric::TotalReturn => metrics.returns.total_return,
            OptimizationMetric::CalmarRatio => {
                metrics.risk.calmar_ratio.unwrap_or(f64::NEG_INFINITY)
            }
            OptimizationMetric::SortinoRatio => {
                metrics.risk.sortino_ratio.unwrap_or(f64::NEG_INFINITY)
            }
        }
    }
}

/// Overfitting flags are policy, not truth: the cutoffs are configurable
/// with the conventional defaults.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OverfittingThresholds {
    /// Combined score above which the run is flagged.
    pub max_score: f64,
    /// In-sample minus out-of-sample mean return.
    pub max_return_degradation: f64,
    /// In-sample minus out-of-sample mean Sharpe.
    pub max_sharpe_degradation: f64,
}

impl Default for OverfittingThresholds {
    fn default() -> Self {
        Self {
            max_score: 0.3,
            max_return_degradation: 0.1,
            max_sharpe_degradation: 0.5,
        }
    }
}

/// Configuration for a walk-forward analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardConfig {
    pub base: BacktestConfig,
    /// In-sample window length, in trading days.
    pub in_sample_period: usize,
    /// Out-of-sample window length, in trading days.
    pub out_of_sample_period: usize,
    /// Days the window start advances per iteration.
    pub step_size: usize,
    /// Parameter name -> sweep range for the grid search.
    pub parameter_ranges: BTreeMap<String, ParameterRange>,
    pub optimization_metric: OptimizationMetric,
    #[serde(default)]
    pub thresholds: OverfittingThresholds,
}

/// One rolling window: in-sample optimization plus out-of-sample test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardPeriod {
    pub index: usize,
    pub in_sample: DateRange,
    pub out_of_sample: DateRange,
    /// Winning parameter set from the in-sample grid search.
    pub optimized_parameters: BTreeMap<String, f64>,
    pub in_sample_metrics: PerformanceMetrics,
    pub out_of_sample_metrics: PerformanceMetrics,
}

/// Degradation and consistency diagnostics across walk-forward periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverfittingAnalysis {
    pub return_degradation: f64,
    pub sharpe_degradation: f64,
    pub win_rate_degradation: f64,
    /// Standard deviation of out-of-sample total returns across periods.
    pub return_consistency: f64,
    pub sharpe_consistency: f64,
    pub drawdown_consistency: f64,
    /// Combined score in [0, 1]; higher means more overfitting evidence.
    pub overfitting_score: f64,
    pub is_overfitted: bool,
    /// Mean out-of-sample Sharpe deflated for the number of parameter
    /// combinations tried in-sample.
    pub deflated_sharpe: Option<f64>,
    /// Probability of observing the mean out-of-sample Sharpe by chance
    /// given that many trials.
    pub sharpe_p_value: Option<f64>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParameterTrend {
    Increasing,
    Decreasing,
    Stable,
}

/// Stability of one parameter's optimum across periods.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterStability {
    pub parameter: String,
    pub mean: f64,
    pub std_dev: f64,
    pub coefficient_of_variation: f64,
    pub is_stable: bool,
    pub trend: ParameterTrend,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterStabilityReport {
    pub parameters: Vec<ParameterStability>,
    /// mean(max(0, 1 - CV)) across parameters, in [0, 1].
    pub stability_score: f64,
}

/// Complete artifact of a walk-forward analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalkForwardResult {
    pub strategy_name: String,
    pub periods: Vec<WalkForwardPeriod>,
    pub overfitting: OverfittingAnalysis,
    pub stability: ParameterStabilityReport,
    pub avg_in_sample_return: f64,
    pub avg_out_of_sample_return: f64,
    pub avg_out_of_sample_sharpe: Option<f64>,
    /// Periods that failed and were excluded from aggregation.
    pub skipped_periods: usize,
}
