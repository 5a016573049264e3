use std::collections::BTreeMap;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::NaiveDate;

use strategy_core::{
    DataValidationReport, DateRange, HistoricalDataProvider, MarketData, Strategy,
    StrategyConfigPatch,
};

use crate::engine::BacktestEngine;
use crate::error::EngineError;
use crate::models::{
    BacktestConfig, OptimizationMetric, ParameterRange, PerformanceMetrics, WalkForwardConfig,
    WalkForwardPeriod, WalkForwardResult,
};
use crate::overfitting::{analyze_parameter_stability, detect_overfitting};
use crate::param_grid::ParameterGrid;

/// Rolling in-sample optimization plus out-of-sample validation.
///
/// The separation is the whole point: parameters are chosen on the in-sample
/// slice only, then applied unmodified out-of-sample, and only the
/// out-of-sample scores feed the overfitting and stability analysis.
pub struct WalkForwardAnalyzer {
    engine: BacktestEngine,
}

impl Default for WalkForwardAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl WalkForwardAnalyzer {
    pub fn new() -> Self {
        Self {
            engine: BacktestEngine::new(),
        }
    }

    pub fn with_engine(engine: BacktestEngine) -> Self {
        Self { engine }
    }

    /// Run the full walk-forward procedure over the configured data range.
    ///
    /// Periods that fail are logged and skipped; the analysis is fatal only
    /// when no period succeeds at all.
    pub async fn perform_walk_forward(
        &self,
        strategy: &dyn Strategy,
        provider: &dyn HistoricalDataProvider,
        config: &WalkForwardConfig,
    ) -> Result<WalkForwardResult, EngineError> {
        if config.in_sample_period == 0 || config.out_of_sample_period == 0 || config.step_size == 0
        {
            return Err(EngineError::Collaborator(anyhow!(
                "in-sample, out-of-sample and step sizes must all be positive"
            )));
        }

        let data = provider
            .load_historical_data(&config.base.symbols, &config.base.range())
            .await?;
        let dates: Vec<NaiveDate> = data.keys().copied().collect();
        let window = config.in_sample_period + config.out_of_sample_period;
        if dates.len() < window {
            return Err(EngineError::InsufficientData {
                required: window,
                available: dates.len(),
            });
        }

        let starts = window_starts(
            dates.len(),
            config.in_sample_period,
            config.out_of_sample_period,
            config.step_size,
        );
        let grid_size = ParameterGrid::new(&config.parameter_ranges)
            .combination_count()
            .max(1);
        tracing::debug!(
            strategy = strategy.name(),
            windows = starts.len(),
            combinations = grid_size,
            "starting walk-forward analysis"
        );

        let mut periods: Vec<WalkForwardPeriod> = Vec::new();
        let mut skipped_periods = 0usize;
        for (index, start) in starts.into_iter().enumerate() {
            match self
                .run_period(strategy, &data, &dates, start, index, config)
                .await
            {
                Ok(period) => periods.push(period),
                Err(e) => {
                    tracing::warn!(period = index, error = %e, "walk-forward period failed; skipping");
                    skipped_periods += 1;
                }
            }
        }
        if periods.is_empty() {
            return Err(EngineError::NoSuccessfulPeriods);
        }

        let oos_observations = periods.len() * config.out_of_sample_period;
        let overfitting =
            detect_overfitting(&periods, &config.thresholds, grid_size, oos_observations);
        let optimized: Vec<BTreeMap<String, f64>> = periods
            .iter()
            .map(|p| p.optimized_parameters.clone())
            .collect();
        let stability = analyze_parameter_stability(&optimized, &config.parameter_ranges);

        let count = periods.len() as f64;
        let avg_in_sample_return = periods
            .iter()
            .map(|p| p.in_sample_metrics.returns.total_return)
            .sum::<f64>()
            / count;
        let avg_out_of_sample_return = periods
            .iter()
            .map(|p| p.out_of_sample_metrics.returns.total_return)
            .sum::<f64>()
            / count;
        let oos_sharpes: Vec<f64> = periods
            .iter()
            .filter_map(|p| p.out_of_sample_metrics.risk.sharpe_ratio)
            .collect();
        let avg_out_of_sample_sharpe = if oos_sharpes.is_empty() {
            None
        } else {
            Some(oos_sharpes.iter().sum::<f64>() / oos_sharpes.len() as f64)
        };

        Ok(WalkForwardResult {
            strategy_name: strategy.name().to_string(),
            periods,
            overfitting,
            stability,
            avg_in_sample_return,
            avg_out_of_sample_return,
            avg_out_of_sample_sharpe,
            skipped_periods,
        })
    }

    /// One rolling window: optimize in-sample, test out-of-sample.
    async fn run_period(
        &self,
        strategy: &dyn Strategy,
        data: &BTreeMap<NaiveDate, Vec<MarketData>>,
        dates: &[NaiveDate],
        start: usize,
        index: usize,
        config: &WalkForwardConfig,
    ) -> Result<WalkForwardPeriod, EngineError> {
        let in_sample_dates = &dates[start..start + config.in_sample_period];
        let out_of_sample_dates = &dates[start + config.in_sample_period
            ..start + config.in_sample_period + config.out_of_sample_period];

        let in_sample = DateRange::new(
            in_sample_dates[0],
            *in_sample_dates.last().expect("window is non-empty"),
        );
        let out_of_sample = DateRange::new(
            out_of_sample_dates[0],
            *out_of_sample_dates.last().expect("window is non-empty"),
        );

        let in_provider = WindowProvider::slice(data, in_sample);
        let out_provider = WindowProvider::slice(data, out_of_sample);

        let mut in_config = config.base.clone();
        in_config.start_date = in_sample.start;
        in_config.end_date = in_sample.end;
        let mut out_config = config.base.clone();
        out_config.start_date = out_of_sample.start;
        out_config.end_date = out_of_sample.end;

        let (optimized_parameters, in_sample_metrics) = self
            .optimize_parameters(
                strategy,
                &in_provider,
                &in_config,
                &config.parameter_ranges,
                config.optimization_metric,
            )
            .await?;

        // The winning set goes out-of-sample untouched.
        let out_of_sample_metrics = self
            .test_parameters(strategy, &out_provider, &out_config, &optimized_parameters)
            .await?;

        Ok(WalkForwardPeriod {
            index,
            in_sample,
            out_of_sample,
            optimized_parameters,
            in_sample_metrics,
            out_of_sample_metrics,
        })
    }

    /// Exhaustive grid search over the in-sample slice.
    ///
    /// Each candidate is applied to the shared strategy under a restore
    /// guard, so the original configuration comes back on every exit path,
    /// including a failed combination or a panic mid-search. Failed
    /// combinations are excluded from the search, never fatal to it.
    pub async fn optimize_parameters(
        &self,
        strategy: &dyn Strategy,
        provider: &dyn HistoricalDataProvider,
        config: &BacktestConfig,
        ranges: &BTreeMap<String, ParameterRange>,
        metric: OptimizationMetric,
    ) -> Result<(BTreeMap<String, f64>, PerformanceMetrics), EngineError> {
        let _restore = ConfigRestoreGuard::capture(strategy);

        let mut best: Option<(f64, BTreeMap<String, f64>, PerformanceMetrics)> = None;
        for combination in ParameterGrid::new(ranges) {
            strategy.update_config(StrategyConfigPatch::parameters(combination.clone()));
            match self.engine.run_backtest(strategy, provider, config).await {
                Ok(result) => {
                    let score = metric.score(&result.performance);
                    tracing::debug!(?combination, score, "evaluated parameter combination");
                    if best.as_ref().map_or(true, |(b, _, _)| score > *b) {
                        best = Some((score, combination, result.performance));
                    }
                }
                Err(e) => {
                    tracing::warn!(?combination, error = %e, "parameter combination failed; excluded");
                }
            }
        }

        best.map(|(_, params, metrics)| (params, metrics))
            .ok_or_else(|| {
                EngineError::Collaborator(anyhow!("every parameter combination failed in-sample"))
            })
    }

    /// Evaluate a fixed parameter set on a slice, restoring the strategy's
    /// configuration afterwards.
    pub async fn test_parameters(
        &self,
        strategy: &dyn Strategy,
        provider: &dyn HistoricalDataProvider,
        config: &BacktestConfig,
        parameters: &BTreeMap<String, f64>,
    ) -> Result<PerformanceMetrics, EngineError> {
        let _restore = ConfigRestoreGuard::capture(strategy);
        strategy.update_config(StrategyConfigPatch::parameters(parameters.clone()));
        let result = self.engine.run_backtest(strategy, provider, config).await?;
        Ok(result.performance)
    }
}

/// Window start offsets: advance by `step` while a full in/out pair fits.
pub(crate) fn window_starts(total: usize, in_sample: usize, out_of_sample: usize, step: usize) -> Vec<usize> {
    let window = in_sample + out_of_sample;
    let mut starts = Vec::new();
    let mut start = 0;
    while start + window <= total {
        starts.push(start);
        start += step;
    }
    starts
}

/// Restores the strategy configuration captured at construction when
/// dropped, whatever path the optimization takes out of scope.
struct ConfigRestoreGuard<'a> {
    strategy: &'a dyn Strategy,
    original: strategy_core::StrategyConfig,
}

impl<'a> ConfigRestoreGuard<'a> {
    fn capture(strategy: &'a dyn Strategy) -> Self {
        Self {
            original: strategy.config(),
            strategy,
        }
    }
}

impl Drop for ConfigRestoreGuard<'_> {
    fn drop(&mut self) {
        self.strategy
            .update_config(StrategyConfigPatch::replace(self.original.clone()));
    }
}

/// In-memory provider over one window of an already-loaded dataset.
struct WindowProvider {
    data: BTreeMap<NaiveDate, Vec<MarketData>>,
}

impl WindowProvider {
    fn slice(data: &BTreeMap<NaiveDate, Vec<MarketData>>, range: DateRange) -> Self {
        Self {
            data: data
                .range(range.start..=range.end)
                .map(|(date, bars)| (*date, bars.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl HistoricalDataProvider for WindowProvider {
    async fn load_historical_data(
        &self,
        _symbols: &[String],
        range: &DateRange,
    ) -> anyhow::Result<BTreeMap<NaiveDate, Vec<MarketData>>> {
        Ok(self
            .data
            .range(range.start..=range.end)
            .map(|(date, bars)| (*date, bars.clone()))
            .collect())
    }

    fn validate_historical_data(
        &self,
        _data: &BTreeMap<NaiveDate, Vec<MarketData>>,
    ) -> DataValidationReport {
        // The parent dataset was validated when it was first loaded.
        DataValidationReport::clean()
    }
}
