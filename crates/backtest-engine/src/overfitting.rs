use std::collections::BTreeMap;

use statrs::distribution::{ContinuousCDF, Normal};

use crate::models::{
    OverfittingAnalysis, OverfittingThresholds, ParameterRange, ParameterStability,
    ParameterStabilityReport, ParameterTrend, WalkForwardPeriod,
};

/// Quantify how much in-sample performance decays out-of-sample across
/// walk-forward periods, and whether that decay looks like overfitting.
///
/// `num_trials` is the size of the parameter grid searched per period and
/// `num_observations` the total out-of-sample days; both feed the deflated
/// Sharpe adjustment for selection bias (Bailey & López de Prado).
pub fn detect_overfitting(
    periods: &[WalkForwardPeriod],
    thresholds: &OverfittingThresholds,
    num_trials: usize,
    num_observations: usize,
) -> OverfittingAnalysis {
    let is_returns: Vec<f64> = periods
        .iter()
        .map(|p| p.in_sample_metrics.returns.total_return)
        .collect();
    let oos_returns: Vec<f64> = periods
        .iter()
        .map(|p| p.out_of_sample_metrics.returns.total_return)
        .collect();
    let is_sharpes: Vec<f64> = periods
        .iter()
        .map(|p| p.in_sample_metrics.risk.sharpe_ratio.unwrap_or(0.0))
        .collect();
    let oos_sharpes: Vec<f64> = periods
        .iter()
        .map(|p| p.out_of_sample_metrics.risk.sharpe_ratio.unwrap_or(0.0))
        .collect();
    let is_win_rates: Vec<f64> = periods
        .iter()
        .map(|p| p.in_sample_metrics.trade_stats.win_rate)
        .collect();
    let oos_win_rates: Vec<f64> = periods
        .iter()
        .map(|p| p.out_of_sample_metrics.trade_stats.win_rate)
        .collect();
    let oos_drawdowns: Vec<f64> = periods
        .iter()
        .map(|p| p.out_of_sample_metrics.risk.max_drawdown)
        .collect();

    let return_degradation = mean(&is_returns) - mean(&oos_returns);
    let sharpe_degradation = mean(&is_sharpes) - mean(&oos_sharpes);
    let win_rate_degradation = mean(&is_win_rates) - mean(&oos_win_rates);

    let return_consistency = std_dev(&oos_returns);
    let sharpe_consistency = std_dev(&oos_sharpes);
    let drawdown_consistency = std_dev(&oos_drawdowns);

    // Degradations dominate the score; inconsistency across periods adds a
    // smaller penalty. Clamped so the flagging thresholds stay meaningful.
    let overfitting_score = (return_degradation.max(0.0) * 2.0
        + sharpe_degradation.max(0.0) * 0.4
        + win_rate_degradation.max(0.0)
        + return_consistency.min(1.0) * 0.5)
        .clamp(0.0, 1.0);

    let is_overfitted = overfitting_score > thresholds.max_score
        || return_degradation > thresholds.max_return_degradation
        || sharpe_degradation > thresholds.max_sharpe_degradation;

    let (deflated_sharpe, sharpe_p_value) =
        deflate_sharpe(mean(&oos_sharpes), num_trials, num_observations);

    let mut recommendations = Vec::new();
    if return_degradation > thresholds.max_return_degradation {
        recommendations.push(
            "Out-of-sample returns degrade materially; shrink the parameter search space or lengthen the in-sample window".to_string(),
        );
    }
    if sharpe_degradation > thresholds.max_sharpe_degradation {
        recommendations.push(
            "Risk-adjusted performance does not survive out-of-sample; the in-sample Sharpe is likely selection bias".to_string(),
        );
    }
    if return_consistency > 0.1 {
        recommendations.push(
            "Out-of-sample results vary widely across periods; the strategy may be regime-dependent".to_string(),
        );
    }
    if recommendations.is_empty() {
        recommendations.push(
            "No strong overfitting evidence; keep monitoring degradation as new data arrives".to_string(),
        );
    }

    OverfittingAnalysis {
        return_degradation,
        sharpe_degradation,
        win_rate_degradation,
        return_consistency,
        sharpe_consistency,
        drawdown_consistency,
        overfitting_score,
        is_overfitted,
        deflated_sharpe,
        sharpe_p_value,
        recommendations,
    }
}

/// Deflate an observed Sharpe for the number of strategies tried.
///
/// Under the null of no skill, the best of N trials is expected to show a
/// Sharpe of about sqrt(2 ln N); the deflated value is the z-score of the
/// observation against that expectation.
fn deflate_sharpe(
    observed: f64,
    num_trials: usize,
    num_observations: usize,
) -> (Option<f64>, Option<f64>) {
    if num_trials < 2 || num_observations < 3 {
        return (None, None);
    }
    let n = num_trials as f64;
    let t = num_observations as f64;

    let expected_max = (2.0 * n.ln()).sqrt();
    let std_max = (1.0 / (2.0 * n.ln())).sqrt();
    let standard_error = ((1.0 + observed.powi(2) / 2.0) / t).max(1.0 / t).sqrt();

    let deflated = (observed - expected_max) / (std_max + standard_error);

    let normal = Normal::new(0.0, 1.0).expect("unit normal");
    let p_value = 2.0 * (1.0 - normal.cdf(deflated.abs()));

    (Some(deflated), Some(p_value))
}

/// Per-parameter stability of the grid-search optimum across periods.
pub fn analyze_parameter_stability(
    optimized_params: &[BTreeMap<String, f64>],
    ranges: &BTreeMap<String, ParameterRange>,
) -> ParameterStabilityReport {
    let mut parameters = Vec::new();

    for name in ranges.keys() {
        let values: Vec<f64> = optimized_params
            .iter()
            .filter_map(|params| params.get(name).copied())
            .collect();
        if values.is_empty() {
            continue;
        }

        let mean_value = mean(&values);
        let std = std_dev(&values);
        let coefficient_of_variation = if mean_value.abs() > 1e-12 {
            std / mean_value.abs()
        } else if std > 1e-12 {
            f64::INFINITY
        } else {
            0.0
        };

        parameters.push(ParameterStability {
            parameter: name.clone(),
            mean: mean_value,
            std_dev: std,
            coefficient_of_variation,
            is_stable: coefficient_of_variation < 0.3,
            trend: detect_trend(&values),
        });
    }

    let stability_score = if parameters.is_empty() {
        0.0
    } else {
        parameters
            .iter()
            .map(|p| (1.0 - p.coefficient_of_variation).max(0.0))
            .sum::<f64>()
            / parameters.len() as f64
    };

    ParameterStabilityReport {
        parameters,
        stability_score,
    }
}

/// Trend of the per-period optimum: second-half mean versus first-half mean,
/// flagged beyond a 20% relative move.
fn detect_trend(values: &[f64]) -> ParameterTrend {
    if values.len() < 2 {
        return ParameterTrend::Stable;
    }
    let half = values.len() / 2;
    let first = mean(&values[..half]);
    let second = mean(&values[half..]);
    if first.abs() < 1e-12 {
        return ParameterTrend::Stable;
    }
    let relative = (second - first) / first.abs();
    if relative > 0.2 {
        ParameterTrend::Increasing
    } else if relative < -0.2 {
        ParameterTrend::Decreasing
    } else {
        ParameterTrend::Stable
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; periods are the whole population here.
fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    (values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use strategy_core::DateRange;

    use crate::models::{
        PerformanceMetrics, ReturnMetrics, RiskMetrics, TradeStatistics, WalkForwardPeriod,
    };

    fn metrics(total_return: f64, sharpe: f64, win_rate: f64, max_drawdown: f64) -> PerformanceMetrics {
        PerformanceMetrics {
            returns: ReturnMetrics {
                total_return,
                annualized_return: total_return * 4.0,
                cumulative_return: total_return,
            },
            risk: RiskMetrics {
                volatility: 0.15,
                sharpe_ratio: Some(sharpe),
                sortino_ratio: Some(sharpe * 1.2),
                calmar_ratio: (max_drawdown > 0.0).then(|| total_return / max_drawdown),
                max_drawdown,
                rolling_sharpe: Vec::new(),
            },
            trade_stats: TradeStatistics {
                total_trades: 20,
                winning_trades: (win_rate * 20.0) as u32,
                losing_trades: 20 - (win_rate * 20.0) as u32,
                win_rate,
                profit_factor: Some(1.5),
                average_win: None,
                average_loss: None,
                largest_win: None,
                largest_loss: None,
            },
            benchmark: None,
        }
    }

    fn period(index: usize, is: PerformanceMetrics, oos: PerformanceMetrics) -> WalkForwardPeriod {
        let start = chrono::NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        WalkForwardPeriod {
            index,
            in_sample: DateRange::new(start, start + chrono::Days::new(59)),
            out_of_sample: DateRange::new(
                start + chrono::Days::new(60),
                start + chrono::Days::new(79),
            ),
            optimized_parameters: BTreeMap::new(),
            in_sample_metrics: is,
            out_of_sample_metrics: oos,
        }
    }

    #[test]
    fn identical_in_and_out_of_sample_scores_near_zero() {
        let m = metrics(0.05, 1.2, 0.55, 0.08);
        let periods: Vec<_> = (0..5).map(|i| period(i, m.clone(), m.clone())).collect();

        let analysis =
            detect_overfitting(&periods, &OverfittingThresholds::default(), 27, 100);
        assert!(analysis.overfitting_score.abs() < 1e-9);
        assert!(!analysis.is_overfitted);
        assert_eq!(analysis.return_degradation, 0.0);
        assert_eq!(analysis.return_consistency, 0.0);
    }

    #[test]
    fn heavy_degradation_is_flagged() {
        let periods: Vec<_> = (0..5)
            .map(|i| {
                period(
                    i,
                    metrics(0.25, 2.5, 0.70, 0.05),
                    metrics(-0.02, 0.1, 0.45, 0.20),
                )
            })
            .collect();

        let analysis =
            detect_overfitting(&periods, &OverfittingThresholds::default(), 27, 100);
        assert!(analysis.is_overfitted);
        assert!(analysis.return_degradation > 0.1);
        assert!(analysis.sharpe_degradation > 0.5);
        assert!(analysis.overfitting_score > 0.3);
        assert!(analysis.recommendations.len() >= 2);
    }

    #[test]
    fn thresholds_are_policy() {
        let periods: Vec<_> = (0..4)
            .map(|i| period(i, metrics(0.10, 1.5, 0.6, 0.05), metrics(0.04, 1.2, 0.55, 0.07)))
            .collect();

        let lax = OverfittingThresholds {
            max_score: 0.9,
            max_return_degradation: 0.5,
            max_sharpe_degradation: 2.0,
        };
        let strict = OverfittingThresholds {
            max_score: 0.01,
            max_return_degradation: 0.01,
            max_sharpe_degradation: 0.01,
        };

        assert!(!detect_overfitting(&periods, &lax, 10, 80).is_overfitted);
        assert!(detect_overfitting(&periods, &strict, 10, 80).is_overfitted);
    }

    #[test]
    fn deflated_sharpe_penalizes_many_trials() {
        let m = metrics(0.05, 1.5, 0.55, 0.08);
        let periods: Vec<_> = (0..5).map(|i| period(i, m.clone(), m.clone())).collect();

        let few = detect_overfitting(&periods, &OverfittingThresholds::default(), 2, 200);
        let many = detect_overfitting(&periods, &OverfittingThresholds::default(), 500, 200);
        // More trials, higher expected max under the null, lower deflated SR.
        assert!(many.deflated_sharpe.unwrap() < few.deflated_sharpe.unwrap());
        let p = many.sharpe_p_value.unwrap();
        assert!((0.0..=1.0).contains(&p));
    }

    #[test]
    fn constant_optimum_is_perfectly_stable() {
        let mut ranges = BTreeMap::new();
        ranges.insert("lookback".to_string(), ParameterRange { min: 10.0, max: 30.0, step: 5.0 });

        let params: Vec<BTreeMap<String, f64>> = (0..6)
            .map(|_| BTreeMap::from([("lookback".to_string(), 20.0)]))
            .collect();

        let report = analyze_parameter_stability(&params, &ranges);
        assert_eq!(report.parameters.len(), 1);
        let p = &report.parameters[0];
        assert_eq!(p.coefficient_of_variation, 0.0);
        assert!(p.is_stable);
        assert_eq!(p.trend, ParameterTrend::Stable);
        assert_eq!(report.stability_score, 1.0);
    }

    #[test]
    fn drifting_optimum_shows_a_trend() {
        let mut ranges = BTreeMap::new();
        ranges.insert("threshold".to_string(), ParameterRange { min: 0.0, max: 10.0, step: 1.0 });

        let up: Vec<BTreeMap<String, f64>> = [1.0, 1.5, 2.0, 4.0, 5.0, 6.0]
            .iter()
            .map(|v| BTreeMap::from([("threshold".to_string(), *v)]))
            .collect();
        let report = analyze_parameter_stability(&up, &ranges);
        assert_eq!(report.parameters[0].trend, ParameterTrend::Increasing);

        let down: Vec<BTreeMap<String, f64>> = [6.0, 5.0, 4.0, 2.0, 1.5, 1.0]
            .iter()
            .map(|v| BTreeMap::from([("threshold".to_string(), *v)]))
            .collect();
        let report = analyze_parameter_stability(&down, &ranges);
        assert_eq!(report.parameters[0].trend, ParameterTrend::Decreasing);
    }

    #[test]
    fn unstable_parameter_lowers_the_score() {
        let mut ranges = BTreeMap::new();
        ranges.insert("a".to_string(), ParameterRange { min: 0.0, max: 100.0, step: 10.0 });

        let params: Vec<BTreeMap<String, f64>> = [10.0, 90.0, 20.0, 80.0, 10.0, 100.0]
            .iter()
            .map(|v| BTreeMap::from([("a".to_string(), *v)]))
            .collect();

        let report = analyze_parameter_stability(&params, &ranges);
        assert!(!report.parameters[0].is_stable);
        assert!(report.stability_score < 0.5);
    }
}
