use rust_decimal::prelude::*;
use rust_decimal::Decimal;

use crate::models::{DrawdownAnalysis, DrawdownPeriod, EquityCurve};

/// Segment the equity curve into drawdown periods.
///
/// A period opens when value first falls below the running peak and closes
/// when a new peak is set; the close date is the recovery date. A drawdown
/// still open at the end of the series is recorded open-ended (no recovery).
pub fn drawdown_analysis(curve: &EquityCurve) -> DrawdownAnalysis {
    let points = &curve.points;
    if points.is_empty() {
        return DrawdownAnalysis {
            periods: Vec::new(),
            max_drawdown: 0.0,
            average_recovery_days: None,
        };
    }

    let mut periods = Vec::new();
    let mut peak_value = points[0].portfolio_value;
    let mut peak_date = points[0].timestamp;
    let mut in_drawdown = false;
    let mut trough_value = peak_value;
    let mut trough_date = peak_date;
    let mut start_date = peak_date;

    for point in points {
        let value = point.portfolio_value;
        if value >= peak_value {
            if in_drawdown {
                // New peak: close the open period at today's recovery.
                periods.push(DrawdownPeriod {
                    start_date,
                    end_date: point.timestamp,
                    peak_value,
                    trough_value,
                    drawdown_percent: drawdown_fraction(peak_value, trough_value),
                    duration_days: (point.timestamp - start_date).num_days(),
                    recovery_date: Some(point.timestamp),
                    recovery_days: Some((point.timestamp - trough_date).num_days()),
                });
                in_drawdown = false;
            }
            peak_value = value;
            peak_date = point.timestamp;
        } else {
            if !in_drawdown {
                in_drawdown = true;
                start_date = peak_date;
                trough_value = value;
                trough_date = point.timestamp;
            }
            if value < trough_value {
                trough_value = value;
                trough_date = point.timestamp;
            }
        }
    }

    // Unresolved drawdown at the end of the series.
    if in_drawdown {
        let last = points[points.len() - 1].timestamp;
        periods.push(DrawdownPeriod {
            start_date,
            end_date: last,
            peak_value,
            trough_value,
            drawdown_percent: drawdown_fraction(peak_value, trough_value),
            duration_days: (last - start_date).num_days(),
            recovery_date: None,
            recovery_days: None,
        });
    }

    let max_drawdown = periods
        .iter()
        .map(|p| p.drawdown_percent)
        .fold(0.0_f64, f64::max);

    let recoveries: Vec<i64> = periods.iter().filter_map(|p| p.recovery_days).collect();
    let average_recovery_days = if recoveries.is_empty() {
        None
    } else {
        Some(recoveries.iter().sum::<i64>() as f64 / recoveries.len() as f64)
    };

    DrawdownAnalysis {
        periods,
        max_drawdown,
        average_recovery_days,
    }
}

fn drawdown_fraction(peak: Decimal, trough: Decimal) -> f64 {
    if peak > Decimal::ZERO {
        ((peak - trough) / peak).to_f64().unwrap_or(0.0)
    } else {
        0.0
    }
}
