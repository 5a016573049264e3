use anyhow::Result;
use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use sqlx::SqlitePool;

use crate::models::{BacktestResult, PerformanceMetrics};

/// Optional persistence collaborator. The engine stores through it
/// best-effort: a failing sink is logged and swallowed, never propagated.
#[async_trait]
pub trait ResultsSink: Send + Sync {
    async fn store_backtest_result(&self, result: &BacktestResult) -> Result<()>;

    async fn store_performance_metrics(
        &self,
        strategy_name: &str,
        metrics: &PerformanceMetrics,
    ) -> Result<()>;
}

/// Persists backtest artifacts to sqlite: summary columns for querying,
/// JSON blobs for the curve and drawdown detail.
pub struct SqliteResultsSink {
    pool: SqlitePool,
}

impl SqliteResultsSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the tables if they don't exist. Safe to call on every start.
    pub async fn init_tables(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backtests (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_name TEXT NOT NULL,
                symbols TEXT NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                initial_capital REAL NOT NULL,
                final_value REAL NOT NULL,
                total_return REAL NOT NULL,
                annualized_return REAL NOT NULL,
                volatility REAL NOT NULL,
                sharpe_ratio REAL,
                sortino_ratio REAL,
                calmar_ratio REAL,
                max_drawdown REAL NOT NULL,
                total_trades INTEGER NOT NULL,
                win_rate REAL NOT NULL,
                profit_factor REAL,
                warnings_json TEXT NOT NULL,
                equity_curve_json TEXT NOT NULL,
                drawdowns_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS performance_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                strategy_name TEXT NOT NULL,
                total_return REAL NOT NULL,
                sharpe_ratio REAL,
                max_drawdown REAL NOT NULL,
                win_rate REAL NOT NULL,
                metrics_json TEXT NOT NULL,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ResultsSink for SqliteResultsSink {
    async fn store_backtest_result(&self, result: &BacktestResult) -> Result<()> {
        self.init_tables().await?;

        let symbols_json = serde_json::to_string(&result.config.symbols)?;
        let warnings_json = serde_json::to_string(&result.warnings)?;
        let equity_json = serde_json::to_string(&result.equity)?;
        let drawdowns_json = serde_json::to_string(&result.drawdowns)?;

        sqlx::query(
            "INSERT INTO backtests (
                strategy_name, symbols, start_date, end_date,
                initial_capital, final_value, total_return, annualized_return,
                volatility, sharpe_ratio, sortino_ratio, calmar_ratio,
                max_drawdown, total_trades, win_rate, profit_factor,
                warnings_json, equity_curve_json, drawdowns_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&result.strategy_name)
        .bind(&symbols_json)
        .bind(result.start_date.to_string())
        .bind(result.end_date.to_string())
        .bind(result.config.initial_capital.to_f64().unwrap_or(0.0))
        .bind(result.portfolio.total_value.to_f64().unwrap_or(0.0))
        .bind(result.performance.returns.total_return)
        .bind(result.performance.returns.annualized_return)
        .bind(result.performance.risk.volatility)
        .bind(result.performance.risk.sharpe_ratio)
        .bind(result.performance.risk.sortino_ratio)
        .bind(result.performance.risk.calmar_ratio)
        .bind(result.performance.risk.max_drawdown)
        .bind(result.performance.trade_stats.total_trades as i64)
        .bind(result.performance.trade_stats.win_rate)
        .bind(result.performance.trade_stats.profit_factor)
        .bind(&warnings_json)
        .bind(&equity_json)
        .bind(&drawdowns_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn store_performance_metrics(
        &self,
        strategy_name: &str,
        metrics: &PerformanceMetrics,
    ) -> Result<()> {
        self.init_tables().await?;

        let metrics_json = serde_json::to_string(metrics)?;
        sqlx::query(
            "INSERT INTO performance_metrics (
                strategy_name, total_return, sharpe_ratio, max_drawdown,
                win_rate, metrics_json
            ) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(strategy_name)
        .bind(metrics.returns.total_return)
        .bind(metrics.risk.sharpe_ratio)
        .bind(metrics.risk.max_drawdown)
        .bind(metrics.trade_stats.win_rate)
        .bind(&metrics_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
