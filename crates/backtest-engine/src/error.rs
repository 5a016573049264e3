use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::ValidationResult;

/// Errors surfaced by the backtest and walk-forward engines.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The market is closed at the order's timestamp. Control flow, not a
    /// failure: the simulator has already queued the order and the caller
    /// retries it at the next open.
    #[error("market closed at {0}; order queued for next open")]
    MarketClosed(DateTime<Utc>),

    /// Strategy failed validation; no simulation was started.
    #[error("strategy validation failed: {}", .0.errors.join("; "))]
    ValidationFailed(ValidationResult),

    /// The data provider returned nothing for the requested range.
    #[error("no historical data for {symbols:?} between {start} and {end}")]
    NoData {
        symbols: Vec<String>,
        start: chrono::NaiveDate,
        end: chrono::NaiveDate,
    },

    /// The data series is too short for the requested walk-forward windows.
    #[error("need at least {required} data points for one window pair, have {available}")]
    InsufficientData { required: usize, available: usize },

    /// Every walk-forward period failed; there is nothing to aggregate.
    #[error("walk-forward analysis produced no successful periods")]
    NoSuccessfulPeriods,

    /// Failure in an external collaborator (data provider, strategy).
    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether this error is the queue-and-retry market-hours signal.
    pub fn is_market_closed(&self) -> bool {
        matches!(self, EngineError::MarketClosed(_))
    }
}
