use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// What a strategy wants done about a symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// A trading signal emitted by a strategy for a single symbol and day.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    pub symbol: String,
    /// Optional fraction of available cash to commit, overriding the
    /// backtest's default position size. Must be in (0, 1].
    pub size: Option<f64>,
    /// Reference price the signal was generated against (typically the close).
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    /// Strategy's confidence in the signal, 0.0-1.0.
    pub confidence: f64,
}

impl Signal {
    /// Hold signals carry no order intent and are skipped by the engine.
    pub fn is_actionable(&self) -> bool {
        self.action != SignalAction::Hold
    }
}
