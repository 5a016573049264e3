use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single daily OHLCV observation for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: f64,
    /// Trailing average daily volume, used for participation and impact
    /// modeling. Providers that don't track it should set it to `volume`.
    pub average_volume: f64,
}

impl MarketData {
    /// Midpoint of the day's range.
    pub fn midpoint(&self) -> Decimal {
        (self.high + self.low) / Decimal::TWO
    }
}

/// An inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Calendar days spanned, inclusive of both endpoints.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}
