use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::market::{DateRange, MarketData};

/// Outcome of a provider-side sanity check of a loaded dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataValidationReport {
    pub is_valid: bool,
    /// Problems found (gaps, zero volume, inverted high/low, ...).
    pub issues: Vec<String>,
    /// Human-readable remediation hints.
    pub suggestions: Vec<String>,
}

impl DataValidationReport {
    pub fn clean() -> Self {
        Self {
            is_valid: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
        }
    }
}

/// Source of historical market data, keyed by calendar date.
///
/// The `BTreeMap` key ordering is load-bearing: the engine iterates dates in
/// ascending order and providers get that for free.
#[async_trait]
pub trait HistoricalDataProvider: Send + Sync {
    /// Load daily bars for the requested symbols over the date range.
    /// Each entry maps a trading day to the cross-section of bars available
    /// that day (one per symbol with data).
    async fn load_historical_data(
        &self,
        symbols: &[String],
        range: &DateRange,
    ) -> Result<BTreeMap<NaiveDate, Vec<MarketData>>>;

    /// Sanity-check a loaded dataset before it is simulated against.
    fn validate_historical_data(
        &self,
        data: &BTreeMap<NaiveDate, Vec<MarketData>>,
    ) -> DataValidationReport;
}
