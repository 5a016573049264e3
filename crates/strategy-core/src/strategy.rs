use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::market::MarketData;
use crate::signal::Signal;

/// Strategy configuration shared by every implementation.
///
/// `parameters` holds the strategy-specific tunables (lookback multipliers,
/// thresholds, ...) that the walk-forward grid search sweeps over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Maximum fraction of portfolio value a single position may take, (0, 1].
    pub max_position_size: f64,
    /// Bars of history the strategy needs before it can emit signals.
    pub lookback_period: usize,
    /// Optional stop-loss as a fraction, e.g. 0.05 = 5%.
    pub stop_loss_percent: Option<f64>,
    /// Optional take-profit as a fraction.
    pub take_profit_percent: Option<f64>,
    /// Named numeric tunables, the grid-search surface.
    pub parameters: BTreeMap<String, f64>,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            max_position_size: 0.1,
            lookback_period: 20,
            stop_loss_percent: None,
            take_profit_percent: None,
            parameters: BTreeMap::new(),
        }
    }
}

/// Partial update applied through [`Strategy::update_config`].
///
/// `None` fields are left untouched; `parameters` entries are merged over the
/// existing map. [`StrategyConfigPatch::replace`] builds a patch that restores
/// a full config verbatim, which is what the optimizer's restore guard uses.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyConfigPatch {
    pub max_position_size: Option<f64>,
    pub lookback_period: Option<usize>,
    pub stop_loss_percent: Option<Option<f64>>,
    pub take_profit_percent: Option<Option<f64>>,
    pub parameters: BTreeMap<String, f64>,
    /// When true, `parameters` replaces the map instead of merging into it.
    pub replace_parameters: bool,
}

impl StrategyConfigPatch {
    /// A patch that overwrites every field with the values in `config`.
    pub fn replace(config: StrategyConfig) -> Self {
        Self {
            max_position_size: Some(config.max_position_size),
            lookback_period: Some(config.lookback_period),
            stop_loss_percent: Some(config.stop_loss_percent),
            take_profit_percent: Some(config.take_profit_percent),
            parameters: config.parameters,
            replace_parameters: true,
        }
    }

    /// A patch that only merges strategy parameters.
    pub fn parameters(parameters: BTreeMap<String, f64>) -> Self {
        Self {
            parameters,
            ..Self::default()
        }
    }

    /// Apply this patch to a config value.
    pub fn apply_to(&self, config: &mut StrategyConfig) {
        if let Some(v) = self.max_position_size {
            config.max_position_size = v;
        }
        if let Some(v) = self.lookback_period {
            config.lookback_period = v;
        }
        if let Some(v) = self.stop_loss_percent {
            config.stop_loss_percent = v;
        }
        if let Some(v) = self.take_profit_percent {
            config.take_profit_percent = v;
        }
        if self.replace_parameters {
            config.parameters = self.parameters.clone();
        } else {
            for (k, v) in &self.parameters {
                config.parameters.insert(k.clone(), *v);
            }
        }
    }
}

/// The capability interface a trading strategy exposes to the engine.
///
/// The engine knows nothing about concrete strategies: it validates, asks for
/// signals over a day's cross-sectional market data, and reads/patches the
/// config. `update_config` takes `&self` so a single strategy instance can be
/// shared across the walk-forward; implementations use interior mutability
/// (e.g. `RwLock<StrategyConfig>`).
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Strategy name for logging and persistence.
    fn name(&self) -> &str;

    /// Whether the strategy is able to analyze data at all.
    fn validate(&self) -> bool;

    /// Produce signals for one day's market data across all symbols.
    async fn analyze(&self, market_data: &[MarketData]) -> Result<Vec<Signal>>;

    /// Snapshot of the current configuration.
    fn config(&self) -> StrategyConfig;

    /// Apply a partial configuration update.
    fn update_config(&self, patch: StrategyConfigPatch);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_merges_parameters() {
        let mut config = StrategyConfig::default();
        config.parameters.insert("fast".into(), 10.0);
        config.parameters.insert("slow".into(), 30.0);

        let mut update = BTreeMap::new();
        update.insert("fast".into(), 12.0);
        StrategyConfigPatch::parameters(update).apply_to(&mut config);

        assert_eq!(config.parameters["fast"], 12.0);
        assert_eq!(config.parameters["slow"], 30.0);
    }

    #[test]
    fn replace_patch_restores_verbatim() {
        let original = StrategyConfig {
            max_position_size: 0.25,
            lookback_period: 14,
            stop_loss_percent: Some(0.05),
            take_profit_percent: None,
            parameters: BTreeMap::from([("threshold".to_string(), 1.5)]),
        };

        let mut mutated = original.clone();
        mutated.max_position_size = 0.9;
        mutated.parameters.insert("threshold".into(), 99.0);
        mutated.parameters.insert("extra".into(), 1.0);

        StrategyConfigPatch::replace(original.clone()).apply_to(&mut mutated);
        assert_eq!(mutated, original);
    }
}
