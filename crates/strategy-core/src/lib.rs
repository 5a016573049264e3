pub mod market;
pub mod provider;
pub mod signal;
pub mod strategy;

pub use market::{DateRange, MarketData};
pub use provider::{DataValidationReport, HistoricalDataProvider};
pub use signal::{Signal, SignalAction};
pub use strategy::{Strategy, StrategyConfig, StrategyConfigPatch};
