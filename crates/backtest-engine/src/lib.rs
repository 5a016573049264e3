pub mod drawdown;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod models;
pub mod overfitting;
pub mod param_grid;
pub mod portfolio;
pub mod simulator;
pub mod sink;
pub mod walk_forward;

pub use engine::BacktestEngine;
pub use error::EngineError;
pub use metrics::PerformanceCalculator;
pub use models::*;
pub use simulator::{SimulatorConfig, TradeSimulator};
pub use sink::{ResultsSink, SqliteResultsSink};
pub use walk_forward::WalkForwardAnalyzer;
