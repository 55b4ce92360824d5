// =============================================================================
// Backtest subsystem — deterministic replay of the live trading stack
// =============================================================================

pub mod analytics;
pub mod data_source;
pub mod engine;
pub mod sim_gateway;

pub use analytics::{BacktestReport, EquitySample, PerformanceAnalyzer};
pub use data_source::{BacktestDataSource, TickStream};
pub use engine::{BacktestEngine, DEFAULT_EQUITY_INTERVAL};
pub use sim_gateway::{CommissionConfig, GatewayStats, SimulatedGateway, SlippageModel};
