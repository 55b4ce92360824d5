// =============================================================================
// Meridian — cross-mode algorithmic trading engine
// =============================================================================
//
// One strategy abstraction, two execution paths. The live engine consumes
// ticks off the message bus and pushes orders at a real gateway; the backtest
// engine replays a historical window through the identical strategy objects
// against a simulated gateway. The modules below mirror that split:
//
//   codec      tag-wire binary format for Order / Trade / MarketData
//   bus        TCP pub/sub and push/pull endpoints + poller
//   portfolio  per-symbol positions, average-cost PnL accounting
//   risk       pre-trade gate, stop/target monitoring, sizing
//   strategy   the Strategy trait, its runtime core, reference strategies
//   gateway    the OrderGateway seam both engines implement
//   engine     live poll loop
//   backtest   data source, simulated gateway, replay engine, analytics
//   metrics    process-wide observability registry + HTTP exposition
//   config     TOML configuration schema
// =============================================================================

pub mod backtest;
pub mod bus;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod metrics;
pub mod portfolio;
pub mod risk;
pub mod strategy;
pub mod types;

pub use config::Config;
pub use error::{EngineError, RiskReason};
pub use portfolio::{Portfolio, Position};
pub use risk::{RiskConfig, RiskManager};
pub use strategy::{Strategy, StrategyCore};
pub use types::{MarketData, Order, Side, Trade, TradeStatus};
