// =============================================================================
// Strategy Runtime — the shared tick -> signal -> order abstraction
// =============================================================================
//
// A strategy is the pair of callbacks `on_market_data` / `on_trade` plus a
// `StrategyCore` holding everything the runtime owns on its behalf: the
// portfolio ledger, the monotonic order counter, the injected gateway handle,
// and the optional risk gate. The same strategy object runs unmodified
// against the live engine and the backtest engine — only the injected
// gateway differs.
//
// Contract: callbacks return promptly (the engines are cooperative and
// single-threaded), emit orders only through `StrategyCore::send_order`, and
// own no sockets and no threads.
// =============================================================================

pub mod ema_cross;
pub mod grid;
pub mod momentum;

use std::sync::Arc;

use tracing::{error, warn};

use crate::config::StrategyConfig;
use crate::error::EngineError;
use crate::gateway::GatewayHandle;
use crate::metrics::MetricsRegistry;
use crate::portfolio::Portfolio;
use crate::risk::RiskManager;
use crate::types::{MarketData, Order, Side, Trade};

pub use ema_cross::EmaCrossStrategy;
pub use grid::GridStrategy;
pub use momentum::MomentumStrategy;

// ---------------------------------------------------------------------------
// StrategyCore
// ---------------------------------------------------------------------------

/// Runtime state owned by every strategy instance.
pub struct StrategyCore {
    pub strategy_id: String,
    pub portfolio: Portfolio,
    order_seq: u64,
    gateway: Option<GatewayHandle>,
    risk: Option<Arc<RiskManager>>,
    metrics: Option<Arc<MetricsRegistry>>,
    /// Engine-provided clock, nanoseconds since epoch. Live mode feeds the
    /// wall clock; backtest feeds the replayed tick time so the loop never
    /// reads a real clock.
    now_ns: i64,
}

impl StrategyCore {
    pub fn new(strategy_id: impl Into<String>) -> Self {
        Self {
            strategy_id: strategy_id.into(),
            portfolio: Portfolio::new(),
            order_seq: 0,
            gateway: None,
            risk: None,
            metrics: None,
            now_ns: 0,
        }
    }

    /// Inject the order gateway (live producer or backtest router).
    pub fn set_gateway(&mut self, gateway: GatewayHandle) {
        self.gateway = Some(gateway);
    }

    /// Attach the shared risk gate. Optional; without it orders are ungated.
    pub fn set_risk_manager(&mut self, risk: Arc<RiskManager>) {
        self.risk = Some(risk);
    }

    pub fn risk_manager(&self) -> Option<&Arc<RiskManager>> {
        self.risk.as_ref()
    }

    pub fn set_metrics(&mut self, metrics: Arc<MetricsRegistry>) {
        self.metrics = Some(metrics);
    }

    /// Advance the engine clock. Called by the engines before each callback.
    pub fn set_now(&mut self, now_ns: i64) {
        self.now_ns = now_ns;
    }

    pub fn now(&self) -> i64 {
        self.now_ns
    }

    /// Signed volume currently held in `symbol`.
    pub fn position_volume(&self, symbol: &str) -> i64 {
        self.portfolio.volume(symbol)
    }

    pub fn total_pnl(&self) -> f64 {
        self.portfolio.total_pnl()
    }

    /// Emit an order through the injected gateway.
    ///
    /// Risk gating happens here: opening orders run the full pre-trade check,
    /// closing orders only the daily-loss rule. A rejected order is dropped
    /// from the strategy's view (logged, never sent downstream). Returns the
    /// order id when the order actually left.
    pub fn send_order(
        &mut self,
        symbol: &str,
        side: Side,
        price: f64,
        volume: i64,
    ) -> Option<String> {
        let Some(gateway) = &self.gateway else {
            error!(
                strategy = %self.strategy_id,
                symbol,
                "order dropped: no gateway injected"
            );
            return None;
        };

        if let Some(risk) = &self.risk {
            let held = self.portfolio.volume(symbol);
            let opening = held == 0 || held.signum() == side.sign();
            if opening {
                if let Err(reason) = risk.pre_trade_check(symbol, side, volume, price) {
                    warn!(
                        strategy = %self.strategy_id,
                        symbol,
                        %side,
                        volume,
                        price,
                        %reason,
                        "order dropped by risk gate"
                    );
                    return None;
                }
            } else if !risk.daily_loss_ok() {
                warn!(
                    strategy = %self.strategy_id,
                    symbol,
                    %side,
                    reason = %crate::error::RiskReason::DailyLoss,
                    "order dropped by risk gate"
                );
                return None;
            }
        }

        self.order_seq += 1;
        let order_id = format!("{}_{}", self.strategy_id, self.order_seq);
        let order = Order {
            order_id: order_id.clone(),
            strategy_id: self.strategy_id.clone(),
            symbol: symbol.to_string(),
            price,
            volume,
            side,
            timestamp: self.now_ns,
        };

        let result = gateway.lock().send_order(order);
        match result {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.inc_orders_sent(&self.strategy_id, symbol, side);
                }
                Some(order_id)
            }
            Err(EngineError::BusOverflow) => {
                // Policy: drop, already logged by the gateway as unsent.
                None
            }
            Err(e) => {
                warn!(strategy = %self.strategy_id, error = %e, "order send failed");
                None
            }
        }
    }

    /// Evaluate the risk gate's stop/target for `symbol` at the current tick
    /// price and emit the closing order when one has triggered. Returns true
    /// when a close was emitted.
    pub fn check_risk_triggers(&mut self, symbol: &str, price: f64) -> bool {
        let Some(risk) = &self.risk else {
            return false;
        };
        let Some(signal) = risk.mark(symbol, price) else {
            return false;
        };
        if !signal.should_close {
            return false;
        }

        warn!(
            strategy = %self.strategy_id,
            symbol,
            reason = %signal.close_reason,
            "risk close signal"
        );
        let side = if signal.volume > 0 { Side::Sell } else { Side::Buy };
        self.send_order(symbol, side, price, signal.volume.abs()).is_some()
    }
}

impl std::fmt::Debug for StrategyCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StrategyCore")
            .field("strategy_id", &self.strategy_id)
            .field("order_seq", &self.order_seq)
            .field("has_gateway", &self.gateway.is_some())
            .field("has_risk", &self.risk.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Strategy trait
// ---------------------------------------------------------------------------

/// The capability every strategy implements. Engines drive strategies purely
/// through this interface and the embedded `StrategyCore`.
pub trait Strategy: Send {
    fn core(&self) -> &StrategyCore;
    fn core_mut(&mut self) -> &mut StrategyCore;

    /// One tick. Must not block.
    fn on_market_data(&mut self, md: &MarketData);

    /// One fill or rejection report for an order this strategy emitted.
    fn on_trade(&mut self, trade: &Trade);

    fn id(&self) -> String {
        self.core().strategy_id.clone()
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Build a strategy instance from its config entry. The `parameters` table
/// is handed verbatim to the strategy's constructor.
pub fn build_strategy(config: &StrategyConfig) -> crate::error::Result<Box<dyn Strategy>> {
    let strategy: Box<dyn Strategy> = match config.strategy_type.as_str() {
        "ma_cross" => Box::new(EmaCrossStrategy::from_config(config)?),
        "grid" => Box::new(GridStrategy::from_config(config)?),
        "momentum" => Box::new(MomentumStrategy::from_config(config)?),
        other => {
            return Err(EngineError::ConfigInvalid(format!(
                "unknown strategy type: {other:?} (strategy {:?})",
                config.name
            )))
        }
    };
    Ok(strategy)
}

/// Deserialize a strategy's `parameters` table into its typed params.
pub(crate) fn parse_params<T: serde::de::DeserializeOwned>(
    config: &StrategyConfig,
) -> crate::error::Result<T> {
    config.parameters.clone().try_into().map_err(|e| {
        EngineError::ConfigInvalid(format!(
            "strategy {:?}: invalid parameters: {e}",
            config.name
        ))
    })
}

// =============================================================================
// Test support
// =============================================================================
#[cfg(test)]
pub(crate) mod testkit {
    use super::*;
    use crate::gateway::OrderGateway;
    use crate::types::TradeStatus;
    use parking_lot::Mutex;

    /// Gateway that records every order it is handed.
    #[derive(Default)]
    pub struct RecordingGateway {
        pub orders: Arc<Mutex<Vec<Order>>>,
    }

    impl RecordingGateway {
        pub fn new() -> (Self, Arc<Mutex<Vec<Order>>>) {
            let orders: Arc<Mutex<Vec<Order>>> = Arc::default();
            (
                Self {
                    orders: orders.clone(),
                },
                orders,
            )
        }
    }

    impl OrderGateway for RecordingGateway {
        fn send_order(&mut self, order: Order) -> crate::error::Result<()> {
            self.orders.lock().push(order);
            Ok(())
        }
    }

    /// Synthesize the FILLED trade for an order at its limit price.
    pub fn fill_for(order: &Order) -> Trade {
        Trade {
            trade_id: format!("fill_{}", order.order_id),
            order_id: order.order_id.clone(),
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            filled_price: order.price,
            filled_volume: order.volume,
            trade_time: order.timestamp,
            status: TradeStatus::Filled,
            error_code: 0,
            error_message: String::new(),
            is_retryable: false,
            commission: 0.0,
        }
    }

    /// Apply the fill to the strategy's ledger and deliver the callback —
    /// what an engine does with an incoming trade report.
    pub fn deliver_fill(strategy: &mut dyn Strategy, trade: &Trade) {
        strategy.core_mut().portfolio.apply_trade(trade);
        strategy.on_trade(trade);
    }

    /// Minimal tick constructor.
    pub fn tick(symbol: &str, price: f64, volume: f64, time: i64) -> MarketData {
        MarketData {
            symbol: symbol.to_string(),
            last_price: price,
            volume,
            exchange_time: time,
            local_time: time,
            exchange: "test".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testkit::*;
    use super::*;
    use crate::gateway::gateway_handle;
    use crate::risk::RiskConfig;

    struct NullStrategy {
        core: StrategyCore,
    }

    impl Strategy for NullStrategy {
        fn core(&self) -> &StrategyCore {
            &self.core
        }
        fn core_mut(&mut self) -> &mut StrategyCore {
            &mut self.core
        }
        fn on_market_data(&mut self, _md: &MarketData) {}
        fn on_trade(&mut self, _trade: &Trade) {}
    }

    #[test]
    fn order_ids_are_monotonic_per_strategy() {
        let (gw, orders) = RecordingGateway::new();
        let mut core = StrategyCore::new("alpha");
        core.set_gateway(gateway_handle(gw));
        core.set_now(42);

        assert!(core.send_order("BTCUSDT", Side::Buy, 100.0, 1).is_some());
        assert!(core.send_order("BTCUSDT", Side::Sell, 101.0, 1).is_some());

        let orders = orders.lock();
        assert_eq!(orders[0].order_id, "alpha_1");
        assert_eq!(orders[1].order_id, "alpha_2");
        assert_eq!(orders[0].timestamp, 42);
        assert_eq!(orders[0].strategy_id, "alpha");
    }

    #[test]
    fn send_order_without_gateway_is_dropped() {
        let mut core = StrategyCore::new("alpha");
        assert!(core.send_order("BTCUSDT", Side::Buy, 100.0, 1).is_none());
    }

    #[test]
    fn risk_gate_blocks_opening_orders() {
        let (gw, orders) = RecordingGateway::new();
        let mut core = StrategyCore::new("alpha");
        core.set_gateway(gateway_handle(gw));
        let risk = Arc::new(RiskManager::new(RiskConfig::default(), 1000.0));
        core.set_risk_manager(risk.clone());

        // 1000 capital * 30% cap -> a 400 notional open is rejected.
        assert!(core.send_order("BTCUSDT", Side::Buy, 400.0, 1).is_none());
        assert!(orders.lock().is_empty());

        // Within the cap it passes.
        assert!(core.send_order("BTCUSDT", Side::Buy, 200.0, 1).is_some());
        assert_eq!(orders.lock().len(), 1);
    }

    #[test]
    fn closing_orders_bypass_exposure_limits() {
        let (gw, orders) = RecordingGateway::new();
        let mut strategy = NullStrategy {
            core: StrategyCore::new("alpha"),
        };
        strategy.core_mut().set_gateway(gateway_handle(gw));
        let risk = Arc::new(RiskManager::new(
            RiskConfig {
                max_position_pct: 0.001,
                ..RiskConfig::default()
            },
            1000.0,
        ));
        strategy.core_mut().set_risk_manager(risk);

        // Hold a long position (applied directly to the ledger).
        let order = Order {
            order_id: "x_1".to_string(),
            strategy_id: "alpha".to_string(),
            symbol: "BTCUSDT".to_string(),
            price: 100.0,
            volume: 5,
            side: Side::Buy,
            timestamp: 0,
        };
        deliver_fill(&mut strategy, &fill_for(&order));

        // A SELL that reduces the long is a closing order: the (tiny)
        // position-size cap must not block it.
        assert!(strategy
            .core_mut()
            .send_order("BTCUSDT", Side::Sell, 100.0, 5)
            .is_some());
        assert_eq!(orders.lock().len(), 1);
    }

    #[test]
    fn risk_trigger_emits_the_closing_order() {
        let (gw, orders) = RecordingGateway::new();
        let mut core = StrategyCore::new("alpha");
        core.set_gateway(gateway_handle(gw));
        let risk = Arc::new(RiskManager::new(RiskConfig::default(), 100_000.0));
        core.set_risk_manager(risk.clone());

        risk.on_fill("BTCUSDT", 100.0, 2, Side::Buy);

        // Above the stop: no close.
        assert!(!core.check_risk_triggers("BTCUSDT", 99.0));
        // Below the stop (98): close the full volume.
        assert!(core.check_risk_triggers("BTCUSDT", 97.0));

        let orders = orders.lock();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[0].volume, 2);
    }

    #[test]
    fn unknown_strategy_type_is_config_error() {
        let config = StrategyConfig {
            name: "x".to_string(),
            strategy_type: "arbitrage".to_string(),
            enabled: true,
            symbol: "BTCUSDT".to_string(),
            exchange: "binance".to_string(),
            parameters: toml::Table::new(),
        };
        assert!(build_strategy(&config).is_err());
    }
}
