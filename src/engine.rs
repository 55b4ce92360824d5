// =============================================================================
// Live Strategy Engine — bus-driven tick dispatch and trade routing
// =============================================================================
//
// Wires the subscriber endpoints, the order gateway, and the registered
// strategies into one cooperative poll loop:
//
//   poll(md, trade; 1s) ->
//     md frame:    decode -> every strategy's on_market_data in registration
//                  order -> ledger mark per strategy -> risk trigger check
//     trade frame: decode -> route by strategy_id -> ledger apply on FILLED
//                  -> risk counters -> on_trade
//
// Error isolation is per message: a frame that fails to decode is dropped and
// counted, a strategy callback that panics aborts only that strategy's tick.
// The loop observes the stop flag within one poll timeout; the caller (not
// the engine) decides whether a signal handler flips it. Endpoints close in
// reverse-of-open order on shutdown.
// =============================================================================

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::bus::{BusFrame, Poller, PushProducer, Subscriber, DEFAULT_HIGH_WATER_MARK};
use crate::codec;
use crate::config::BusConfig;
use crate::gateway::{gateway_handle, GatewayHandle, LivePushGateway};
use crate::metrics::MetricsRegistry;
use crate::risk::RiskManager;
use crate::strategy::Strategy;
use crate::types::Side;

const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Message counters reported at shutdown.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EngineStats {
    pub md_count: u64,
    pub trade_count: u64,
    pub unrouted_trades: u64,
    pub decode_errors: u64,
}

/// Crude per-strategy performance tracking for the live gauges. The backtest
/// analyzer owns the rigorous versions of these numbers; live mode only needs
/// an estimate that moves with the session.
#[derive(Default)]
struct LivePerf {
    wins: u64,
    losses: u64,
    cumulative_pnl: f64,
    peak_pnl: f64,
    max_drawdown: f64,
    closed_pnls: Vec<f64>,
}

impl LivePerf {
    fn on_fill(&mut self, realized: f64, closing: bool) {
        self.cumulative_pnl += realized;
        if self.cumulative_pnl > self.peak_pnl {
            self.peak_pnl = self.cumulative_pnl;
        }
        let drawdown = self.peak_pnl - self.cumulative_pnl;
        if drawdown > self.max_drawdown {
            self.max_drawdown = drawdown;
        }

        if closing {
            if realized > 0.0 {
                self.wins += 1;
            } else if realized < 0.0 {
                self.losses += 1;
            }
            self.closed_pnls.push(realized);
        }
    }

    fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses;
        if total == 0 {
            0.0
        } else {
            self.wins as f64 / total as f64
        }
    }

    /// Mean-over-stdev of closed-trade PnLs. A session-local estimate, not
    /// the annualized figure the backtest analyzer reports.
    fn sharpe_estimate(&self) -> f64 {
        if self.closed_pnls.len() < 2 {
            return 0.0;
        }
        let n = self.closed_pnls.len() as f64;
        let mean = self.closed_pnls.iter().sum::<f64>() / n;
        let variance = self.closed_pnls.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        if std == 0.0 {
            0.0
        } else {
            mean / std
        }
    }
}

pub struct StrategyEngine {
    // Declaration order is drop order: the order gateway closes first, then
    // the trade subscriber, then the market-data subscriber — the reverse of
    // how they were opened.
    gateway: GatewayHandle,
    trade_sub: Subscriber,
    md_sub: Subscriber,
    strategies: IndexMap<String, Box<dyn Strategy>>,
    perf: IndexMap<String, LivePerf>,
    risk: Option<Arc<RiskManager>>,
    metrics: Option<Arc<MetricsRegistry>>,
    running: Arc<AtomicBool>,
    stats: EngineStats,
}

impl StrategyEngine {
    /// Connect the three bus endpoints for the given symbol universe.
    pub fn new(bus: &BusConfig, symbols: &[String]) -> crate::error::Result<Self> {
        let md_topics: Vec<String> = symbols.iter().map(|s| format!("md.{s}")).collect();
        let md_sub = Subscriber::connect(&bus.md_endpoints, &md_topics)?;
        info!(endpoints = ?bus.md_endpoints, topics = ?md_topics, "market data subscribed");

        let trade_sub = Subscriber::connect(
            std::slice::from_ref(&bus.trade_endpoint),
            &["trade.".to_string()],
        )?;
        info!(endpoint = %bus.trade_endpoint, "trade feed subscribed");

        let producer = PushProducer::connect(&bus.order_endpoint, DEFAULT_HIGH_WATER_MARK)?;
        info!(endpoint = %bus.order_endpoint, "order gateway connected");

        Ok(Self {
            gateway: gateway_handle(LivePushGateway::new(producer)),
            trade_sub,
            md_sub,
            strategies: IndexMap::new(),
            perf: IndexMap::new(),
            risk: None,
            metrics: None,
            running: Arc::new(AtomicBool::new(false)),
            stats: EngineStats::default(),
        })
    }

    /// Share one risk gate across all strategies added afterwards.
    pub fn set_risk_manager(&mut self, risk: Arc<RiskManager>) {
        self.risk = Some(risk);
    }

    pub fn set_metrics(&mut self, metrics: Arc<MetricsRegistry>) {
        self.metrics = Some(metrics);
    }

    /// Register a strategy; the gateway handle (and risk gate, if enabled)
    /// are injected here.
    pub fn add_strategy(&mut self, mut strategy: Box<dyn Strategy>) {
        let id = strategy.id();
        strategy.core_mut().set_gateway(self.gateway.clone());
        if let Some(risk) = &self.risk {
            strategy.core_mut().set_risk_manager(risk.clone());
        }
        if let Some(metrics) = &self.metrics {
            strategy.core_mut().set_metrics(metrics.clone());
        }
        info!(strategy = %id, "strategy registered");
        self.perf.insert(id.clone(), LivePerf::default());
        self.strategies.insert(id, strategy);

        if let Some(metrics) = &self.metrics {
            metrics.set_active_strategies(self.strategies.len());
        }
    }

    /// Cooperative stop flag; flip it to false and the loop exits within one
    /// poll timeout.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Run the poll loop until the stop flag clears. Consumes the engine so
    /// shutdown ordering is owned here.
    pub async fn run(mut self) -> crate::error::Result<EngineStats> {
        self.running.store(true, Ordering::SeqCst);
        info!(
            strategies = ?self.strategies.keys().collect::<Vec<_>>(),
            "strategy engine started"
        );

        while self.running.load(Ordering::SeqCst) {
            let ready =
                Poller::poll(&mut [&mut self.md_sub, &mut self.trade_sub], POLL_TIMEOUT).await;

            for idx in ready {
                match idx {
                    0 => {
                        if let Some(frame) = self.md_sub.recv() {
                            self.handle_market_data(frame);
                        }
                    }
                    1 => {
                        if let Some(frame) = self.trade_sub.recv() {
                            self.handle_trade(frame);
                        }
                    }
                    _ => {}
                }
            }
        }

        info!(
            md_count = self.stats.md_count,
            trade_count = self.stats.trade_count,
            unrouted = self.stats.unrouted_trades,
            decode_errors = self.stats.decode_errors,
            "strategy engine stopped"
        );
        for (id, strategy) in &self.strategies {
            info!(strategy = %id, pnl = strategy.core().total_pnl(), "final strategy PnL");
        }

        // Fields drop here in reverse-of-open order (gateway, trade, md).
        Ok(self.stats)
    }

    // -------------------------------------------------------------------------
    // Market data path
    // -------------------------------------------------------------------------

    fn handle_market_data(&mut self, frame: BusFrame) {
        let md = match codec::decode_market_data(&frame.payload) {
            Ok(md) => md,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(topic = %frame.topic, error = %e, "dropping malformed market data frame");
                return;
            }
        };
        self.stats.md_count += 1;
        if let Some(metrics) = &self.metrics {
            metrics.inc_ticks_received(&md.symbol);
        }

        let now_ns = Utc::now().timestamp_nanos_opt().unwrap_or(md.local_time);

        for i in 0..self.strategies.len() {
            if let Some((id, strategy)) = self.strategies.get_index_mut(i) {
                let id = id.clone();
                strategy.core_mut().set_now(now_ns);
                let started = Instant::now();
                let result = catch_unwind(AssertUnwindSafe(|| strategy.on_market_data(&md)));
                if result.is_err() {
                    error!(
                        strategy = %id,
                        symbol = %md.symbol,
                        "strategy callback panicked — tick aborted for this strategy"
                    );
                }
                if let Some(metrics) = &self.metrics {
                    metrics
                        .observe_callback_latency(&id, started.elapsed().as_secs_f64() * 1000.0);
                }
            }
        }

        // Marks happen after every strategy has seen the tick.
        for (_, strategy) in self.strategies.iter_mut() {
            strategy.core_mut().portfolio.mark(&md.symbol, md.last_price);
        }

        for i in 0..self.strategies.len() {
            if let Some((_, strategy)) = self.strategies.get_index_mut(i) {
                if strategy.core().position_volume(&md.symbol) != 0 {
                    strategy
                        .core_mut()
                        .check_risk_triggers(&md.symbol, md.last_price);
                }
            }
        }

        self.publish_gauges(&md.symbol);
    }

    // -------------------------------------------------------------------------
    // Trade path
    // -------------------------------------------------------------------------

    fn handle_trade(&mut self, frame: BusFrame) {
        let trade = match codec::decode_trade(&frame.payload) {
            Ok(trade) => trade,
            Err(e) => {
                self.stats.decode_errors += 1;
                warn!(topic = %frame.topic, error = %e, "dropping malformed trade frame");
                return;
            }
        };
        self.stats.trade_count += 1;
        if let Some(metrics) = &self.metrics {
            metrics.inc_trades_received(&trade.strategy_id, trade.status.as_str());
        }

        let Some(strategy) = self.strategies.get_mut(&trade.strategy_id) else {
            self.stats.unrouted_trades += 1;
            warn!(
                strategy = %trade.strategy_id,
                order_id = %trade.order_id,
                "trade for unknown strategy discarded"
            );
            return;
        };

        if trade.is_filled() {
            let held_before = strategy.core().position_volume(&trade.symbol);
            let closing = held_before != 0 && held_before.signum() != trade.side.sign();
            let realized = strategy.core_mut().portfolio.apply_trade(&trade);

            if let Some(risk) = &self.risk {
                risk.update_pnl(realized);
                match strategy.core().portfolio.position(&trade.symbol) {
                    Some(pos) if pos.volume != 0 => {
                        let side = if pos.volume > 0 { Side::Buy } else { Side::Sell };
                        risk.on_fill(&trade.symbol, pos.avg_price, pos.volume.abs(), side);
                    }
                    _ => risk.on_fill(&trade.symbol, 0.0, 0, trade.side),
                }
            }

            if let Some(perf) = self.perf.get_mut(&trade.strategy_id) {
                perf.on_fill(realized, closing);
                if let Some(metrics) = &self.metrics {
                    if closing {
                        if realized > 0.0 {
                            metrics.inc_winning_trades(&trade.strategy_id);
                        } else if realized < 0.0 {
                            metrics.inc_losing_trades(&trade.strategy_id);
                        }
                        metrics.set_win_rate(&trade.strategy_id, perf.win_rate());
                        metrics.set_sharpe_ratio(&trade.strategy_id, perf.sharpe_estimate());
                    }
                    metrics.set_max_drawdown(&trade.strategy_id, perf.max_drawdown);
                }
            }

            info!(
                strategy = %trade.strategy_id,
                symbol = %trade.symbol,
                side = %trade.side,
                volume = trade.filled_volume,
                price = trade.filled_price,
                pnl = strategy.core().total_pnl(),
                "fill applied"
            );
        } else {
            warn!(
                strategy = %trade.strategy_id,
                order_id = %trade.order_id,
                code = trade.error_code,
                error = %trade.error_message,
                "trade rejected by gateway"
            );
        }

        let result = {
            let trade_ref = &trade;
            catch_unwind(AssertUnwindSafe(|| strategy.on_trade(trade_ref)))
        };
        if result.is_err() {
            error!(
                strategy = %trade.strategy_id,
                order_id = %trade.order_id,
                "on_trade panicked — report dropped for this strategy"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Metrics
    // -------------------------------------------------------------------------

    fn publish_gauges(&self, symbol: &str) {
        let Some(metrics) = &self.metrics else {
            return;
        };
        for (id, strategy) in &self.strategies {
            let portfolio = &strategy.core().portfolio;
            metrics.set_total_pnl(id, portfolio.total_pnl());
            metrics.set_realized_pnl(id, portfolio.total_realized());
            if let Some(pos) = portfolio.position(symbol) {
                metrics.set_position_value(id, symbol, pos.volume as f64 * pos.avg_price);
                metrics.set_position_unrealized(id, symbol, pos.unrealized_pnl);
            }
        }
    }
}
