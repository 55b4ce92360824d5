// =============================================================================
// Backtest Engine — deterministic event-driven replay
// =============================================================================
//
// Drives the same Strategy objects the live engine runs, against a historical
// tick stream. The engine's router stands in for the order gateway: a
// strategy's `send_order` lands in the simulated gateway, which produces the
// fill synchronously; fills are applied right after the callback that caused
// them returns, preserving the live engine's observable ordering (fills land
// before the tick's ledger mark).
//
// Determinism: strategies iterate in registration order, the rejection draw
// is seeded, trade ids are counters, and no wall clock is read inside the
// loop — order and fill timestamps come from the replayed ticks. Two runs
// over the same stream with the same seed produce identical reports.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::gateway::{GatewayHandle, OrderGateway};
use crate::risk::RiskManager;
use crate::strategy::Strategy;
use crate::types::{MarketData, Order, Side, Trade};

use super::analytics::{BacktestReport, PerformanceAnalyzer};
use super::sim_gateway::{GatewayStats, SimulatedGateway};

/// Default tick interval between equity samples.
pub const DEFAULT_EQUITY_INTERVAL: u64 = 100;

// ---------------------------------------------------------------------------
// Router: the backtest's order gateway
// ---------------------------------------------------------------------------

/// Shared between the engine and every strategy's gateway handle. Holds the
/// last seen price per symbol, the simulated gateway, and the queue of
/// produced trades awaiting dispatch.
struct BacktestRouter {
    gateway: SimulatedGateway,
    current_prices: HashMap<String, f64>,
}

impl OrderGateway for BacktestRouter {
    fn send_order(&mut self, order: Order) -> Result<()> {
        // The limit price backstops symbols that have not ticked yet.
        let current = self
            .current_prices
            .get(&order.symbol)
            .copied()
            .unwrap_or(order.price);
        self.gateway.send_order(&order, current);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct BacktestEngine {
    router: Arc<Mutex<BacktestRouter>>,
    pending: Arc<Mutex<VecDeque<Trade>>>,
    strategies: IndexMap<String, Box<dyn Strategy>>,
    analyzers: IndexMap<String, PerformanceAnalyzer>,
    risk: Option<Arc<RiskManager>>,
    initial_capital: f64,
    record_equity_interval: u64,
    unrouted_trades: u64,
}

impl BacktestEngine {
    /// `record_equity_interval` is the tick count between equity samples;
    /// very sparse streams under-sample drawdown at large intervals.
    pub fn new(
        mut gateway: SimulatedGateway,
        initial_capital: f64,
        record_equity_interval: u64,
    ) -> Self {
        let pending: Arc<Mutex<VecDeque<Trade>>> = Arc::default();
        let queue = pending.clone();
        gateway.set_trade_callback(Box::new(move |trade| queue.lock().push_back(trade)));

        info!(
            initial_capital,
            record_equity_interval, "backtest engine initialised"
        );

        Self {
            router: Arc::new(Mutex::new(BacktestRouter {
                gateway,
                current_prices: HashMap::new(),
            })),
            pending,
            strategies: IndexMap::new(),
            analyzers: IndexMap::new(),
            risk: None,
            initial_capital,
            record_equity_interval: record_equity_interval.max(1),
            unrouted_trades: 0,
        }
    }

    /// Share one risk gate across all strategies added afterwards.
    pub fn set_risk_manager(&mut self, risk: Arc<RiskManager>) {
        self.risk = Some(risk);
    }

    /// Register a strategy. The engine injects itself as the gateway handle.
    pub fn add_strategy(&mut self, mut strategy: Box<dyn Strategy>) {
        let id = strategy.id();
        let handle: GatewayHandle = self.router.clone();
        strategy.core_mut().set_gateway(handle);
        if let Some(risk) = &self.risk {
            strategy.core_mut().set_risk_manager(risk.clone());
        }

        self.analyzers
            .insert(id.clone(), PerformanceAnalyzer::new(self.initial_capital));
        info!(strategy = %id, "strategy registered for backtest");
        self.strategies.insert(id, strategy);
    }

    /// Replay the tick stream to completion and produce one report per
    /// strategy, in registration order.
    pub fn run(&mut self, ticks: impl Iterator<Item = MarketData>) -> IndexMap<String, BacktestReport> {
        info!(strategies = ?self.strategies.keys().collect::<Vec<_>>(), "backtest started");

        let mut tick_count: u64 = 0;
        let mut start_time: Option<i64> = None;
        let mut end_time: i64 = 0;

        for md in ticks {
            tick_count += 1;
            let tick_time = md.exchange_time;
            start_time.get_or_insert(tick_time);
            end_time = tick_time;

            self.router
                .lock()
                .current_prices
                .insert(md.symbol.clone(), md.last_price);

            // Strategies see the tick in registration order; each one's fills
            // are applied as soon as its callback returns.
            for i in 0..self.strategies.len() {
                if let Some((_, strategy)) = self.strategies.get_index_mut(i) {
                    strategy.core_mut().set_now(tick_time);
                    let result = catch_unwind(AssertUnwindSafe(|| strategy.on_market_data(&md)));
                    if result.is_err() {
                        error!(
                            tick = tick_count,
                            symbol = %md.symbol,
                            "strategy callback panicked — tick aborted for this strategy"
                        );
                    }
                }
                self.dispatch_pending();
            }

            // Ledger marks happen after every strategy has seen the tick.
            for (_, strategy) in self.strategies.iter_mut() {
                strategy
                    .core_mut()
                    .portfolio
                    .mark(&md.symbol, md.last_price);
            }

            // Stop/target monitoring for holders of this symbol.
            for i in 0..self.strategies.len() {
                if let Some((_, strategy)) = self.strategies.get_index_mut(i) {
                    if strategy.core().position_volume(&md.symbol) != 0 {
                        strategy
                            .core_mut()
                            .check_risk_triggers(&md.symbol, md.last_price);
                    }
                }
                self.dispatch_pending();
            }

            if tick_count % self.record_equity_interval == 0 {
                self.record_equity(tick_time);
            }
            if tick_count % 10_000 == 0 {
                info!(ticks = tick_count, "backtest progress");
            }
        }

        // One final sample so the curve always ends at the last tick.
        if start_time.is_some() {
            self.record_equity(end_time);
        }

        info!(
            ticks = tick_count,
            unrouted = self.unrouted_trades,
            "backtest completed"
        );

        self.generate_reports(start_time.unwrap_or(0), if start_time.is_some() { end_time } else { 0 })
    }

    // -------------------------------------------------------------------------
    // Fill dispatch
    // -------------------------------------------------------------------------

    fn dispatch_pending(&mut self) {
        loop {
            let Some(trade) = self.pending.lock().pop_front() else {
                return;
            };

            let Some(strategy) = self.strategies.get_mut(&trade.strategy_id) else {
                warn!(
                    strategy = %trade.strategy_id,
                    order_id = %trade.order_id,
                    "trade for unknown strategy discarded"
                );
                self.unrouted_trades += 1;
                continue;
            };

            if trade.is_filled() {
                let realized = strategy.core_mut().portfolio.apply_trade(&trade);

                if let Some(risk) = &self.risk {
                    risk.update_pnl(realized);
                    // Refresh (or clear) the risk gate's view of the position.
                    match strategy.core().portfolio.position(&trade.symbol) {
                        Some(pos) if pos.volume != 0 => {
                            let side = if pos.volume > 0 { Side::Buy } else { Side::Sell };
                            risk.on_fill(&trade.symbol, pos.avg_price, pos.volume.abs(), side);
                        }
                        _ => risk.on_fill(&trade.symbol, 0.0, 0, trade.side),
                    }
                }
            }

            if let Some(analyzer) = self.analyzers.get_mut(&trade.strategy_id) {
                analyzer.record_trade(&trade);
            }

            let result = catch_unwind(AssertUnwindSafe(|| strategy.on_trade(&trade)));
            if result.is_err() {
                error!(
                    strategy = %trade.strategy_id,
                    order_id = %trade.order_id,
                    "on_trade panicked — report dropped for this strategy"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // Equity + reports
    // -------------------------------------------------------------------------

    fn record_equity(&mut self, timestamp: i64) {
        for (id, strategy) in &self.strategies {
            let equity = self.initial_capital + strategy.core().total_pnl();
            if let Some(analyzer) = self.analyzers.get_mut(id) {
                analyzer.record_equity(timestamp, equity);
            }
        }
    }

    fn generate_reports(&self, start_time: i64, end_time: i64) -> IndexMap<String, BacktestReport> {
        let gateway_stats: GatewayStats = self.router.lock().gateway.stats().clone();
        let mut reports = IndexMap::new();

        for (id, strategy) in &self.strategies {
            let portfolio = &strategy.core().portfolio;
            let total_pnl = portfolio.total_pnl();
            let realized = portfolio.total_realized();
            let unrealized = total_pnl - realized;
            let final_equity = self.initial_capital + total_pnl;

            let analyzer = &self.analyzers[id];
            let report = analyzer.generate_report(
                id,
                start_time,
                end_time,
                final_equity,
                realized,
                unrealized,
                &gateway_stats,
            );
            info!(
                strategy = %id,
                total_return = report.total_return,
                trades = report.total_trades,
                sharpe = report.sharpe_ratio,
                max_drawdown = report.max_drawdown,
                "report generated"
            );
            reports.insert(id.clone(), report);
        }

        reports
    }
}
