// =============================================================================
// Risk Gate — pre-trade checks and stop/target monitoring
// =============================================================================
//
// Pre-trade rejection rules, evaluated in order (first match wins):
//   1. Daily Loss      — cumulative daily PnL at or below the loss ceiling.
//   2. Max Positions   — order opens a new symbol while at the position cap.
//   3. Position Size   — order notional above capital * max_position_pct.
//   4. Total Exposure  — aggregate notional above capital * max_total_position_pct.
//
// Post-fill monitoring tracks every open position's stop and target price;
// `mark` evaluates them on each tick and hands back a close signal when one
// is crossed.
//
// Daily statistics reset lazily: the first call of any method after the local
// calendar date advances zeroes the counters. This is the gate's only clock
// dependency.
// =============================================================================

use chrono::{Local, NaiveDate};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::RiskReason;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

fn default_stop_loss_pct() -> f64 {
    0.02
}

fn default_take_profit_pct() -> f64 {
    0.05
}

fn default_max_position_pct() -> f64 {
    0.3
}

fn default_max_total_position_pct() -> f64 {
    0.8
}

fn default_daily_loss_limit() -> f64 {
    5000.0
}

fn default_max_positions() -> usize {
    5
}

fn default_enabled() -> bool {
    true
}

/// Risk limits, immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Stop-loss distance as a fraction of entry price (0.02 = 2 %).
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,

    /// Take-profit distance as a fraction of entry price.
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,

    /// Per-instrument maximum position as a fraction of capital.
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,

    /// Aggregate maximum position as a fraction of capital.
    #[serde(default = "default_max_total_position_pct")]
    pub max_total_position_pct: f64,

    /// Daily loss ceiling in absolute currency units.
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: f64,

    /// Maximum number of concurrently open instruments.
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,

    /// Master switch; when false every check passes.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: default_stop_loss_pct(),
            take_profit_pct: default_take_profit_pct(),
            max_position_pct: default_max_position_pct(),
            max_total_position_pct: default_max_total_position_pct(),
            daily_loss_limit: default_daily_loss_limit(),
            max_positions: default_max_positions(),
            enabled: default_enabled(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracked positions
// ---------------------------------------------------------------------------

/// Risk view of one open position.
#[derive(Debug, Clone, Serialize)]
pub struct PositionRisk {
    pub symbol: String,
    pub entry_price: f64,
    pub current_price: f64,
    /// Positive = long, negative = short.
    pub volume: i64,
    pub unrealized_pnl: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub should_close: bool,
    pub close_reason: String,
}

/// Serialisable snapshot of the gate's daily state.
#[derive(Debug, Clone, Serialize)]
pub struct RiskStats {
    pub initial_capital: f64,
    pub current_capital: f64,
    pub daily_pnl: f64,
    pub daily_trades: u64,
    pub active_positions: usize,
    pub daily_loss_limit: f64,
    pub daily_loss_remaining: f64,
}

// ---------------------------------------------------------------------------
// Internal mutable state (behind RwLock)
// ---------------------------------------------------------------------------

struct Inner {
    current_capital: f64,
    daily_pnl: f64,
    daily_trades: u64,
    last_reset: NaiveDate,
    positions: IndexMap<String, PositionRisk>,
}

// ---------------------------------------------------------------------------
// Risk Manager
// ---------------------------------------------------------------------------

/// Shared risk gate. One instance is typically shared by every strategy in a
/// process behind an `Arc`.
pub struct RiskManager {
    config: RiskConfig,
    initial_capital: f64,
    state: RwLock<Inner>,
}

impl RiskManager {
    pub fn new(config: RiskConfig, initial_capital: f64) -> Self {
        info!(
            stop_loss_pct = config.stop_loss_pct,
            take_profit_pct = config.take_profit_pct,
            max_position_pct = config.max_position_pct,
            max_total_position_pct = config.max_total_position_pct,
            daily_loss_limit = config.daily_loss_limit,
            max_positions = config.max_positions,
            enabled = config.enabled,
            initial_capital,
            "risk manager initialised"
        );

        Self {
            config,
            initial_capital,
            state: RwLock::new(Inner {
                current_capital: initial_capital,
                daily_pnl: 0.0,
                daily_trades: 0,
                last_reset: Local::now().date_naive(),
                positions: IndexMap::new(),
            }),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    // -------------------------------------------------------------------------
    // Pre-trade gate
    // -------------------------------------------------------------------------

    /// Validate an order before it reaches the gateway. `Ok(())` means the
    /// order may proceed; `Err` names the first rule it violated.
    pub fn pre_trade_check(
        &self,
        symbol: &str,
        side: Side,
        volume: i64,
        price: f64,
    ) -> Result<(), RiskReason> {
        self.maybe_reset_daily();

        if !self.config.enabled {
            return Ok(());
        }

        let s = self.state.read();

        // 1. Daily loss ceiling.
        if s.daily_pnl <= -self.config.daily_loss_limit {
            warn!(
                symbol,
                %side,
                daily_pnl = s.daily_pnl,
                limit = self.config.daily_loss_limit,
                "order rejected: daily loss limit reached"
            );
            return Err(RiskReason::DailyLoss);
        }

        // 2. Concurrent position cap (only for orders opening a new symbol).
        if !s.positions.contains_key(symbol) && s.positions.len() >= self.config.max_positions {
            warn!(
                symbol,
                open = s.positions.len(),
                max = self.config.max_positions,
                "order rejected: max positions reached"
            );
            return Err(RiskReason::MaxPositions);
        }

        // 3. Per-order notional.
        let notional = volume as f64 * price;
        let max_notional = s.current_capital * self.config.max_position_pct;
        if notional > max_notional {
            warn!(
                symbol,
                notional,
                max_notional,
                "order rejected: position size too large"
            );
            return Err(RiskReason::PositionSize);
        }

        // 4. Aggregate exposure across all tracked positions.
        let open_exposure: f64 = s
            .positions
            .values()
            .map(|r| (r.volume as f64 * r.current_price).abs())
            .sum();
        let total = open_exposure + notional;
        let max_total = s.current_capital * self.config.max_total_position_pct;
        if total > max_total {
            warn!(
                symbol,
                total_exposure = total,
                max_total,
                "order rejected: total exposure too large"
            );
            return Err(RiskReason::TotalExposure);
        }

        Ok(())
    }

    /// Daily-loss rule alone. Closing orders are gated on this instead of the
    /// full check so that exposure limits can never trap an open position.
    pub fn daily_loss_ok(&self) -> bool {
        self.maybe_reset_daily();
        if !self.config.enabled {
            return true;
        }
        self.state.read().daily_pnl > -self.config.daily_loss_limit
    }

    // -------------------------------------------------------------------------
    // Position tracking
    // -------------------------------------------------------------------------

    /// Register (or refresh) a tracked open position after a fill. A zero
    /// volume clears the entry — the position is closed.
    pub fn on_fill(&self, symbol: &str, entry_price: f64, volume: i64, side: Side) {
        self.maybe_reset_daily();
        let mut s = self.state.write();

        if volume == 0 {
            if s.positions.shift_remove(symbol).is_some() {
                debug!(symbol, "risk tracking cleared (position flat)");
            }
            return;
        }

        let (stop_loss_price, take_profit_price) = match side {
            Side::Buy => (
                entry_price * (1.0 - self.config.stop_loss_pct),
                entry_price * (1.0 + self.config.take_profit_pct),
            ),
            Side::Sell => (
                entry_price * (1.0 + self.config.stop_loss_pct),
                entry_price * (1.0 - self.config.take_profit_pct),
            ),
        };

        let signed_volume = side.sign() * volume.abs();
        s.positions.insert(
            symbol.to_string(),
            PositionRisk {
                symbol: symbol.to_string(),
                entry_price,
                current_price: entry_price,
                volume: signed_volume,
                unrealized_pnl: 0.0,
                stop_loss_price,
                take_profit_price,
                should_close: false,
                close_reason: String::new(),
            },
        );

        info!(
            symbol,
            entry_price,
            volume = signed_volume,
            stop_loss_price,
            take_profit_price,
            "risk tracking position"
        );
    }

    /// Re-value a tracked position against the latest tick and evaluate its
    /// stop and target. Returns the position (with `should_close` set and a
    /// human-readable reason) when a close is required.
    pub fn mark(&self, symbol: &str, price: f64) -> Option<PositionRisk> {
        if !self.config.enabled {
            return None;
        }
        self.maybe_reset_daily();
        let mut s = self.state.write();
        let risk = s.positions.get_mut(symbol)?;

        risk.current_price = price;
        risk.unrealized_pnl = (price - risk.entry_price) * risk.volume as f64;

        // Signal once per open: the closing order is in flight until the
        // next fill refreshes (or clears) this entry.
        if risk.should_close {
            return None;
        }

        let long = risk.volume > 0;
        let stop_hit = if long {
            price <= risk.stop_loss_price
        } else {
            price >= risk.stop_loss_price
        };
        let target_hit = if long {
            price >= risk.take_profit_price
        } else {
            price <= risk.take_profit_price
        };

        if stop_hit {
            risk.should_close = true;
            risk.close_reason = format!(
                "Stop Loss triggered: {:.2} crossed {:.2}",
                price, risk.stop_loss_price
            );
            warn!(symbol, price, stop = risk.stop_loss_price, "stop loss triggered");
            return Some(risk.clone());
        }
        if target_hit {
            risk.should_close = true;
            risk.close_reason = format!(
                "Take Profit triggered: {:.2} crossed {:.2}",
                price, risk.take_profit_price
            );
            info!(symbol, price, target = risk.take_profit_price, "take profit triggered");
            return Some(risk.clone());
        }

        None
    }

    // -------------------------------------------------------------------------
    // Daily counters
    // -------------------------------------------------------------------------

    /// Advance the daily PnL and trade counters with one realized result.
    pub fn update_pnl(&self, realized: f64) {
        self.maybe_reset_daily();
        let mut s = self.state.write();
        s.daily_pnl += realized;
        s.daily_trades += 1;
        s.current_capital += realized;
        debug!(
            realized,
            daily_pnl = s.daily_pnl,
            daily_trades = s.daily_trades,
            "daily risk counters advanced"
        );
    }

    // -------------------------------------------------------------------------
    // Sizing
    // -------------------------------------------------------------------------

    /// Suggested order volume for `symbol` at `price`, risking
    /// `risk_per_trade` of capital against the configured stop distance.
    pub fn suggest_size(&self, symbol: &str, price: f64, risk_per_trade: f64) -> i64 {
        self.maybe_reset_daily();

        if price <= 0.0 {
            return 0;
        }
        if !self.config.enabled {
            // Fixed-notional fallback when the gate is off.
            return (1000.0 / price) as i64;
        }

        let s = self.state.read();
        let stop_distance = price * self.config.stop_loss_pct;
        if stop_distance == 0.0 {
            return 0;
        }

        let risk_based = (s.current_capital * risk_per_trade) / stop_distance;
        let cap_based = s.current_capital * self.config.max_position_pct / price;
        let volume = risk_based.min(cap_based) as i64;

        debug!(symbol, price, volume, "position size suggested");
        volume.max(1)
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    pub fn stats(&self) -> RiskStats {
        self.maybe_reset_daily();
        let s = self.state.read();
        RiskStats {
            initial_capital: self.initial_capital,
            current_capital: s.current_capital,
            daily_pnl: s.daily_pnl,
            daily_trades: s.daily_trades,
            active_positions: s.positions.len(),
            daily_loss_limit: self.config.daily_loss_limit,
            daily_loss_remaining: self.config.daily_loss_limit + s.daily_pnl,
        }
    }

    // -------------------------------------------------------------------------
    // Internals
    // -------------------------------------------------------------------------

    /// Reset daily counters when the local calendar date has advanced since
    /// the last call.
    fn maybe_reset_daily(&self) {
        let today = Local::now().date_naive();
        {
            let s = self.state.read();
            if s.last_reset >= today {
                return;
            }
        }
        let mut s = self.state.write();
        // Re-check under the write lock; another caller may have reset.
        if s.last_reset < today {
            info!(
                previous_pnl = s.daily_pnl,
                previous_trades = s.daily_trades,
                date = %today,
                "date rolled — daily risk counters reset"
            );
            s.daily_pnl = 0.0;
            s.daily_trades = 0;
            s.last_reset = today;
        }
    }

    #[cfg(test)]
    fn backdate_last_reset(&self, days: i64) {
        let mut s = self.state.write();
        s.last_reset = s.last_reset - chrono::Duration::days(days);
    }
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("config", &self.config)
            .field("initial_capital", &self.initial_capital)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig::default(), 100_000.0)
    }

    #[test]
    fn accepts_order_within_all_limits() {
        let rm = manager();
        assert!(rm.pre_trade_check("BTCUSDT", Side::Buy, 1, 20_000.0).is_ok());
    }

    #[test]
    fn daily_loss_lockout_and_reset() {
        let rm = manager();
        rm.update_pnl(-3000.0);
        rm.update_pnl(-2500.0);

        let err = rm.pre_trade_check("BTCUSDT", Side::Buy, 1, 100.0).unwrap_err();
        assert_eq!(err, RiskReason::DailyLoss);

        // Once tripped, every further check on the same day rejects.
        let err = rm.pre_trade_check("ETHUSDT", Side::Sell, 1, 50.0).unwrap_err();
        assert_eq!(err, RiskReason::DailyLoss);

        // After the calendar date advances the counters reset and the same
        // order passes again.
        rm.backdate_last_reset(1);
        assert!(rm.pre_trade_check("BTCUSDT", Side::Buy, 1, 100.0).is_ok());
        assert_eq!(rm.stats().daily_trades, 0);
    }

    #[test]
    fn max_positions_only_blocks_new_symbols() {
        let config = RiskConfig {
            max_positions: 2,
            ..RiskConfig::default()
        };
        let rm = RiskManager::new(config, 100_000.0);
        rm.on_fill("AAA", 10.0, 1, Side::Buy);
        rm.on_fill("BBB", 10.0, 1, Side::Buy);

        let err = rm.pre_trade_check("CCC", Side::Buy, 1, 10.0).unwrap_err();
        assert_eq!(err, RiskReason::MaxPositions);

        // Adding to an already-open symbol is fine.
        assert!(rm.pre_trade_check("AAA", Side::Buy, 1, 10.0).is_ok());
    }

    #[test]
    fn position_size_limit() {
        let rm = manager();
        // 100k capital, 30% cap -> 30k max notional.
        let err = rm.pre_trade_check("BTCUSDT", Side::Buy, 1, 30_001.0).unwrap_err();
        assert_eq!(err, RiskReason::PositionSize);
        assert!(rm.pre_trade_check("BTCUSDT", Side::Buy, 1, 29_999.0).is_ok());
    }

    #[test]
    fn total_exposure_limit() {
        let rm = manager();
        // Two tracked positions of 30k notional each = 60k; an additional
        // 25k order breaks the 80% (80k) aggregate cap.
        rm.on_fill("AAA", 30_000.0, 1, Side::Buy);
        rm.on_fill("BBB", 30_000.0, 1, Side::Buy);

        let err = rm.pre_trade_check("CCC", Side::Buy, 1, 25_000.0).unwrap_err();
        assert_eq!(err, RiskReason::TotalExposure);
        assert!(rm.pre_trade_check("CCC", Side::Buy, 1, 15_000.0).is_ok());
    }

    #[test]
    fn stop_loss_trigger_long() {
        let rm = manager(); // stop_loss_pct = 0.02 -> stop at 98
        rm.on_fill("BTCUSDT", 100.0, 1, Side::Buy);

        assert!(rm.mark("BTCUSDT", 99.0).is_none());

        let signal = rm.mark("BTCUSDT", 97.5).expect("stop should trigger");
        assert!(signal.should_close);
        assert!(signal.close_reason.contains("Stop Loss"));
        assert_eq!(signal.volume, 1);
    }

    #[test]
    fn take_profit_trigger_long() {
        let rm = manager(); // take_profit_pct = 0.05 -> target at 105
        rm.on_fill("BTCUSDT", 100.0, 2, Side::Buy);

        assert!(rm.mark("BTCUSDT", 104.9).is_none());
        let signal = rm.mark("BTCUSDT", 105.2).expect("target should trigger");
        assert!(signal.close_reason.contains("Take Profit"));
        assert_eq!(signal.volume, 2);
    }

    #[test]
    fn stop_and_target_mirror_for_shorts() {
        let rm = manager();
        rm.on_fill("ETHUSDT", 100.0, 3, Side::Sell);

        // Short: stop above entry, target below.
        assert!(rm.mark("ETHUSDT", 101.0).is_none());
        let stop = rm.mark("ETHUSDT", 102.5).expect("short stop should trigger");
        assert!(stop.close_reason.contains("Stop Loss"));
        assert_eq!(stop.volume, -3);

        rm.on_fill("ETHUSDT", 100.0, 3, Side::Sell);
        let target = rm.mark("ETHUSDT", 94.0).expect("short target should trigger");
        assert!(target.close_reason.contains("Take Profit"));
    }

    #[test]
    fn close_signal_fires_once_per_open() {
        let rm = manager();
        rm.on_fill("BTCUSDT", 100.0, 1, Side::Buy);

        assert!(rm.mark("BTCUSDT", 97.0).is_some());
        // The close is in flight: no duplicate signal on further ticks.
        assert!(rm.mark("BTCUSDT", 96.0).is_none());

        // A fresh open re-arms the monitoring.
        rm.on_fill("BTCUSDT", 96.0, 1, Side::Buy);
        assert!(rm.mark("BTCUSDT", 90.0).is_some());
    }

    #[test]
    fn flat_fill_clears_tracking() {
        let rm = manager();
        rm.on_fill("BTCUSDT", 100.0, 1, Side::Buy);
        assert_eq!(rm.stats().active_positions, 1);

        rm.on_fill("BTCUSDT", 0.0, 0, Side::Sell);
        assert_eq!(rm.stats().active_positions, 0);
        assert!(rm.mark("BTCUSDT", 1.0).is_none());
    }

    #[test]
    fn suggested_size_respects_both_bounds() {
        let rm = manager();
        // risk-based: 100k * 0.01 / (100 * 0.02) = 500
        // cap-based: 100k * 0.3 / 100 = 300  -> min is 300
        assert_eq!(rm.suggest_size("BTCUSDT", 100.0, 0.01), 300);

        // Tiny risk budget: 100k * 0.0001 / 2 = 5
        assert_eq!(rm.suggest_size("BTCUSDT", 100.0, 0.0001), 5);
    }

    #[test]
    fn suggested_size_has_floor_of_one() {
        let rm = manager();
        // Very expensive instrument: both bounds fall below 1.
        assert_eq!(rm.suggest_size("BTCUSDT", 10_000_000.0, 0.0001), 1);
    }

    #[test]
    fn disabled_gate_passes_everything() {
        let config = RiskConfig {
            enabled: false,
            daily_loss_limit: 1.0,
            max_positions: 0,
            ..RiskConfig::default()
        };
        let rm = RiskManager::new(config, 1000.0);
        rm.update_pnl(-500.0);
        assert!(rm.pre_trade_check("BTCUSDT", Side::Buy, 100, 1000.0).is_ok());
        assert!(rm.mark("BTCUSDT", 1.0).is_none());
    }
}
