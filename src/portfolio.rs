// =============================================================================
// Portfolio Ledger — per-symbol positions with average-cost accounting
// =============================================================================
//
// Position update rules for a FILLED trade with signed delta
// `d = volume (BUY) / -volume (SELL)` against an existing `(v, avg)`:
//
//   opening / adding (v == 0 or same sign):
//       v' = v + d,  avg' = (|v|*avg + |d|*price) / |v'|
//   reducing / reversing (opposite sign):
//       c = min(|d|, |v|) closes at pnl = (price - avg) * c * sign(v);
//       a reversal re-opens the remainder at avg' = price.
//
// Commission is always deducted from realized PnL, whatever the direction.
// Each trade must be applied exactly once; the ledger does not deduplicate.
//
// Invariants held after every operation:
//   - volume == 0  =>  avg_price == 0 and unrealized_pnl == 0
//   - sum(position.realized_pnl) == total_realized
// =============================================================================

use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::types::Trade;

/// Net holding in one instrument. Positive volume = long, negative = short.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Position {
    pub symbol: String,
    pub volume: i64,
    /// Volume-weighted average entry price. Zero when flat.
    pub avg_price: f64,
    pub unrealized_pnl: f64,
    /// Cumulative realized PnL, net of commission.
    pub realized_pnl: f64,
}

impl Position {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            volume: 0,
            avg_price: 0.0,
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
        }
    }
}

/// Per-strategy ledger: one Position per traded symbol, created lazily.
///
/// Positions iterate in insertion order so that floating-point sums are
/// reproducible run to run.
#[derive(Debug, Default)]
pub struct Portfolio {
    positions: IndexMap<String, Position>,
    /// Cash delta: commissions paid so far (negative).
    pub cash: f64,
    total_realized: f64,
}

impl Portfolio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one FILLED trade and return its realized PnL contribution
    /// (net of commission). Rejected trades contribute nothing.
    pub fn apply_trade(&mut self, trade: &Trade) -> f64 {
        if !trade.is_filled() {
            warn!(order_id = %trade.order_id, "apply_trade called with a non-filled trade");
            return 0.0;
        }

        let pos = self
            .positions
            .entry(trade.symbol.clone())
            .or_insert_with(|| Position::new(&trade.symbol));

        let delta = trade.side.sign() * trade.filled_volume;
        let price = trade.filled_price;
        let mut realized = 0.0;

        if pos.volume == 0 || pos.volume.signum() == delta.signum() {
            // Opening or adding: re-average the entry price.
            let total_cost =
                pos.avg_price * pos.volume.abs() as f64 + price * delta.abs() as f64;
            pos.volume += delta;
            pos.avg_price = if pos.volume != 0 {
                total_cost / pos.volume.abs() as f64
            } else {
                0.0
            };
        } else {
            // Reducing or reversing: realize PnL on the closed quantity.
            let closed = delta.abs().min(pos.volume.abs());
            realized = (price - pos.avg_price) * closed as f64 * pos.volume.signum() as f64;

            let crossed = delta.abs() > pos.volume.abs();
            pos.volume += delta;
            if crossed {
                // The remainder opens in the opposite direction at the fill price.
                pos.avg_price = price;
            } else if pos.volume == 0 {
                pos.avg_price = 0.0;
                pos.unrealized_pnl = 0.0;
            }
        }

        realized -= trade.commission;
        pos.realized_pnl += realized;
        self.total_realized += realized;
        self.cash -= trade.commission;

        debug!(
            symbol = %trade.symbol,
            side = %trade.side,
            volume = trade.filled_volume,
            price,
            position = pos.volume,
            avg = pos.avg_price,
            realized,
            "trade applied to ledger"
        );

        realized
    }

    /// Re-value the unrealized PnL of `symbol` against `price`.
    pub fn mark(&mut self, symbol: &str, price: f64) {
        if let Some(pos) = self.positions.get_mut(symbol) {
            if pos.volume != 0 {
                pos.unrealized_pnl = (price - pos.avg_price) * pos.volume as f64;
            }
        }
    }

    /// Read-only snapshot of the position in `symbol`, if one exists.
    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Signed volume held in `symbol` (0 when never traded).
    pub fn volume(&self, symbol: &str) -> i64 {
        self.positions.get(symbol).map_or(0, |p| p.volume)
    }

    /// All positions, in first-traded order.
    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Cumulative realized PnL across all positions, net of commission.
    pub fn total_realized(&self) -> f64 {
        self.total_realized
    }

    /// Realized plus unrealized PnL across all positions.
    pub fn total_pnl(&self) -> f64 {
        let unrealized: f64 = self.positions.values().map(|p| p.unrealized_pnl).sum();
        self.total_realized + unrealized
    }
}
