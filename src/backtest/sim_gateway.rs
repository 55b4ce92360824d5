// =============================================================================
// Simulated Gateway — synchronous fill simulation for the backtest engine
// =============================================================================
//
// `send_order` turns an Order into exactly one Trade and hands it to the
// registered callback. Slippage, commission, and an optional random rejection
// are the only differences from an ideal fill:
//
//   NONE         filled = limit price
//   FIXED        filled = limit +/- slippage_value     (+ BUY, - SELL)
//   PERCENTAGE   filled = limit * (1 +/- slippage_value)
//   MARKET_DEPTH filled = current market price (placeholder model)
//
// Commission is taker-priced: filled * volume * taker_fee, floored by
// min_commission. The maker/taker distinction is configured but not applied.
//
// The rejection draw comes from an explicitly seeded ChaCha8 stream so a
// replay with the same seed produces the same fills, bit for bit. Trade ids
// are a plain counter for the same reason.
// =============================================================================

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::types::{Order, Side, Trade, TradeStatus};

/// Error code carried by simulated rejections.
pub const REJECT_ERROR_CODE: i64 = 1001;

/// How the fill price deviates from the limit price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlippageModel {
    None,
    Fixed,
    Percentage,
    MarketDepth,
}

/// Fee schedule. Everything is priced taker; the maker rate is carried for
/// configuration compatibility only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CommissionConfig {
    pub maker_fee: f64,
    pub taker_fee: f64,
    pub min_commission: f64,
}

impl Default for CommissionConfig {
    fn default() -> Self {
        Self {
            maker_fee: 0.0002,
            taker_fee: 0.0004,
            min_commission: 0.0,
        }
    }
}

/// Running totals over the simulated session.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GatewayStats {
    pub total_orders: u64,
    pub filled_orders: u64,
    pub rejected_orders: u64,
    pub total_commission: f64,
    pub total_slippage: f64,
}

impl GatewayStats {
    pub fn fill_rate(&self) -> f64 {
        if self.total_orders == 0 {
            0.0
        } else {
            self.filled_orders as f64 / self.total_orders as f64
        }
    }
}

pub type TradeCallback = Box<dyn FnMut(Trade) + Send>;

pub struct SimulatedGateway {
    slippage_model: SlippageModel,
    slippage_value: f64,
    commission: CommissionConfig,
    reject_rate: f64,
    /// Configured artificial fill delay. The replay loop is not wall-clock
    /// driven, so the backtest engine ignores it.
    pub fill_delay_ms: u64,
    rng: ChaCha8Rng,
    seq: u64,
    callback: Option<TradeCallback>,
    stats: GatewayStats,
}

impl SimulatedGateway {
    /// `seed` drives the rejection draw; the same seed over the same order
    /// flow reproduces the same fills.
    pub fn new(
        slippage_model: SlippageModel,
        slippage_value: f64,
        commission: CommissionConfig,
        reject_rate: f64,
        seed: u64,
    ) -> Self {
        info!(
            ?slippage_model,
            slippage_value,
            taker_fee = commission.taker_fee,
            min_commission = commission.min_commission,
            reject_rate,
            seed,
            "simulated gateway initialised"
        );
        Self {
            slippage_model,
            slippage_value,
            commission,
            reject_rate,
            fill_delay_ms: 0,
            rng: ChaCha8Rng::seed_from_u64(seed),
            seq: 0,
            callback: None,
            stats: GatewayStats::default(),
        }
    }

    pub fn set_trade_callback(&mut self, callback: TradeCallback) {
        self.callback = Some(callback);
    }

    pub fn stats(&self) -> &GatewayStats {
        &self.stats
    }

    /// Simulate the fill for `order` against the current market price and
    /// deliver the resulting Trade to the callback.
    pub fn send_order(&mut self, order: &Order, current_price: f64) {
        self.stats.total_orders += 1;

        if self.rng.gen::<f64>() < self.reject_rate {
            self.reject(order, "Simulated rejection");
            return;
        }

        let filled_price = self.filled_price(order, current_price);
        let commission = self.commission_for(order, filled_price);
        let slippage_cost = (filled_price - order.price).abs() * order.volume as f64;

        self.seq += 1;
        let trade = Trade {
            trade_id: format!("T{}", self.seq),
            order_id: order.order_id.clone(),
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            filled_price,
            filled_volume: order.volume,
            trade_time: order.timestamp,
            status: TradeStatus::Filled,
            error_code: 0,
            error_message: String::new(),
            is_retryable: false,
            commission,
        };

        self.stats.filled_orders += 1;
        self.stats.total_commission += commission;
        self.stats.total_slippage += slippage_cost;

        debug!(
            order_id = %order.order_id,
            side = %order.side,
            volume = order.volume,
            filled_price,
            slippage_cost,
            commission,
            "order filled"
        );

        if let Some(callback) = &mut self.callback {
            callback(trade);
        }
    }

    fn filled_price(&self, order: &Order, current_price: f64) -> f64 {
        let direction = match order.side {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        };
        match self.slippage_model {
            SlippageModel::None => order.price,
            SlippageModel::Fixed => order.price + direction * self.slippage_value,
            SlippageModel::Percentage => order.price * (1.0 + direction * self.slippage_value),
            // TODO: walk a book snapshot instead of echoing the last price.
            SlippageModel::MarketDepth => current_price,
        }
    }

    fn commission_for(&self, order: &Order, filled_price: f64) -> f64 {
        let commission = filled_price * order.volume as f64 * self.commission.taker_fee;
        commission.max(self.commission.min_commission)
    }

    fn reject(&mut self, order: &Order, reason: &str) {
        self.stats.rejected_orders += 1;
        self.seq += 1;

        let trade = Trade {
            trade_id: format!("T{}", self.seq),
            order_id: order.order_id.clone(),
            strategy_id: order.strategy_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            filled_price: 0.0,
            filled_volume: 0,
            trade_time: order.timestamp,
            status: TradeStatus::Rejected,
            error_code: REJECT_ERROR_CODE,
            error_message: reason.to_string(),
            is_retryable: false,
            commission: 0.0,
        };

        warn!(
            order_id = %order.order_id,
            side = %order.side,
            volume = order.volume,
            reason,
            "order rejected"
        );

        if let Some(callback) = &mut self.callback {
            callback(trade);
        }
    }
}

impl std::fmt::Debug for SimulatedGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedGateway")
            .field("slippage_model", &self.slippage_model)
            .field("slippage_value", &self.slippage_value)
            .field("reject_rate", &self.reject_rate)
            .field("stats", &self.stats)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;

    fn order(side: Side, price: f64, volume: i64) -> Order {
        Order {
            order_id: "s_1".to_string(),
            strategy_id: "s".to_string(),
            symbol: "BTCUSDT".to_string(),
            price,
            volume,
            side,
            timestamp: 12345,
        }
    }

    fn capture(gateway: &mut SimulatedGateway) -> Arc<Mutex<Vec<Trade>>> {
        let trades: Arc<Mutex<Vec<Trade>>> = Arc::default();
        let sink = trades.clone();
        gateway.set_trade_callback(Box::new(move |t| sink.lock().push(t)));
        trades
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 1e-9, "got {a}, expected {b}");
    }

    #[test]
    fn no_slippage_fills_at_limit() {
        let mut gw = SimulatedGateway::new(
            SlippageModel::None,
            0.0,
            CommissionConfig::default(),
            0.0,
            42,
        );
        let trades = capture(&mut gw);
        gw.send_order(&order(Side::Buy, 50_000.0, 1), 50_100.0);

        let trades = trades.lock();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].status, TradeStatus::Filled);
        assert_close(trades[0].filled_price, 50_000.0);
        assert_eq!(trades[0].trade_time, 12345);
        assert_eq!(trades[0].trade_id, "T1");
    }

    #[test]
    fn fixed_slippage_moves_against_the_order() {
        let mut gw = SimulatedGateway::new(
            SlippageModel::Fixed,
            2.5,
            CommissionConfig::default(),
            0.0,
            42,
        );
        let trades = capture(&mut gw);
        gw.send_order(&order(Side::Buy, 100.0, 1), 100.0);
        gw.send_order(&order(Side::Sell, 100.0, 1), 100.0);

        let trades = trades.lock();
        assert_close(trades[0].filled_price, 102.5);
        assert_close(trades[1].filled_price, 97.5);
    }

    #[test]
    fn percentage_slippage_scales_with_price() {
        let mut gw = SimulatedGateway::new(
            SlippageModel::Percentage,
            0.0005,
            CommissionConfig::default(),
            0.0,
            42,
        );
        let trades = capture(&mut gw);
        gw.send_order(&order(Side::Buy, 50_000.0, 1), 50_000.0);
        gw.send_order(&order(Side::Sell, 50_000.0, 1), 50_000.0);

        let trades = trades.lock();
        assert_close(trades[0].filled_price, 50_025.0);
        assert_close(trades[1].filled_price, 49_975.0);
    }

    #[test]
    fn market_depth_placeholder_uses_current_price() {
        let mut gw = SimulatedGateway::new(
            SlippageModel::MarketDepth,
            0.0,
            CommissionConfig::default(),
            0.0,
            42,
        );
        let trades = capture(&mut gw);
        gw.send_order(&order(Side::Buy, 100.0, 1), 101.5);
        assert_close(trades.lock()[0].filled_price, 101.5);
    }

    #[test]
    fn commission_is_taker_priced_with_floor() {
        let mut gw = SimulatedGateway::new(
            SlippageModel::None,
            0.0,
            CommissionConfig {
                maker_fee: 0.0002,
                taker_fee: 0.0004,
                min_commission: 5.0,
            },
            0.0,
            42,
        );
        let trades = capture(&mut gw);
        // 100 * 1 * 0.0004 = 0.04 -> floored to 5.0
        gw.send_order(&order(Side::Buy, 100.0, 1), 100.0);
        // 50_000 * 1 * 0.0004 = 20.0 -> above the floor
        gw.send_order(&order(Side::Buy, 50_000.0, 1), 50_000.0);

        let trades = trades.lock();
        assert_close(trades[0].commission, 5.0);
        assert_close(trades[1].commission, 20.0);
    }

    #[test]
    fn rejection_carries_code_1001_and_skips_fill_accounting() {
        let mut gw = SimulatedGateway::new(
            SlippageModel::None,
            0.0,
            CommissionConfig::default(),
            1.0, // reject everything
            42,
        );
        let trades = capture(&mut gw);
        gw.send_order(&order(Side::Buy, 100.0, 1), 100.0);

        let trades = trades.lock();
        assert_eq!(trades[0].status, TradeStatus::Rejected);
        assert_eq!(trades[0].error_code, REJECT_ERROR_CODE);
        assert_eq!(trades[0].filled_volume, 0);
        assert_close(trades[0].commission, 0.0);

        let stats = gw.stats();
        assert_eq!(stats.total_orders, 1);
        assert_eq!(stats.rejected_orders, 1);
        assert_eq!(stats.filled_orders, 0);
        assert_close(stats.fill_rate(), 0.0);
    }

    #[test]
    fn same_seed_same_rejection_sequence() {
        let run = |seed: u64| -> Vec<TradeStatus> {
            let mut gw = SimulatedGateway::new(
                SlippageModel::None,
                0.0,
                CommissionConfig::default(),
                0.3,
                seed,
            );
            let trades = capture(&mut gw);
            for _ in 0..50 {
                gw.send_order(&order(Side::Buy, 100.0, 1), 100.0);
            }
            let result = trades.lock().iter().map(|t| t.status).collect();
            result
        };

        assert_eq!(run(42), run(42));
        // A different seed should (overwhelmingly) diverge somewhere.
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn slippage_cost_accumulates() {
        let mut gw = SimulatedGateway::new(
            SlippageModel::Fixed,
            1.0,
            CommissionConfig::default(),
            0.0,
            42,
        );
        let _trades = capture(&mut gw);
        gw.send_order(&order(Side::Buy, 100.0, 3), 100.0);
        gw.send_order(&order(Side::Sell, 100.0, 2), 100.0);
        assert_close(gw.stats().total_slippage, 3.0 + 2.0);
    }
}
