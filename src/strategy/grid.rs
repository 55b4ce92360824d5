// =============================================================================
// Grid Trading Strategy
// =============================================================================
//
// Anchors a center price on the first tick, then lays `grid_count` buy rungs
// below and sell rungs above at `price_range_percent / grid_count` spacing.
// A rung fires once when the price touches it and re-arms when its fill (or
// rejection) comes back, keyed by order id. A percent stop-loss and
// take-profit against the average entry flatten the position in trending
// markets the grid cannot absorb.
// =============================================================================

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::StrategyConfig;
use crate::types::{MarketData, Side, Trade};

use super::{parse_params, Strategy, StrategyCore};

fn default_grid_count() -> usize {
    10
}

fn default_price_range_percent() -> f64 {
    2.0
}

fn default_order_amount() -> f64 {
    100.0
}

fn default_max_position_value() -> f64 {
    5000.0
}

fn default_stop_loss_percent() -> f64 {
    5.0
}

fn default_take_profit_percent() -> f64 {
    10.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridParams {
    #[serde(default = "default_grid_count")]
    pub grid_count: usize,
    /// Half-width of the grid as a percentage of the center price.
    #[serde(default = "default_price_range_percent")]
    pub price_range_percent: f64,
    /// Quote-currency value of each rung's order.
    #[serde(default = "default_order_amount")]
    pub order_amount: f64,
    /// Cap on total position value before buy rungs stop firing.
    #[serde(default = "default_max_position_value")]
    pub max_position_value: f64,
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,
}

/// One price level of the grid.
#[derive(Debug, Clone)]
struct GridLevel {
    price: f64,
    volume: i64,
    /// Set while an order for this rung is in flight or filled; cleared when
    /// the matching trade report re-arms the rung.
    filled: bool,
    pending_order: Option<String>,
}

impl GridLevel {
    fn new(price: f64, order_amount: f64) -> Self {
        Self {
            price,
            volume: (order_amount / price).max(1.0) as i64,
            filled: false,
            pending_order: None,
        }
    }
}

pub struct GridStrategy {
    core: StrategyCore,
    symbol: String,
    params: GridParams,
    center_price: Option<f64>,
    buy_grids: Vec<GridLevel>,
    sell_grids: Vec<GridLevel>,
}

impl GridStrategy {
    pub fn new(strategy_id: &str, symbol: &str, params: GridParams) -> Self {
        info!(
            strategy = strategy_id,
            symbol,
            grid_count = params.grid_count,
            price_range_percent = params.price_range_percent,
            order_amount = params.order_amount,
            "grid strategy initialised"
        );
        Self {
            core: StrategyCore::new(strategy_id),
            symbol: symbol.to_string(),
            params,
            center_price: None,
            buy_grids: Vec::new(),
            sell_grids: Vec::new(),
        }
    }

    pub fn from_config(config: &StrategyConfig) -> crate::error::Result<Self> {
        let params: GridParams = parse_params(config)?;
        Ok(Self::new(&config.name, &config.symbol, params))
    }

    fn initialize_grids(&mut self, center: f64) {
        let step = center * self.params.price_range_percent / 100.0 / self.params.grid_count as f64;

        self.buy_grids = (1..=self.params.grid_count)
            .map(|i| GridLevel::new(center - step * i as f64, self.params.order_amount))
            .collect();
        self.sell_grids = (1..=self.params.grid_count)
            .map(|i| GridLevel::new(center + step * i as f64, self.params.order_amount))
            .collect();
        self.center_price = Some(center);

        info!(
            strategy = %self.core.strategy_id,
            center,
            lowest_buy = self.buy_grids.last().map(|g| g.price).unwrap_or(0.0),
            highest_sell = self.sell_grids.last().map(|g| g.price).unwrap_or(0.0),
            "grids anchored"
        );
    }

    /// Percent stop-loss / take-profit against the average entry.
    fn check_exit(&mut self, price: f64) {
        let Some(pos) = self.core.portfolio.position(&self.symbol) else {
            return;
        };
        if pos.volume <= 0 || pos.avg_price <= 0.0 {
            return;
        }
        let pnl_percent = (price - pos.avg_price) / pos.avg_price * 100.0;
        let volume = pos.volume;

        if pnl_percent <= -self.params.stop_loss_percent {
            warn!(
                strategy = %self.core.strategy_id,
                pnl_percent,
                "grid stop loss — flattening"
            );
            let symbol = self.symbol.clone();
            self.core.send_order(&symbol, Side::Sell, price, volume);
        } else if pnl_percent >= self.params.take_profit_percent {
            info!(
                strategy = %self.core.strategy_id,
                pnl_percent,
                "grid take profit — flattening"
            );
            let symbol = self.symbol.clone();
            self.core.send_order(&symbol, Side::Sell, price, volume);
        }
    }
}

impl Strategy for GridStrategy {
    fn core(&self) -> &StrategyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut StrategyCore {
        &mut self.core
    }

    fn on_market_data(&mut self, md: &MarketData) {
        if md.symbol != self.symbol {
            return;
        }
        let price = md.last_price;

        if self.center_price.is_none() {
            self.initialize_grids(price);
            return;
        }

        let symbol = self.symbol.clone();

        // Buy rungs fire when the price falls onto them.
        let position_value = self
            .core
            .portfolio
            .position(&symbol)
            .map(|p| p.volume as f64 * p.avg_price)
            .unwrap_or(0.0);
        let mut open_value = position_value;

        for i in 0..self.buy_grids.len() {
            let (rung_price, rung_volume, armed) = {
                let g = &self.buy_grids[i];
                (g.price, g.volume, !g.filled)
            };
            if armed && price <= rung_price {
                if open_value + self.params.order_amount > self.params.max_position_value {
                    continue;
                }
                info!(
                    strategy = %self.core.strategy_id,
                    rung = rung_price,
                    "buy rung touched"
                );
                if let Some(order_id) =
                    self.core.send_order(&symbol, Side::Buy, rung_price, rung_volume)
                {
                    let g = &mut self.buy_grids[i];
                    g.filled = true;
                    g.pending_order = Some(order_id);
                    open_value += self.params.order_amount;
                }
            }
        }

        // Sell rungs fire when the price rises onto them, inventory allowing.
        for i in 0..self.sell_grids.len() {
            let (rung_price, rung_volume, armed) = {
                let g = &self.sell_grids[i];
                (g.price, g.volume, !g.filled)
            };
            let held = self.core.position_volume(&symbol);
            if armed && price >= rung_price && held >= rung_volume {
                info!(
                    strategy = %self.core.strategy_id,
                    rung = rung_price,
                    "sell rung touched"
                );
                if let Some(order_id) =
                    self.core.send_order(&symbol, Side::Sell, rung_price, rung_volume)
                {
                    let g = &mut self.sell_grids[i];
                    g.filled = true;
                    g.pending_order = Some(order_id);
                }
            }
        }

        self.check_exit(price);
    }

    fn on_trade(&mut self, trade: &Trade) {
        // Re-arm the rung this trade belongs to (fills and rejections alike;
        // a rejected rung should get another chance).
        for g in self.buy_grids.iter_mut().chain(self.sell_grids.iter_mut()) {
            if g.pending_order.as_deref() == Some(trade.order_id.as_str()) {
                g.filled = false;
                g.pending_order = None;
                break;
            }
        }

        if trade.is_filled() {
            if let Some(pos) = self.core.portfolio.position(&self.symbol) {
                info!(
                    strategy = %self.core.strategy_id,
                    volume = pos.volume,
                    avg = pos.avg_price,
                    pnl = pos.realized_pnl + pos.unrealized_pnl,
                    "grid position updated"
                );
            }
        } else {
            warn!(
                strategy = %self.core.strategy_id,
                order_id = %trade.order_id,
                error = %trade.error_message,
                "grid order rejected"
            );
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::gateway_handle;
    use crate::strategy::testkit::*;

    fn strategy() -> (
        GridStrategy,
        std::sync::Arc<parking_lot::Mutex<Vec<crate::types::Order>>>,
    ) {
        let (gw, orders) = RecordingGateway::new();
        let mut s = GridStrategy::new(
            "grid_test",
            "BTCUSDT",
            GridParams {
                grid_count: 4,
                price_range_percent: 4.0,
                order_amount: 100.0,
                max_position_value: 10_000.0,
                stop_loss_percent: 5.0,
                take_profit_percent: 10.0,
            },
        );
        s.core_mut().set_gateway(gateway_handle(gw));
        (s, orders)
    }

    #[test]
    fn first_tick_anchors_without_trading() {
        let (mut s, orders) = strategy();
        s.on_market_data(&tick("BTCUSDT", 100.0, 1.0, 1));
        assert!(orders.lock().is_empty());
        assert_eq!(s.center_price, Some(100.0));
        assert_eq!(s.buy_grids.len(), 4);
        assert_eq!(s.sell_grids.len(), 4);
        // 4% half-width over 4 rungs -> 1% spacing.
        assert!((s.buy_grids[0].price - 99.0).abs() < 1e-9);
        assert!((s.sell_grids[0].price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn falling_price_fires_buy_rungs_once() {
        let (mut s, orders) = strategy();
        s.on_market_data(&tick("BTCUSDT", 100.0, 1.0, 1));

        // Price at 97.5 falls through the 99 and 98 rungs (not the 97 one).
        s.on_market_data(&tick("BTCUSDT", 97.5, 1.0, 2));
        assert_eq!(orders.lock().len(), 2);
        assert!(orders.lock().iter().all(|o| o.side == Side::Buy));

        // Same price again: rungs are disarmed until their fills return.
        s.on_market_data(&tick("BTCUSDT", 97.5, 1.0, 3));
        assert_eq!(orders.lock().len(), 2);
    }

    #[test]
    fn fill_rearms_the_rung_and_sell_rung_takes_profit() {
        let (mut s, orders) = strategy();
        s.on_market_data(&tick("BTCUSDT", 100.0, 1.0, 1));
        s.on_market_data(&tick("BTCUSDT", 99.0, 1.0, 2));

        let buy = orders.lock()[0].clone();
        deliver_fill(&mut s, &fill_for(&buy));
        assert!(!s.buy_grids[0].filled, "fill should re-arm the rung");
        assert_eq!(s.core.position_volume("BTCUSDT"), buy.volume);

        // Rising back through 101 fires the first sell rung.
        s.on_market_data(&tick("BTCUSDT", 101.0, 1.0, 3));
        let sells: Vec<_> = orders
            .lock()
            .iter()
            .filter(|o| o.side == Side::Sell)
            .cloned()
            .collect();
        assert_eq!(sells.len(), 1);
        assert!((sells[0].price - 101.0).abs() < 1e-9);
    }

    #[test]
    fn rejection_rearms_the_rung() {
        let (mut s, orders) = strategy();
        s.on_market_data(&tick("BTCUSDT", 100.0, 1.0, 1));
        s.on_market_data(&tick("BTCUSDT", 99.0, 1.0, 2));

        let buy = orders.lock()[0].clone();
        let mut rejection = fill_for(&buy);
        rejection.status = crate::types::TradeStatus::Rejected;
        rejection.error_code = 1001;
        rejection.error_message = "Simulated rejection".to_string();
        s.on_trade(&rejection);

        assert!(!s.buy_grids[0].filled);
        // The rung can fire again on the next touch.
        s.on_market_data(&tick("BTCUSDT", 99.0, 1.0, 3));
        assert_eq!(orders.lock().len(), 2);
    }

    #[test]
    fn stop_loss_flattens_the_position() {
        let (mut s, orders) = strategy();
        s.on_market_data(&tick("BTCUSDT", 100.0, 1.0, 1));
        s.on_market_data(&tick("BTCUSDT", 99.0, 1.0, 2));
        let buy = orders.lock()[0].clone();
        deliver_fill(&mut s, &fill_for(&buy));

        // 6% below the 99 entry crosses the 5% stop; all rungs below also
        // fire, so look for the flattening SELL specifically.
        s.on_market_data(&tick("BTCUSDT", 93.0, 1.0, 3));
        let sells: Vec<_> = orders
            .lock()
            .iter()
            .filter(|o| o.side == Side::Sell)
            .cloned()
            .collect();
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].volume, buy.volume);
    }
}
