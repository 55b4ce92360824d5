// =============================================================================
// Momentum Breakout Strategy
// =============================================================================
//
// Keeps a rolling window of the last `lookback_period` prices and volumes.
// The signal is the z-score of the latest one-period return against the
// window's return distribution:
//
//   z = (r_last - mean(r)) / stdev(r)
//
// BUY when z breaks above the threshold with the volume ratio confirming
// (latest volume vs the window average) while flat; SELL the held volume when
// momentum reverses below the negative threshold. A percent stop-loss and
// take-profit guard the open position.
// =============================================================================

use std::collections::VecDeque;

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::StrategyConfig;
use crate::types::{MarketData, Side, Trade};

use super::{parse_params, Strategy, StrategyCore};

fn default_lookback_period() -> usize {
    20
}

fn default_breakout_threshold() -> f64 {
    1.5
}

fn default_volume_threshold() -> f64 {
    1.2
}

fn default_order_amount() -> f64 {
    150.0
}

fn default_max_position_value() -> f64 {
    1500.0
}

fn default_stop_loss_percent() -> f64 {
    4.0
}

fn default_take_profit_percent() -> f64 {
    8.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct MomentumParams {
    #[serde(default = "default_lookback_period")]
    pub lookback_period: usize,
    /// Z-score a return must exceed to count as a breakout.
    #[serde(default = "default_breakout_threshold")]
    pub breakout_threshold: f64,
    /// Latest volume over window average required to confirm the breakout.
    #[serde(default = "default_volume_threshold")]
    pub volume_threshold: f64,
    #[serde(default = "default_order_amount")]
    pub order_amount: f64,
    #[serde(default = "default_max_position_value")]
    pub max_position_value: f64,
    #[serde(default = "default_stop_loss_percent")]
    pub stop_loss_percent: f64,
    #[serde(default = "default_take_profit_percent")]
    pub take_profit_percent: f64,
}

pub struct MomentumStrategy {
    core: StrategyCore,
    symbol: String,
    params: MomentumParams,
    prices: VecDeque<f64>,
    volumes: VecDeque<f64>,
    in_position: bool,
}

impl MomentumStrategy {
    pub fn new(strategy_id: &str, symbol: &str, params: MomentumParams) -> Self {
        info!(
            strategy = strategy_id,
            symbol,
            lookback = params.lookback_period,
            breakout_threshold = params.breakout_threshold,
            volume_threshold = params.volume_threshold,
            "momentum strategy initialised"
        );
        Self {
            core: StrategyCore::new(strategy_id),
            symbol: symbol.to_string(),
            prices: VecDeque::with_capacity(params.lookback_period + 1),
            volumes: VecDeque::with_capacity(params.lookback_period + 1),
            params,
            in_position: false,
        }
    }

    pub fn from_config(config: &StrategyConfig) -> crate::error::Result<Self> {
        let params: MomentumParams = parse_params(config)?;
        Ok(Self::new(&config.name, &config.symbol, params))
    }

    /// Z-score of the latest one-period return against the window.
    fn momentum(&self) -> f64 {
        if self.prices.len() < 2 {
            return 0.0;
        }
        let returns: Vec<f64> = self
            .prices
            .iter()
            .zip(self.prices.iter().skip(1))
            .map(|(prev, next)| (next - prev) / prev)
            .collect();

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            (returns[returns.len() - 1] - mean) / std_dev
        } else {
            0.0
        }
    }

    /// Latest volume relative to the average of the rest of the window.
    fn volume_ratio(&self) -> f64 {
        if self.volumes.len() < 2 {
            return 1.0;
        }
        let head = self.volumes.len() - 1;
        let avg: f64 = self.volumes.iter().take(head).sum::<f64>() / head as f64;
        if avg > 0.0 {
            self.volumes[head] / avg
        } else {
            1.0
        }
    }
}

impl Strategy for MomentumStrategy {
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

        self.prices.push_back(price);
        self.volumes.push_back(md.volume);
        if self.prices.len() > self.params.lookback_period {
            self.prices.pop_front();
        }
        if self.volumes.len() > self.params.lookback_period {
            self.volumes.pop_front();
        }
        if self.prices.len() < self.params.lookback_period {
            return;
        }

        let momentum = self.momentum();
        let volume_ratio = self.volume_ratio();
        let symbol = self.symbol.clone();
        let held = self.core.position_volume(&symbol);

        if !self.in_position
            && momentum > self.params.breakout_threshold
            && volume_ratio > self.params.volume_threshold
        {
            let current_value = if held > 0 { held as f64 * price } else { 0.0 };
            if current_value < self.params.max_position_value {
                let volume = (self.params.order_amount / price).max(1.0) as i64;
                info!(
                    strategy = %self.core.strategy_id,
                    momentum,
                    volume_ratio,
                    price,
                    "momentum breakout — buying"
                );
                if self.core.send_order(&symbol, Side::Buy, price, volume).is_some() {
                    self.in_position = true;
                }
            }
        } else if self.in_position && momentum < -self.params.breakout_threshold && held > 0 {
            info!(
                strategy = %self.core.strategy_id,
                momentum,
                price,
                "momentum reversal — selling"
            );
            if self.core.send_order(&symbol, Side::Sell, price, held).is_some() {
                self.in_position = false;
            }
        }

        // Embedded stop / target on the open position. Guarded by the flag so
        // a reversal exit and the stop cannot both fire on one tick while the
        // fill is still in flight.
        if !self.in_position {
            return;
        }
        if let Some(pos) = self.core.portfolio.position(&symbol) {
            if pos.volume > 0 && pos.avg_price > 0.0 {
                let pnl_percent = (price - pos.avg_price) / pos.avg_price * 100.0;
                let volume = pos.volume;
                if pnl_percent <= -self.params.stop_loss_percent {
                    warn!(
                        strategy = %self.core.strategy_id,
                        pnl_percent,
                        "momentum stop loss — flattening"
                    );
                    if self.core.send_order(&symbol, Side::Sell, price, volume).is_some() {
                        self.in_position = false;
                    }
                } else if pnl_percent >= self.params.take_profit_percent {
                    info!(
                        strategy = %self.core.strategy_id,
                        pnl_percent,
                        "momentum take profit — flattening"
                    );
                    if self.core.send_order(&symbol, Side::Sell, price, volume).is_some() {
                        self.in_position = false;
                    }
                }
            }
        }
    }

    fn on_trade(&mut self, trade: &Trade) {
        if trade.is_filled() {
            if let Some(pos) = self.core.portfolio.position(&self.symbol) {
                info!(
                    strategy = %self.core.strategy_id,
                    volume = pos.volume,
                    avg = pos.avg_price,
                    pnl = pos.realized_pnl + pos.unrealized_pnl,
                    "momentum position updated"
                );
            }
        } else {
            // A rejected entry leaves us flat; re-arm so the next breakout
            // can fire.
            if self.core.position_volume(&self.symbol) == 0 {
                self.in_position = false;
            }
            warn!(
                strategy = %self.core.strategy_id,
                order_id = %trade.order_id,
                error = %trade.error_message,
                "momentum order rejected"
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
        MomentumStrategy,
        std::sync::Arc<parking_lot::Mutex<Vec<crate::types::Order>>>,
    ) {
        let (gw, orders) = RecordingGateway::new();
        let mut s = MomentumStrategy::new(
            "mom_test",
            "SOLUSDT",
            MomentumParams {
                lookback_period: 10,
                breakout_threshold: 1.5,
                volume_threshold: 1.2,
                order_amount: 150.0,
                max_position_value: 1500.0,
                stop_loss_percent: 4.0,
                take_profit_percent: 8.0,
            },
        );
        s.core_mut().set_gateway(gateway_handle(gw));
        (s, orders)
    }

    fn feed(s: &mut MomentumStrategy, price: f64, volume: f64, t: i64) {
        s.on_market_data(&tick("SOLUSDT", price, volume, t));
    }

    #[test]
    fn no_orders_during_warmup() {
        let (mut s, orders) = strategy();
        for i in 0..9 {
            feed(&mut s, 100.0, 1.0, i);
        }
        assert!(orders.lock().is_empty());
    }

    #[test]
    fn breakout_with_volume_spike_buys() {
        let (mut s, orders) = strategy();
        // Flat-ish noise to build the window, then a sharp up-move on heavy
        // volume.
        let noise = [100.0, 100.1, 99.9, 100.05, 99.95, 100.0, 100.1, 99.9, 100.0];
        for (i, p) in noise.iter().enumerate() {
            feed(&mut s, *p, 1.0, i as i64);
        }
        feed(&mut s, 103.0, 5.0, 100);

        let orders = orders.lock();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].volume, 1); // 150 quote / 103 price
    }

    #[test]
    fn breakout_without_volume_confirmation_is_ignored() {
        let (mut s, orders) = strategy();
        let noise = [100.0, 100.1, 99.9, 100.05, 99.95, 100.0, 100.1, 99.9, 100.0];
        for (i, p) in noise.iter().enumerate() {
            feed(&mut s, *p, 1.0, i as i64);
        }
        // Same price spike, but volume stays at the window average.
        feed(&mut s, 103.0, 1.0, 100);
        assert!(orders.lock().is_empty());
    }

    #[test]
    fn reversal_sells_the_held_volume() {
        let (mut s, orders) = strategy();
        let noise = [100.0, 100.1, 99.9, 100.05, 99.95, 100.0, 100.1, 99.9, 100.0];
        for (i, p) in noise.iter().enumerate() {
            feed(&mut s, *p, 1.0, i as i64);
        }
        feed(&mut s, 103.0, 5.0, 100);
        let buy = orders.lock()[0].clone();
        deliver_fill(&mut s, &fill_for(&buy));

        // Drift so the stop/target stay clear, then a sharp down-move.
        for (i, p) in [103.1, 103.0, 102.9, 103.0, 102.9].iter().enumerate() {
            feed(&mut s, *p, 1.0, 200 + i as i64);
        }
        feed(&mut s, 100.5, 5.0, 300);

        let orders = orders.lock();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].side, Side::Sell);
        assert_eq!(orders[1].volume, buy.volume);
    }

    #[test]
    fn stop_loss_flattens_long() {
        let (mut s, orders) = strategy();
        let noise = [100.0, 100.1, 99.9, 100.05, 99.95, 100.0, 100.1, 99.9, 100.0];
        for (i, p) in noise.iter().enumerate() {
            feed(&mut s, *p, 1.0, i as i64);
        }
        feed(&mut s, 103.0, 5.0, 100);
        let buy = orders.lock()[0].clone();
        deliver_fill(&mut s, &fill_for(&buy));

        // 5% below the entry crosses the 4% stop. The move is also a negative
        // breakout, either path must flatten exactly once.
        feed(&mut s, buy.price * 0.95, 1.0, 200);

        let orders = orders.lock();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[1].side, Side::Sell);
        assert_eq!(orders[1].volume, buy.volume);
        assert!(!s.in_position);
    }
}
