// =============================================================================
// EMA Cross Strategy
// =============================================================================
//
// Two exponential moving averages over the tick stream:
//
//   alpha = 2 / (period + 1)
//   ema   = alpha * price + (1 - alpha) * ema_prev     (seeded with the
//                                                       first price)
//
// Golden cross (fast rises through slow) while flat or short -> BUY.
// Death cross (fast falls through slow) while long -> SELL the held volume.
// =============================================================================

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::StrategyConfig;
use crate::types::{MarketData, Side, Trade};

use super::{parse_params, Strategy, StrategyCore};

/// Incrementally updated exponential moving average.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f64,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            alpha: 2.0 / (period as f64 + 1.0),
            value: None,
        }
    }

    pub fn update(&mut self, price: f64) -> f64 {
        let next = match self.value {
            None => price,
            Some(prev) => self.alpha * price + (1.0 - self.alpha) * prev,
        };
        self.value = Some(next);
        next
    }

    pub fn get(&self) -> f64 {
        self.value.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cross {
    Golden,
    Death,
}

fn default_fast_period() -> usize {
    5
}

fn default_slow_period() -> usize {
    20
}

fn default_trade_volume() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmaCrossParams {
    #[serde(default = "default_fast_period")]
    pub fast_period: usize,
    #[serde(default = "default_slow_period")]
    pub slow_period: usize,
    #[serde(default = "default_trade_volume")]
    pub trade_volume: i64,
}

pub struct EmaCrossStrategy {
    core: StrategyCore,
    symbol: String,
    params: EmaCrossParams,
    ema_fast: Ema,
    ema_slow: Ema,
    last_cross: Option<Cross>,
}

impl EmaCrossStrategy {
    pub fn new(strategy_id: &str, symbol: &str, params: EmaCrossParams) -> Self {
        info!(
            strategy = strategy_id,
            symbol,
            fast = params.fast_period,
            slow = params.slow_period,
            trade_volume = params.trade_volume,
            "EMA cross strategy initialised"
        );
        Self {
            core: StrategyCore::new(strategy_id),
            symbol: symbol.to_string(),
            ema_fast: Ema::new(params.fast_period),
            ema_slow: Ema::new(params.slow_period),
            params,
            last_cross: None,
        }
    }

    pub fn from_config(config: &StrategyConfig) -> crate::error::Result<Self> {
        let params: EmaCrossParams = parse_params(config)?;
        Ok(Self::new(&config.name, &config.symbol, params))
    }
}

impl Strategy for EmaCrossStrategy {
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
        let fast = self.ema_fast.update(price);
        let slow = self.ema_slow.update(price);

        let current = if fast > slow { Cross::Golden } else { Cross::Death };
        let symbol = self.symbol.clone();
        let held = self.core.position_volume(&symbol);

        match (self.last_cross, current) {
            (Some(Cross::Death), Cross::Golden) if held <= 0 => {
                info!(
                    strategy = %self.core.strategy_id,
                    fast,
                    slow,
                    price,
                    "golden cross — buying"
                );
                let volume = self.params.trade_volume;
                self.core.send_order(&symbol, Side::Buy, price, volume);
            }
            (Some(Cross::Golden), Cross::Death) if held > 0 => {
                info!(
                    strategy = %self.core.strategy_id,
                    fast,
                    slow,
                    price,
                    "death cross — selling"
                );
                self.core.send_order(&symbol, Side::Sell, price, held);
            }
            _ => {}
        }

        self.last_cross = Some(current);
    }

    fn on_trade(&mut self, trade: &Trade) {
        if trade.is_filled() {
            if let Some(pos) = self.core.portfolio.position(&self.symbol) {
                info!(
                    strategy = %self.core.strategy_id,
                    symbol = %self.symbol,
                    volume = pos.volume,
                    avg = pos.avg_price,
                    unrealized = pos.unrealized_pnl,
                    "position updated"
                );
            }
        } else {
            warn!(
                strategy = %self.core.strategy_id,
                order_id = %trade.order_id,
                error = %trade.error_message,
                "order rejected"
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

    fn strategy() -> (EmaCrossStrategy, std::sync::Arc<parking_lot::Mutex<Vec<crate::types::Order>>>) {
        let (gw, orders) = RecordingGateway::new();
        let mut s = EmaCrossStrategy::new(
            "ema_test",
            "BTCUSDT",
            EmaCrossParams {
                fast_period: 3,
                slow_period: 10,
                trade_volume: 1,
            },
        );
        s.core_mut().set_gateway(gateway_handle(gw));
        (s, orders)
    }

    #[test]
    fn ema_seeds_with_first_price_and_converges() {
        let mut ema = Ema::new(3); // alpha = 0.5
        assert_eq!(ema.update(10.0), 10.0);
        assert_eq!(ema.update(20.0), 15.0);
        assert_eq!(ema.update(20.0), 17.5);
        assert_eq!(ema.get(), 17.5);
    }

    #[test]
    fn ramp_up_then_down_emits_exactly_one_buy_and_one_sell() {
        let (mut s, orders) = strategy();

        // Falling ramp establishes a death cross, rising ramp produces the
        // golden cross (BUY), falling again produces the death cross (SELL).
        let mut t = 0i64;
        let mut feed = |s: &mut EmaCrossStrategy, price: f64| {
            t += 1;
            s.on_market_data(&tick("BTCUSDT", price, 1.0, t));
        };

        for i in 0..30 {
            feed(&mut s, 100.0 - i as f64);
        }
        for i in 0..30 {
            feed(&mut s, 70.0 + 2.0 * i as f64);
        }
        // Simulate the BUY fill before the reversal so the position is long.
        {
            let buy = orders.lock()[0].clone();
            deliver_fill(&mut s, &fill_for(&buy));
        }
        for i in 0..30 {
            feed(&mut s, 130.0 - 2.0 * i as f64);
        }

        let orders = orders.lock();
        assert_eq!(orders.len(), 2, "expected exactly BUY then SELL");
        assert_eq!(orders[0].side, Side::Buy);
        assert_eq!(orders[0].volume, 1);
        assert_eq!(orders[1].side, Side::Sell);
        assert_eq!(orders[1].volume, 1);
    }

    #[test]
    fn signals_repeat_across_full_cycles() {
        let (mut s, orders) = strategy();

        let mut t = 0i64;
        let mut feed = |s: &mut EmaCrossStrategy, price: f64| {
            t += 1;
            s.on_market_data(&tick("BTCUSDT", price, 1.0, t));
        };

        // Cycle one: death-cross warmup, golden cross buys.
        for i in 0..30 {
            feed(&mut s, 100.0 - i as f64);
        }
        for i in 0..30 {
            feed(&mut s, 70.0 + 2.0 * i as f64);
        }
        assert_eq!(orders.lock().len(), 1);
        let buy = orders.lock()[0].clone();
        deliver_fill(&mut s, &fill_for(&buy));

        // Reversal: death cross sells the long.
        for i in 0..30 {
            feed(&mut s, 130.0 - 2.0 * i as f64);
        }
        let sell = orders.lock()[1].clone();
        deliver_fill(&mut s, &fill_for(&sell));

        // Flat again, so the next golden cross buys once more.
        for i in 0..30 {
            feed(&mut s, 70.0 + 2.0 * i as f64);
        }
        assert_eq!(orders.lock().len(), 3);
        assert_eq!(orders.lock()[2].side, Side::Buy);
    }

    #[test]
    fn other_symbols_are_ignored() {
        let (mut s, orders) = strategy();
        for i in 0..100 {
            s.on_market_data(&tick("ETHUSDT", 100.0 + i as f64, 1.0, i));
        }
        assert!(orders.lock().is_empty());
    }
}
