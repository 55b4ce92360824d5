// =============================================================================
// Performance Analyzer — equity curve, trade statistics, report generation
// =============================================================================
//
// Records two append-only series during a replay: equity samples and filled
// trades. Every metric derives from them at report time:
//
//   returns        r_i = (e_i - e_{i-1}) / e_{i-1}
//   total return   (final - initial) / initial
//   annual return  total_return * 365 / duration_days (linear scaling, a
//                  documented simplification)
//   Sharpe         (mean(r) - rf/365) / stdev(r) * sqrt(365)
//   volatility     stdev(r) * sqrt(365)
//   max drawdown   running-peak scan, magnitude and peak-to-trough days
//
// Round-trip PnL pairs fills per symbol with the same signed average-entry
// model the portfolio ledger uses, so shorts pair correctly; each closing
// fill realizes (price - avg) * closed * sign minus that fill's commission.
//
// Single-threaded by design: only the engine task touches an analyzer.
// =============================================================================

use indexmap::IndexMap;
use serde::Serialize;
use tracing::info;

use crate::types::{Trade, TradeStatus};

use super::sim_gateway::GatewayStats;

const NS_PER_DAY: f64 = 86_400.0 * 1e9;

/// Annualized risk-free rate used in the Sharpe ratio.
const RISK_FREE_RATE: f64 = 0.02;

/// One point of the equity trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EquitySample {
    /// Nanoseconds since epoch.
    pub timestamp: i64,
    pub equity: f64,
}

/// Everything the backtest reports for one strategy.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub strategy_id: String,
    pub start_time: i64,
    pub end_time: i64,
    pub duration_days: f64,

    pub total_return: f64,
    pub annual_return: f64,
    pub total_pnl: f64,
    pub realized_pnl: f64,
    pub unrealized_pnl: f64,

    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub max_drawdown_duration_days: f64,
    pub volatility: f64,

    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,

    pub total_commission: f64,
    pub total_slippage: f64,

    pub avg_position_duration_hours: f64,
    pub max_position_size: i64,
}

impl BacktestReport {
    /// Human-readable report block for the console.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let rule = "=".repeat(80);
        out.push_str(&format!("\n{rule}\nBACKTEST REPORT - {}\n{rule}\n", self.strategy_id));
        out.push_str(&format!(
            "\n[Period]\n  Duration:          {:>10.1} days\n",
            self.duration_days
        ));
        out.push_str(&format!(
            "\n[Returns]\n  Total Return:      {:>10.2}%\n  Annual Return:     {:>10.2}%\n  \
             Total PnL:         ${:>10.2}\n  Realized PnL:      ${:>10.2}\n  \
             Unrealized PnL:    ${:>10.2}\n",
            self.total_return * 100.0,
            self.annual_return * 100.0,
            self.total_pnl,
            self.realized_pnl,
            self.unrealized_pnl,
        ));
        out.push_str(&format!(
            "\n[Risk]\n  Sharpe Ratio:      {:>10.2}\n  Max Drawdown:      {:>10.2}%\n  \
             Drawdown Duration: {:>10.1} days\n  Volatility (Ann):  {:>10.2}%\n",
            self.sharpe_ratio,
            self.max_drawdown * 100.0,
            self.max_drawdown_duration_days,
            self.volatility * 100.0,
        ));
        out.push_str(&format!(
            "\n[Trades]\n  Total:             {:>10}\n  Winning:           {:>10}\n  \
             Losing:            {:>10}\n  Win Rate:          {:>10.2}%\n  \
             Profit Factor:     {:>10.2}\n  Avg Win:           ${:>10.2}\n  \
             Avg Loss:          ${:>10.2}\n  Largest Win:       ${:>10.2}\n  \
             Largest Loss:      ${:>10.2}\n",
            self.total_trades,
            self.winning_trades,
            self.losing_trades,
            self.win_rate * 100.0,
            self.profit_factor,
            self.avg_win,
            self.avg_loss,
            self.largest_win,
            self.largest_loss,
        ));
        out.push_str(&format!(
            "\n[Costs]\n  Total Commission:  ${:>10.2}\n  Total Slippage:    ${:>10.2}\n",
            self.total_commission, self.total_slippage,
        ));
        out.push_str(&format!(
            "\n[Positions]\n  Avg Duration:      {:>10.1} hours\n  Max Size:          {:>10}\n\n{rule}\n",
            self.avg_position_duration_hours, self.max_position_size,
        ));
        out
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct PerformanceAnalyzer {
    initial_capital: f64,
    trades: Vec<Trade>,
    equity_curve: Vec<EquitySample>,
}

impl PerformanceAnalyzer {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            initial_capital,
            trades: Vec::new(),
            equity_curve: Vec::new(),
        }
    }

    /// Record a trade report. Only fills enter the statistics.
    pub fn record_trade(&mut self, trade: &Trade) {
        if trade.status == TradeStatus::Filled {
            self.trades.push(trade.clone());
        }
    }

    /// Append one equity sample.
    pub fn record_equity(&mut self, timestamp: i64, equity: f64) {
        self.equity_curve.push(EquitySample { timestamp, equity });
    }

    pub fn equity_curve(&self) -> &[EquitySample] {
        &self.equity_curve
    }

    /// Derive the full report. `realized`/`unrealized` come from the
    /// strategy's ledger, gateway stats carry the cost totals.
    pub fn generate_report(
        &self,
        strategy_id: &str,
        start_time: i64,
        end_time: i64,
        final_equity: f64,
        realized_pnl: f64,
        unrealized_pnl: f64,
        gateway_stats: &GatewayStats,
    ) -> BacktestReport {
        info!(strategy = strategy_id, "generating backtest report");

        let duration_days = ((end_time - start_time) as f64 / NS_PER_DAY).max(0.0);
        let total_pnl = final_equity - self.initial_capital;
        let total_return = total_pnl / self.initial_capital;
        let annual_return = if duration_days > 0.0 {
            total_return * (365.0 / duration_days)
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_duration_days) = self.max_drawdown();
        let trade_stats = self.trade_statistics();

        BacktestReport {
            strategy_id: strategy_id.to_string(),
            start_time,
            end_time,
            duration_days,
            total_return,
            annual_return,
            total_pnl,
            realized_pnl,
            unrealized_pnl,
            sharpe_ratio: self.sharpe_ratio(),
            max_drawdown,
            max_drawdown_duration_days,
            volatility: self.volatility(),
            total_trades: trade_stats.total,
            winning_trades: trade_stats.winning,
            losing_trades: trade_stats.losing,
            win_rate: trade_stats.win_rate,
            profit_factor: trade_stats.profit_factor,
            avg_win: trade_stats.avg_win,
            avg_loss: trade_stats.avg_loss,
            largest_win: trade_stats.largest_win,
            largest_loss: trade_stats.largest_loss,
            total_commission: gateway_stats.total_commission,
            total_slippage: gateway_stats.total_slippage,
            avg_position_duration_hours: trade_stats.avg_duration_hours,
            max_position_size: trade_stats.max_position_size,
        }
    }

    // -------------------------------------------------------------------------
    // Equity-curve metrics
    // -------------------------------------------------------------------------

    fn returns(&self) -> Vec<f64> {
        self.equity_curve
            .windows(2)
            .filter(|w| w[0].equity != 0.0)
            .map(|w| (w[1].equity - w[0].equity) / w[0].equity)
            .collect()
    }

    fn sharpe_ratio(&self) -> f64 {
        if self.equity_curve.len() < 2 {
            return 0.0;
        }
        let returns = self.returns();
        if returns.is_empty() {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let std = population_std(&returns, mean);
        if std == 0.0 {
            return 0.0;
        }
        let daily_rf = RISK_FREE_RATE / 365.0;
        (mean - daily_rf) / std * 365.0_f64.sqrt()
    }

    fn volatility(&self) -> f64 {
        if self.equity_curve.len() < 2 {
            return 0.0;
        }
        let returns = self.returns();
        if returns.is_empty() {
            return 0.0;
        }
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        population_std(&returns, mean) * 365.0_f64.sqrt()
    }

    /// (max drawdown fraction, peak-to-trough duration in days)
    fn max_drawdown(&self) -> (f64, f64) {
        if self.equity_curve.len() < 2 {
            return (0.0, 0.0);
        }

        let mut peak = self.equity_curve[0].equity;
        let mut peak_time = self.equity_curve[0].timestamp;
        let mut max_dd = 0.0;
        let mut max_dd_duration = 0.0;

        for sample in &self.equity_curve {
            if sample.equity > peak {
                peak = sample.equity;
                peak_time = sample.timestamp;
            } else if peak > 0.0 {
                let dd = (peak - sample.equity) / peak;
                if dd > max_dd {
                    max_dd = dd;
                    max_dd_duration = (sample.timestamp - peak_time) as f64 / NS_PER_DAY;
                }
            }
        }

        (max_dd, max_dd_duration)
    }

    // -------------------------------------------------------------------------
    // Trade statistics
    // -------------------------------------------------------------------------

    fn trade_statistics(&self) -> TradeStatistics {
        // Walk fills in order, pairing them with the signed average-entry
        // model. Each closing fill produces one round-trip PnL.
        struct Open {
            volume: i64,
            avg_price: f64,
            opened_at: i64,
        }

        let mut positions: IndexMap<String, Open> = IndexMap::new();
        let mut round_trips: Vec<f64> = Vec::new();
        let mut durations_ns: Vec<i64> = Vec::new();
        let mut max_position_size: i64 = 0;

        for trade in &self.trades {
            let delta = trade.side.sign() * trade.filled_volume;
            let price = trade.filled_price;
            let entry = positions.entry(trade.symbol.clone()).or_insert(Open {
                volume: 0,
                avg_price: 0.0,
                opened_at: trade.trade_time,
            });

            if entry.volume == 0 || entry.volume.signum() == delta.signum() {
                if entry.volume == 0 {
                    entry.opened_at = trade.trade_time;
                }
                let total_cost =
                    entry.avg_price * entry.volume.abs() as f64 + price * delta.abs() as f64;
                entry.volume += delta;
                entry.avg_price = if entry.volume != 0 {
                    total_cost / entry.volume.abs() as f64
                } else {
                    0.0
                };
            } else {
                let closed = delta.abs().min(entry.volume.abs());
                let pnl = (price - entry.avg_price) * closed as f64
                    * entry.volume.signum() as f64
                    - trade.commission;
                round_trips.push(pnl);

                let crossed = delta.abs() > entry.volume.abs();
                entry.volume += delta;
                if crossed {
                    entry.avg_price = price;
                    entry.opened_at = trade.trade_time;
                } else if entry.volume == 0 {
                    entry.avg_price = 0.0;
                    durations_ns.push(trade.trade_time - entry.opened_at);
                }
            }

            max_position_size = max_position_size.max(entry.volume.abs());
        }

        if round_trips.is_empty() {
            return TradeStatistics {
                total: self.trades.len(),
                ..TradeStatistics::default()
            };
        }

        let wins: Vec<f64> = round_trips.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = round_trips.iter().copied().filter(|p| *p < 0.0).collect();

        let total = round_trips.len();
        let total_win: f64 = wins.iter().sum();
        let total_loss: f64 = losses.iter().sum::<f64>().abs();

        let avg_duration_hours = if durations_ns.is_empty() {
            0.0
        } else {
            let sum_ns: i64 = durations_ns.iter().sum();
            sum_ns as f64 / durations_ns.len() as f64 / (3600.0 * 1e9)
        };

        TradeStatistics {
            total,
            winning: wins.len(),
            losing: losses.len(),
            win_rate: wins.len() as f64 / total as f64,
            profit_factor: if total_loss > 0.0 {
                total_win / total_loss
            } else {
                0.0
            },
            avg_win: if wins.is_empty() {
                0.0
            } else {
                total_win / wins.len() as f64
            },
            avg_loss: if losses.is_empty() {
                0.0
            } else {
                total_loss / losses.len() as f64
            },
            largest_win: wins.iter().copied().fold(0.0, f64::max),
            largest_loss: losses.iter().copied().fold(0.0, f64::min).abs(),
            avg_duration_hours,
            max_position_size,
        }
    }
}

#[derive(Debug, Default)]
struct TradeStatistics {
    total: usize,
    winning: usize,
    losing: usize,
    win_rate: f64,
    profit_factor: f64,
    avg_win: f64,
    avg_loss: f64,
    largest_win: f64,
    largest_loss: f64,
    avg_duration_hours: f64,
    max_position_size: i64,
}

fn population_std(values: &[f64], mean: f64) -> f64 {
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}
