// =============================================================================
// Configuration — TOML schema for the engine driver
// =============================================================================
//
// Layout:
//
//   [global]                trading_mode, log_level
//   [[strategies]]          name, type, enabled, symbol, exchange
//   [strategies.parameters] free-form table handed to the strategy constructor
//   [risk_management]       RiskConfig fields + initial_capital
//   [bus]                   md_endpoints, trade_endpoint, order_endpoint
//   [backtest]              store path, window, fill simulation, seed
//   [metrics]               enabled, port
//
// Every field carries a serde default so an older config file keeps loading
// after the schema grows. A file that does not parse is CONFIG_INVALID and
// the process exits with code 1.
// =============================================================================

use std::path::Path;

use chrono::{DateTime, NaiveDate};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, Result};
use crate::risk::RiskConfig;

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Which engine the driver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Live,
    Backtest,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Backtest => write!(f, "backtest"),
        }
    }
}

impl std::str::FromStr for TradingMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "live" => Ok(Self::Live),
            "backtest" => Ok(Self::Backtest),
            other => Err(EngineError::ConfigInvalid(format!(
                "mode must be live or backtest, got {other:?}"
            ))),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub trading_mode: TradingMode,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            trading_mode: TradingMode::default(),
            log_level: default_log_level(),
        }
    }
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_exchange() -> String {
    "binance".to_string()
}

/// One `[[strategies]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub strategy_type: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// Passed verbatim to the strategy constructor.
    #[serde(default)]
    pub parameters: toml::Table,
}

fn default_initial_capital() -> f64 {
    100_000.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskManagementConfig {
    #[serde(flatten)]
    pub limits: RiskConfig,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
}

impl Default for RiskManagementConfig {
    fn default() -> Self {
        Self {
            limits: RiskConfig::default(),
            initial_capital: default_initial_capital(),
        }
    }
}

fn default_md_endpoints() -> Vec<String> {
    vec!["tcp://localhost:5555".to_string()]
}

fn default_order_endpoint() -> String {
    "tcp://localhost:5556".to_string()
}

fn default_trade_endpoint() -> String {
    "tcp://localhost:5557".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "default_md_endpoints")]
    pub md_endpoints: Vec<String>,
    #[serde(default = "default_trade_endpoint")]
    pub trade_endpoint: String,
    #[serde(default = "default_order_endpoint")]
    pub order_endpoint: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            md_endpoints: default_md_endpoints(),
            trade_endpoint: default_trade_endpoint(),
            order_endpoint: default_order_endpoint(),
        }
    }
}

fn default_db_path() -> String {
    "market_data.db".to_string()
}

fn default_slippage_model() -> crate::backtest::SlippageModel {
    crate::backtest::SlippageModel::Percentage
}

fn default_slippage_value() -> f64 {
    0.0005
}

fn default_maker_fee() -> f64 {
    0.0002
}

fn default_taker_fee() -> f64 {
    0.0004
}

fn default_seed() -> u64 {
    42
}

fn default_equity_interval() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// SQLite store holding the `market_data` table.
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_exchange")]
    pub exchange: String,
    /// ISO date or RFC 3339 timestamp; `--from` on the CLI overrides it.
    #[serde(default)]
    pub start: Option<String>,
    /// ISO date or RFC 3339 timestamp; `--to` on the CLI overrides it.
    #[serde(default)]
    pub end: Option<String>,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
    #[serde(default = "default_slippage_model")]
    pub slippage_model: crate::backtest::SlippageModel,
    #[serde(default = "default_slippage_value")]
    pub slippage_value: f64,
    #[serde(default = "default_maker_fee")]
    pub maker_fee: f64,
    #[serde(default = "default_taker_fee")]
    pub taker_fee: f64,
    #[serde(default)]
    pub min_commission: f64,
    #[serde(default)]
    pub reject_rate: f64,
    /// Seed for the rejection draw. Required to be explicit so replays are
    /// reproducible; the default is fixed, never time-derived.
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Ticks between equity samples. Large values under-sample drawdown on
    /// sparse streams.
    #[serde(default = "default_equity_interval")]
    pub record_equity_interval: u64,
    /// Materialize the whole window up front instead of paging.
    #[serde(default = "default_true")]
    pub preload: bool,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            exchange: default_exchange(),
            start: None,
            end: None,
            initial_capital: default_initial_capital(),
            slippage_model: default_slippage_model(),
            slippage_value: default_slippage_value(),
            maker_fee: default_maker_fee(),
            taker_fee: default_taker_fee(),
            min_commission: 0.0,
            reject_rate: 0.0,
            seed: default_seed(),
            record_equity_interval: default_equity_interval(),
            preload: true,
        }
    }
}

fn default_metrics_port() -> u16 {
    8000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_metrics_port(),
        }
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub global: GlobalConfig,
    #[serde(default)]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub risk_management: RiskManagementConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub backtest: BacktestConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Config {
    /// Load and parse the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::ConfigInvalid(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| {
            EngineError::ConfigInvalid(format!("cannot parse {}: {e}", path.display()))
        })?;

        info!(
            path = %path.display(),
            trading_mode = %config.global.trading_mode,
            strategies = config.strategies.len(),
            risk_enabled = config.risk_management.limits.enabled,
            "config loaded"
        );
        Ok(config)
    }

    /// The enabled strategy entries, in file order.
    pub fn enabled_strategies(&self) -> impl Iterator<Item = &StrategyConfig> {
        self.strategies.iter().filter(|s| s.enabled)
    }

    /// Distinct symbols across enabled strategies, in first-seen order.
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols = Vec::new();
        for strategy in self.enabled_strategies() {
            if !symbols.contains(&strategy.symbol) {
                symbols.push(strategy.symbol.clone());
            }
        }
        symbols
    }
}

/// Parse an ISO date (midnight UTC) or a full RFC 3339 timestamp into
/// nanoseconds since epoch.
pub fn parse_time_ns(value: &str) -> Result<i64> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return ts
            .timestamp_nanos_opt()
            .ok_or_else(|| EngineError::ConfigInvalid(format!("timestamp out of range: {value}")));
    }
    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|e| {
        EngineError::ConfigInvalid(format!("invalid date {value:?}: {e} (expected YYYY-MM-DD)"))
    })?;
    let midnight = date
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| EngineError::ConfigInvalid(format!("invalid date {value:?}")))?;
    midnight
        .and_utc()
        .timestamp_nanos_opt()
        .ok_or_else(|| EngineError::ConfigInvalid(format!("timestamp out of range: {value}")))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
        [global]
        trading_mode = "backtest"
        log_level = "debug"

        [[strategies]]
        name = "ema_cross_btc"
        type = "ma_cross"
        enabled = true
        symbol = "BTCUSDT"
        exchange = "binance"

        [strategies.parameters]
        fast_period = 5
        slow_period = 20
        trade_volume = 1

        [[strategies]]
        name = "grid_eth"
        type = "grid"
        enabled = false
        symbol = "ETHUSDT"

        [risk_management]
        enabled = true
        stop_loss_pct = 0.03
        daily_loss_limit = 2500.0
        initial_capital = 50000.0

        [bus]
        md_endpoints = ["tcp://md-host:5555", "tcp://md-host-2:5555"]
        trade_endpoint = "tcp://gw:5557"
        order_endpoint = "tcp://gw:5556"

        [backtest]
        db_path = "/data/ticks.db"
        start = "2024-01-01"
        end = "2024-01-07"
        slippage_model = "percentage"
        slippage_value = 0.0005
        taker_fee = 0.0004
        seed = 42
        record_equity_interval = 100

        [metrics]
        enabled = true
        port = 9100
    "#;

    #[test]
    fn full_config_parses() {
        let config: Config = toml::from_str(FULL).unwrap();
        assert_eq!(config.global.trading_mode, TradingMode::Backtest);
        assert_eq!(config.global.log_level, "debug");
        assert_eq!(config.strategies.len(), 2);
        assert_eq!(config.strategies[0].strategy_type, "ma_cross");
        assert_eq!(
            config.strategies[0].parameters.get("fast_period"),
            Some(&toml::Value::Integer(5))
        );
        assert_eq!(config.risk_management.limits.stop_loss_pct, 0.03);
        assert_eq!(config.risk_management.limits.daily_loss_limit, 2500.0);
        // Unset risk fields fall back to their defaults.
        assert_eq!(config.risk_management.limits.max_positions, 5);
        assert_eq!(config.risk_management.initial_capital, 50_000.0);
        assert_eq!(config.bus.md_endpoints.len(), 2);
        assert_eq!(config.backtest.seed, 42);
        assert!(config.backtest.preload);
        assert_eq!(config.metrics.port, 9100);
    }

    #[test]
    fn empty_config_is_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.global.trading_mode, TradingMode::Live);
        assert!(config.strategies.is_empty());
        assert_eq!(config.bus.md_endpoints, vec!["tcp://localhost:5555"]);
        assert_eq!(config.backtest.record_equity_interval, 100);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn enabled_strategies_filters_and_keeps_order() {
        let config: Config = toml::from_str(FULL).unwrap();
        let enabled: Vec<_> = config.enabled_strategies().map(|s| s.name.clone()).collect();
        assert_eq!(enabled, vec!["ema_cross_btc"]);
        assert_eq!(config.active_symbols(), vec!["BTCUSDT"]);
    }

    #[test]
    fn malformed_file_is_config_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[global\ntrading_mode = ").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(EngineError::ConfigInvalid(_))
        ));

        assert!(matches!(
            Config::load(dir.path().join("missing.toml")),
            Err(EngineError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn time_parsing_accepts_dates_and_timestamps() {
        assert_eq!(parse_time_ns("1970-01-01").unwrap(), 0);
        assert_eq!(
            parse_time_ns("1970-01-02").unwrap(),
            86_400 * 1_000_000_000
        );
        assert_eq!(
            parse_time_ns("1970-01-01T00:00:01Z").unwrap(),
            1_000_000_000
        );
        assert!(parse_time_ns("not-a-date").is_err());
    }

    #[test]
    fn mode_parses_from_cli_strings() {
        assert_eq!("live".parse::<TradingMode>().unwrap(), TradingMode::Live);
        assert_eq!(
            "backtest".parse::<TradingMode>().unwrap(),
            TradingMode::Backtest
        );
        assert!("paper".parse::<TradingMode>().is_err());
    }
}
