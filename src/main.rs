// =============================================================================
// Meridian Engine Driver — live and backtest entry point
// =============================================================================
//
// Exit codes: 0 clean, 1 startup/config error, 2 runtime error,
// 130 interrupted.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meridian::backtest::{
    BacktestDataSource, BacktestEngine, CommissionConfig, SimulatedGateway,
};
use meridian::config::{parse_time_ns, Config, StrategyConfig, TradingMode};
use meridian::engine::StrategyEngine;
use meridian::risk::RiskManager;
use meridian::strategy::{build_strategy, Strategy};

const EXIT_OK: i32 = 0;
const EXIT_STARTUP: i32 = 1;
const EXIT_RUNTIME: i32 = 2;
const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "meridian", about = "Cross-mode algorithmic trading engine")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "strategies.toml")]
    config: PathBuf,

    /// Override the configured trading mode.
    #[arg(long)]
    mode: Option<TradingMode>,

    /// Backtest window start (YYYY-MM-DD or RFC 3339).
    #[arg(long)]
    from: Option<String>,

    /// Backtest window end (YYYY-MM-DD or RFC 3339).
    #[arg(long)]
    to: Option<String>,

    /// Restrict to these symbols (comma separated).
    #[arg(long, value_delimiter = ',')]
    symbols: Option<Vec<String>>,
}

#[tokio::main]
async fn main() {
    std::process::exit(run().await);
}

async fn run() -> i32 {
    let _ = dotenv::dotenv();
    let cli = Cli::parse();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("meridian: {e}");
            return EXIT_STARTUP;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.global.log_level.clone())),
        )
        .init();

    let mode = cli.mode.unwrap_or(config.global.trading_mode);
    info!(mode = %mode, config = %cli.config.display(), "meridian starting");

    // ── Strategies ───────────────────────────────────────────────────────
    let entries: Vec<&StrategyConfig> = config
        .enabled_strategies()
        .filter(|s| {
            cli.symbols
                .as_ref()
                .map(|filter| filter.contains(&s.symbol))
                .unwrap_or(true)
        })
        .collect();

    if entries.is_empty() {
        warn!("no enabled strategies match the configuration — nothing to do");
        return EXIT_OK;
    }

    let mut strategies: Vec<Box<dyn Strategy>> = Vec::with_capacity(entries.len());
    let mut symbols: Vec<String> = Vec::new();
    for entry in &entries {
        match build_strategy(entry) {
            Ok(strategy) => {
                if !symbols.contains(&entry.symbol) {
                    symbols.push(entry.symbol.clone());
                }
                strategies.push(strategy);
            }
            Err(e) => {
                error!(strategy = %entry.name, error = %e, "cannot build strategy");
                return EXIT_STARTUP;
            }
        }
    }
    info!(count = strategies.len(), symbols = ?symbols, "strategies built");

    // ── Risk gate ────────────────────────────────────────────────────────
    let risk = if config.risk_management.limits.enabled {
        Some(Arc::new(RiskManager::new(
            config.risk_management.limits.clone(),
            config.risk_management.initial_capital,
        )))
    } else {
        info!("risk management disabled");
        None
    };

    match mode {
        TradingMode::Live => run_live(&config, strategies, risk, &symbols).await,
        TradingMode::Backtest => run_backtest(&cli, &config, strategies, risk, &symbols),
    }
}

// ---------------------------------------------------------------------------
// Live mode
// ---------------------------------------------------------------------------

async fn run_live(
    config: &Config,
    strategies: Vec<Box<dyn Strategy>>,
    risk: Option<Arc<RiskManager>>,
    symbols: &[String],
) -> i32 {
    let mut engine = match StrategyEngine::new(&config.bus, symbols) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "cannot start live engine");
            return EXIT_STARTUP;
        }
    };

    if let Some(risk) = risk {
        engine.set_risk_manager(risk);
    }

    let metrics_server = if config.metrics.enabled {
        match meridian::metrics::init(config.metrics.port).await {
            Ok((registry, server)) => {
                engine.set_metrics(registry);
                Some(server)
            }
            Err(e) => {
                error!(error = %e, "cannot start metrics server");
                return EXIT_STARTUP;
            }
        }
    } else {
        None
    };

    for strategy in strategies {
        engine.add_strategy(strategy);
    }

    // Ctrl-C flips the cooperative stop flag; the engine exits within one
    // poll timeout. (The watcher lives on the runtime's main task tree, so
    // embedding the engine elsewhere installs no handler.)
    let stop = engine.stop_flag();
    let interrupted = Arc::new(AtomicBool::new(false));
    let interrupted_flag = interrupted.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received — stopping engine");
            interrupted_flag.store(true, Ordering::SeqCst);
            stop.store(false, Ordering::SeqCst);
        }
    });

    match engine.run().await {
        Ok(stats) => {
            info!(?stats, "live session finished");
            if let Some(server) = metrics_server {
                server.shutdown();
            }
            if interrupted.load(Ordering::SeqCst) {
                EXIT_INTERRUPTED
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            error!(error = %e, "live engine failed");
            EXIT_RUNTIME
        }
    }
}

// ---------------------------------------------------------------------------
// Backtest mode
// ---------------------------------------------------------------------------

fn run_backtest(
    cli: &Cli,
    config: &Config,
    strategies: Vec<Box<dyn Strategy>>,
    risk: Option<Arc<RiskManager>>,
    symbols: &[String],
) -> i32 {
    let bt = &config.backtest;

    let parse_bound = |cli_value: &Option<String>, config_value: &Option<String>, fallback: i64| {
        cli_value
            .as_deref()
            .or(config_value.as_deref())
            .map(parse_time_ns)
            .unwrap_or(Ok(fallback))
    };
    let start_ns = match parse_bound(&cli.from, &bt.start, 0) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "invalid backtest window start");
            return EXIT_STARTUP;
        }
    };
    let end_ns = match parse_bound(&cli.to, &bt.end, i64::MAX) {
        Ok(value) => value,
        Err(e) => {
            error!(error = %e, "invalid backtest window end");
            return EXIT_STARTUP;
        }
    };

    let source = match BacktestDataSource::open(
        &bt.db_path,
        symbols.to_vec(),
        bt.exchange.clone(),
        start_ns,
        end_ns,
        bt.preload,
    ) {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, "cannot open historical store");
            return EXIT_STARTUP;
        }
    };
    let stream = match source.stream() {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "historical query failed");
            return EXIT_STARTUP;
        }
    };

    let gateway = SimulatedGateway::new(
        bt.slippage_model,
        bt.slippage_value,
        CommissionConfig {
            maker_fee: bt.maker_fee,
            taker_fee: bt.taker_fee,
            min_commission: bt.min_commission,
        },
        bt.reject_rate,
        bt.seed,
    );

    let mut engine = BacktestEngine::new(gateway, bt.initial_capital, bt.record_equity_interval);
    if let Some(risk) = risk {
        engine.set_risk_manager(risk);
    }
    for strategy in strategies {
        engine.add_strategy(strategy);
    }

    let reports = engine.run(stream);
    for report in reports.values() {
        println!("{}", report.render());
    }

    EXIT_OK
}
