// =============================================================================
// market-sim — stand-in exchange for local end-to-end runs
// =============================================================================
//
// Plays the roles the real adapters would: publishes a seeded random-walk
// tick stream on the market-data bus, pulls orders off the order bus, fills
// them through the simulated gateway, and publishes the trade reports. Point
// a live engine at it and the full wire path runs on one machine.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use meridian::backtest::{CommissionConfig, SimulatedGateway, SlippageModel};
use meridian::bus::{PubProducer, PullConsumer};
use meridian::codec;
use meridian::types::MarketData;

#[derive(Debug, Parser)]
#[command(name = "market-sim", about = "Simulated exchange feed and gateway")]
struct Cli {
    /// Market-data publisher bind address.
    #[arg(long, default_value = "tcp://0.0.0.0:5555")]
    md_bind: String,

    /// Order pull bind address.
    #[arg(long, default_value = "tcp://0.0.0.0:5556")]
    order_bind: String,

    /// Trade-report publisher bind address.
    #[arg(long, default_value = "tcp://0.0.0.0:5557")]
    trade_bind: String,

    /// Symbols to tick (comma separated).
    #[arg(long, value_delimiter = ',', default_value = "BTCUSDT")]
    symbols: Vec<String>,

    /// Milliseconds between ticks per symbol.
    #[arg(long, default_value_t = 100)]
    interval_ms: u64,

    /// Starting price for every symbol.
    #[arg(long, default_value_t = 50_000.0)]
    start_price: f64,

    /// Per-tick move as a fraction of price (uniform +/- half of this).
    #[arg(long, default_value_t = 0.002)]
    volatility: f64,

    /// Fraction of orders to reject.
    #[arg(long, default_value_t = 0.0)]
    reject_rate: f64,

    /// Seed for the price walk and the rejection draw.
    #[arg(long, default_value_t = 7)]
    seed: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!(
        symbols = ?cli.symbols,
        interval_ms = cli.interval_ms,
        seed = cli.seed,
        "market simulator starting"
    );

    let md_pub = Arc::new(PubProducer::bind(&cli.md_bind).await?);
    let trade_pub = Arc::new(PubProducer::bind(&cli.trade_bind).await?);
    let mut order_rx = PullConsumer::bind(&cli.order_bind).await?;

    // Last published price per symbol; the gateway fills against it.
    let prices: Arc<Mutex<HashMap<String, f64>>> = Arc::new(Mutex::new(
        cli.symbols
            .iter()
            .map(|s| (s.clone(), cli.start_price))
            .collect(),
    ));

    let mut gateway = SimulatedGateway::new(
        SlippageModel::Percentage,
        0.0005,
        CommissionConfig::default(),
        cli.reject_rate,
        cli.seed,
    );
    let fills_pub = trade_pub.clone();
    gateway.set_trade_callback(Box::new(move |trade| {
        let topic = format!("trade.{}", trade.symbol);
        fills_pub.publish(&topic, &codec::encode_trade(&trade));
    }));
    let gateway = Arc::new(Mutex::new(gateway));

    // ── Order consumer ───────────────────────────────────────────────────
    let order_gateway = gateway.clone();
    let order_prices = prices.clone();
    tokio::spawn(async move {
        loop {
            let Some(payload) = order_rx.recv(Duration::from_secs(1)).await else {
                continue;
            };
            match codec::decode_order(&payload) {
                Ok(order) => {
                    let current = order_prices
                        .lock()
                        .get(&order.symbol)
                        .copied()
                        .unwrap_or(order.price);
                    info!(
                        order_id = %order.order_id,
                        symbol = %order.symbol,
                        side = %order.side,
                        volume = order.volume,
                        price = order.price,
                        "order received"
                    );
                    order_gateway.lock().send_order(&order, current);
                }
                Err(e) => warn!(error = %e, "dropping malformed order frame"),
            }
        }
    });

    // ── Tick generator ───────────────────────────────────────────────────
    let mut rng = ChaCha8Rng::seed_from_u64(cli.seed);
    let mut interval = tokio::time::interval(Duration::from_millis(cli.interval_ms.max(1)));
    let mut published: u64 = 0;

    info!("simulator running — Ctrl+C to stop");
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => break,
        }

        for symbol in &cli.symbols {
            let price = {
                let mut prices = prices.lock();
                let price = prices.entry(symbol.clone()).or_insert(cli.start_price);
                let step = (rng.gen::<f64>() - 0.5) * cli.volatility;
                *price *= 1.0 + step;
                *price
            };

            let now_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
            let md = MarketData {
                symbol: symbol.clone(),
                last_price: price,
                volume: rng.gen::<f64>() * 10.0,
                exchange_time: now_ns,
                local_time: now_ns,
                exchange: "sim".to_string(),
            };
            md_pub.publish(&format!("md.{symbol}"), &codec::encode_market_data(&md));
            published += 1;
        }

        if published % 1000 == 0 && published > 0 {
            info!(published, subscribers = md_pub.client_count(), "feed progress");
        }
    }

    info!(published, "market simulator stopped");
    Ok(())
}
