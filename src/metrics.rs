// =============================================================================
// Wire Observability — process-wide metric registry with HTTP exposition
// =============================================================================
//
// One registry per process, created at startup with `init(port)` and passed
// by reference to the engines and strategies (never a global). Three series
// shapes:
//
//   counters    monotonic, updated with atomic adds
//   gauges      last-write-wins scalars
//   histograms  fixed bucket bounds, used for strategy callback latency
//
// `GET /metrics` on the configured port renders every series as plain-text
// `name{labels} value` lines, pull-only.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::types::Side;

/// Bucket upper bounds for callback-latency histograms, in milliseconds.
pub const LATENCY_BUCKETS_MS: [f64; 8] = [1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0];

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Histogram {
    /// One bucket per bound plus the overflow bucket.
    buckets: Vec<Arc<AtomicU64>>,
    count: AtomicU64,
    sum_ms: RwLock<f64>,
}

pub struct MetricsRegistry {
    counters: RwLock<BTreeMap<String, Arc<AtomicU64>>>,
    gauges: RwLock<BTreeMap<String, f64>>,
    histograms: RwLock<BTreeMap<String, Arc<Histogram>>>,
    start: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            counters: RwLock::new(BTreeMap::new()),
            gauges: RwLock::new(BTreeMap::new()),
            histograms: RwLock::new(BTreeMap::new()),
            start: Instant::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    fn counter(&self, key: String) -> Arc<AtomicU64> {
        if let Some(counter) = self.counters.read().get(&key) {
            return counter.clone();
        }
        self.counters.write().entry(key).or_default().clone()
    }

    /// Add to a counter series; the key carries the rendered labels.
    pub fn inc_counter(&self, key: String) {
        self.counter(key).fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_orders_sent(&self, strategy: &str, symbol: &str, side: Side) {
        self.inc_counter(format!(
            "orders_sent_total{{strategy=\"{strategy}\",symbol=\"{symbol}\",side=\"{side}\"}}"
        ));
    }

    pub fn inc_trades_received(&self, strategy: &str, status: &str) {
        self.inc_counter(format!(
            "trades_received_total{{strategy=\"{strategy}\",status=\"{status}\"}}"
        ));
    }

    pub fn inc_ticks_received(&self, symbol: &str) {
        self.inc_counter(format!("ticks_received_total{{symbol=\"{symbol}\"}}"));
    }

    pub fn inc_winning_trades(&self, strategy: &str) {
        self.inc_counter(format!("winning_trades_total{{strategy=\"{strategy}\"}}"));
    }

    pub fn inc_losing_trades(&self, strategy: &str) {
        self.inc_counter(format!("losing_trades_total{{strategy=\"{strategy}\"}}"));
    }

    // -------------------------------------------------------------------------
    // Gauges
    // -------------------------------------------------------------------------

    pub fn set_gauge(&self, key: String, value: f64) {
        self.gauges.write().insert(key, value);
    }

    pub fn set_total_pnl(&self, strategy: &str, value: f64) {
        self.set_gauge(format!("total_pnl{{strategy=\"{strategy}\"}}"), value);
    }

    pub fn set_realized_pnl(&self, strategy: &str, value: f64) {
        self.set_gauge(format!("realized_pnl{{strategy=\"{strategy}\"}}"), value);
    }

    pub fn set_position_value(&self, strategy: &str, symbol: &str, value: f64) {
        self.set_gauge(
            format!("position_value{{strategy=\"{strategy}\",symbol=\"{symbol}\"}}"),
            value,
        );
    }

    pub fn set_position_unrealized(&self, strategy: &str, symbol: &str, value: f64) {
        self.set_gauge(
            format!("position_unrealized_pnl{{strategy=\"{strategy}\",symbol=\"{symbol}\"}}"),
            value,
        );
    }

    pub fn set_win_rate(&self, strategy: &str, value: f64) {
        self.set_gauge(format!("win_rate{{strategy=\"{strategy}\"}}"), value);
    }

    pub fn set_max_drawdown(&self, strategy: &str, value: f64) {
        self.set_gauge(format!("max_drawdown{{strategy=\"{strategy}\"}}"), value);
    }

    pub fn set_sharpe_ratio(&self, strategy: &str, value: f64) {
        self.set_gauge(format!("sharpe_ratio{{strategy=\"{strategy}\"}}"), value);
    }

    pub fn set_active_strategies(&self, count: usize) {
        self.set_gauge("active_strategies".to_string(), count as f64);
    }

    // -------------------------------------------------------------------------
    // Histograms
    // -------------------------------------------------------------------------

    fn histogram(&self, key: String) -> Arc<Histogram> {
        if let Some(histogram) = self.histograms.read().get(&key) {
            return histogram.clone();
        }
        self.histograms
            .write()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Histogram {
                    buckets: (0..=LATENCY_BUCKETS_MS.len())
                        .map(|_| Arc::new(AtomicU64::new(0)))
                        .collect(),
                    count: AtomicU64::new(0),
                    sum_ms: RwLock::new(0.0),
                })
            })
            .clone()
    }

    /// Record one strategy-callback latency observation.
    pub fn observe_callback_latency(&self, strategy: &str, millis: f64) {
        let histogram = self.histogram(format!(
            "callback_latency_ms{{strategy=\"{strategy}\"}}"
        ));
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|bound| millis <= *bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        histogram.buckets[idx].fetch_add(1, Ordering::Relaxed);
        histogram.count.fetch_add(1, Ordering::Relaxed);
        *histogram.sum_ms.write() += millis;
    }

    // -------------------------------------------------------------------------
    // Exposition
    // -------------------------------------------------------------------------

    /// Render every series as plain-text lines.
    pub fn render(&self) -> String {
        let mut out = String::new();

        for (key, counter) in self.counters.read().iter() {
            out.push_str(&format!("{key} {}\n", counter.load(Ordering::Relaxed)));
        }
        for (key, value) in self.gauges.read().iter() {
            out.push_str(&format!("{key} {value}\n"));
        }
        out.push_str(&format!(
            "uptime_seconds {}\n",
            self.start.elapsed().as_secs()
        ));

        for (key, histogram) in self.histograms.read().iter() {
            let (name, labels) = match key.find('{') {
                Some(idx) => (&key[..idx], &key[idx + 1..key.len() - 1]),
                None => (key.as_str(), ""),
            };
            let sep = if labels.is_empty() { "" } else { "," };
            let mut cumulative = 0u64;
            for (i, bound) in LATENCY_BUCKETS_MS.iter().enumerate() {
                cumulative += histogram.buckets[i].load(Ordering::Relaxed);
                out.push_str(&format!(
                    "{name}_bucket{{{labels}{sep}le=\"{bound}\"}} {cumulative}\n"
                ));
            }
            cumulative += histogram.buckets[LATENCY_BUCKETS_MS.len()].load(Ordering::Relaxed);
            out.push_str(&format!(
                "{name}_bucket{{{labels}{sep}le=\"+Inf\"}} {cumulative}\n"
            ));
            out.push_str(&format!(
                "{name}_count{{{labels}}} {}\n",
                histogram.count.load(Ordering::Relaxed)
            ));
            out.push_str(&format!("{name}_sum{{{labels}}} {}\n", histogram.sum_ms.read()));
        }

        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("counters", &self.counters.read().len())
            .field("gauges", &self.gauges.read().len())
            .field("histograms", &self.histograms.read().len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

/// Handle for the exposition server; abort it at shutdown.
pub struct MetricsServer {
    task: JoinHandle<()>,
    local_addr: std::net::SocketAddr,
}

impl MetricsServer {
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.task.abort();
        info!("metrics server stopped");
    }
}

async fn render_handler(State(registry): State<Arc<MetricsRegistry>>) -> String {
    registry.render()
}

/// Start the process-wide registry and its exposition endpoint.
pub async fn init(port: u16) -> Result<(Arc<MetricsRegistry>, MetricsServer)> {
    let registry = Arc::new(MetricsRegistry::new());

    let app = Router::new()
        .route("/metrics", get(render_handler))
        .with_state(registry.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| EngineError::ConfigInvalid(format!("cannot bind metrics port {port}: {e}")))?;
    let local_addr = listener
        .local_addr()
        .map_err(|e| EngineError::ConfigInvalid(format!("metrics local_addr: {e}")))?;

    let task = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!(error = %e, "metrics server exited");
        }
    });

    info!(addr = %local_addr, "metrics server listening");
    Ok((registry, MetricsServer { task, local_addr }))
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn counters_accumulate_per_label_set() {
        let registry = MetricsRegistry::new();
        registry.inc_orders_sent("ema", "BTCUSDT", Side::Buy);
        registry.inc_orders_sent("ema", "BTCUSDT", Side::Buy);
        registry.inc_orders_sent("ema", "BTCUSDT", Side::Sell);
        registry.inc_ticks_received("BTCUSDT");

        let text = registry.render();
        assert!(text.contains(
            "orders_sent_total{strategy=\"ema\",symbol=\"BTCUSDT\",side=\"BUY\"} 2"
        ));
        assert!(text.contains(
            "orders_sent_total{strategy=\"ema\",symbol=\"BTCUSDT\",side=\"SELL\"} 1"
        ));
        assert!(text.contains("ticks_received_total{symbol=\"BTCUSDT\"} 1"));
    }

    #[test]
    fn gauges_are_last_write_wins() {
        let registry = MetricsRegistry::new();
        registry.set_total_pnl("ema", 10.0);
        registry.set_total_pnl("ema", -3.5);

        let text = registry.render();
        assert!(text.contains("total_pnl{strategy=\"ema\"} -3.5"));
        assert!(!text.contains("total_pnl{strategy=\"ema\"} 10"));
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let registry = MetricsRegistry::new();
        registry.observe_callback_latency("ema", 0.5); // le=1
        registry.observe_callback_latency("ema", 7.0); // le=10
        registry.observe_callback_latency("ema", 9000.0); // overflow

        let text = registry.render();
        assert!(text.contains("callback_latency_ms_bucket{strategy=\"ema\",le=\"1\"} 1"));
        assert!(text.contains("callback_latency_ms_bucket{strategy=\"ema\",le=\"10\"} 2"));
        assert!(text.contains("callback_latency_ms_bucket{strategy=\"ema\",le=\"5000\"} 2"));
        assert!(text.contains("callback_latency_ms_bucket{strategy=\"ema\",le=\"+Inf\"} 3"));
        assert!(text.contains("callback_latency_ms_count{strategy=\"ema\"} 3"));
    }

    #[test]
    fn render_always_reports_uptime() {
        let registry = MetricsRegistry::new();
        assert!(registry.render().contains("uptime_seconds "));
    }

    #[tokio::test]
    async fn http_endpoint_serves_plain_text() {
        let (registry, server) = init(0).await.unwrap();
        registry.inc_ticks_received("ETHUSDT");
        registry.set_active_strategies(2);

        let mut stream = tokio::net::TcpStream::connect(server.local_addr())
            .await
            .unwrap();
        stream
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("ticks_received_total{symbol=\"ETHUSDT\"} 1"));
        assert!(response.contains("active_strategies 2"));

        server.shutdown();
    }
}
