// =============================================================================
// Backtest Data Source — historical ticks from the SQL time-series store
// =============================================================================
//
// Queries the `market_data` table for the requested (symbols x venue x
// [start, end]) window, sanitizes the rows, and yields them as one
// time-ordered stream:
//
//   - rows with NULL price or volume are dropped
//   - rows with price <= 0 or volume < 0 are dropped
//   - duplicates on (time, symbol) keep the first row
//
// Two loading modes. Pre-load materializes the whole window in memory up
// front; streaming pages through the result with LIMIT/OFFSET keeping only a
// cursor and the dedup key set. An empty query result is an empty stream,
// not an error; a failing query is fatal at startup.
// =============================================================================

use std::collections::{HashSet, VecDeque};
use std::path::Path;

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::MarketData;

/// Rows fetched per page in streaming mode.
const BATCH_SIZE: usize = 8192;

const COLUMNS: &str = "time, symbol, exchange, last_price, volume, exchange_time_ns, local_time_ns";

/// One raw row before sanitization.
struct RawRow {
    time: i64,
    symbol: String,
    exchange: String,
    last_price: Option<f64>,
    volume: Option<f64>,
    exchange_time_ns: Option<i64>,
    local_time_ns: Option<i64>,
}

pub struct BacktestDataSource {
    conn: Connection,
    symbols: Vec<String>,
    exchange: String,
    start_ns: i64,
    end_ns: i64,
    preload: bool,
}

impl BacktestDataSource {
    /// Open the store and bind the query window. The query itself runs when
    /// the stream is created.
    pub fn open(
        db_path: impl AsRef<Path>,
        symbols: Vec<String>,
        exchange: impl Into<String>,
        start_ns: i64,
        end_ns: i64,
        preload: bool,
    ) -> Result<Self> {
        let db_path = db_path.as_ref();
        let conn = Connection::open(db_path)?;
        let exchange = exchange.into();

        info!(
            db = %db_path.display(),
            symbols = ?symbols,
            exchange = %exchange,
            start_ns,
            end_ns,
            preload,
            "backtest data source opened"
        );

        Ok(Self {
            conn,
            symbols,
            exchange,
            start_ns,
            end_ns,
            preload,
        })
    }

    /// Consume the source into the lazy, non-restartable tick stream. Query
    /// failures surface here, before the replay starts.
    pub fn stream(self) -> Result<TickStream> {
        if self.preload {
            let ticks = self.load_all()?;
            Ok(TickStream {
                inner: StreamInner::Preloaded(ticks.into_iter()),
            })
        } else {
            let mut paged = PagedStream {
                conn: self.conn,
                symbols: self.symbols,
                exchange: self.exchange,
                start_ns: self.start_ns,
                end_ns: self.end_ns,
                offset: 0,
                batch: VecDeque::new(),
                seen: HashSet::new(),
                exhausted: false,
            };
            // Fetch the first page eagerly so a broken query refuses to run.
            paged.refill()?;
            Ok(TickStream {
                inner: StreamInner::Paged(paged),
            })
        }
    }

    fn load_all(&self) -> Result<Vec<MarketData>> {
        let (sql, params) = build_query(
            &self.symbols,
            &self.exchange,
            self.start_ns,
            self.end_ns,
            None,
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), read_row)?;

        let mut seen = HashSet::new();
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for row in rows {
            match sanitize(row?, &mut seen) {
                Some(md) => kept.push(md),
                None => dropped += 1,
            }
        }

        if dropped > 0 {
            warn!(dropped, "invalid rows removed during cleaning");
        }
        for symbol in &self.symbols {
            let count = kept.iter().filter(|md| &md.symbol == symbol).count();
            info!(symbol = %symbol, ticks = count, "historical data loaded");
        }
        if kept.is_empty() {
            warn!("historical query returned no usable rows");
        }

        Ok(kept)
    }
}

impl std::fmt::Debug for BacktestDataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BacktestDataSource")
            .field("symbols", &self.symbols)
            .field("exchange", &self.exchange)
            .field("start_ns", &self.start_ns)
            .field("end_ns", &self.end_ns)
            .field("preload", &self.preload)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tick stream
// ---------------------------------------------------------------------------

/// Lazy, finite, non-restartable stream of ticks in ascending time order.
pub struct TickStream {
    inner: StreamInner,
}

enum StreamInner {
    Preloaded(std::vec::IntoIter<MarketData>),
    Paged(PagedStream),
}

impl Iterator for TickStream {
    type Item = MarketData;

    fn next(&mut self) -> Option<MarketData> {
        match &mut self.inner {
            StreamInner::Preloaded(iter) => iter.next(),
            StreamInner::Paged(paged) => paged.next_tick(),
        }
    }
}

struct PagedStream {
    conn: Connection,
    symbols: Vec<String>,
    exchange: String,
    start_ns: i64,
    end_ns: i64,
    offset: usize,
    batch: VecDeque<MarketData>,
    seen: HashSet<(i64, String)>,
    exhausted: bool,
}

impl PagedStream {
    fn next_tick(&mut self) -> Option<MarketData> {
        loop {
            if let Some(md) = self.batch.pop_front() {
                return Some(md);
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.refill() {
                // A query that worked at startup and fails mid-replay: end
                // the stream rather than tearing the process down.
                warn!(error = %e, "historical page fetch failed — ending stream");
                self.exhausted = true;
                return None;
            }
        }
    }

    fn refill(&mut self) -> Result<()> {
        let (sql, params) = build_query(
            &self.symbols,
            &self.exchange,
            self.start_ns,
            self.end_ns,
            Some((BATCH_SIZE, self.offset)),
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params), read_row)?;

        let mut fetched = 0usize;
        for row in rows {
            fetched += 1;
            if let Some(md) = sanitize(row?, &mut self.seen) {
                self.batch.push_back(md);
            }
        }
        self.offset += fetched;
        if fetched < BATCH_SIZE {
            self.exhausted = true;
        }
        debug!(fetched, kept = self.batch.len(), offset = self.offset, "page fetched");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Query plumbing
// ---------------------------------------------------------------------------

/// Build the window query. Paging appends LIMIT/OFFSET; ordering includes
/// rowid so pages tile the result deterministically.
fn build_query(
    symbols: &[String],
    exchange: &str,
    start_ns: i64,
    end_ns: i64,
    page: Option<(usize, usize)>,
) -> (String, Vec<rusqlite::types::Value>) {
    let placeholders = vec!["?"; symbols.len().max(1)].join(", ");
    let mut sql = format!(
        "SELECT {COLUMNS} FROM market_data \
         WHERE symbol IN ({placeholders}) AND exchange = ? \
         AND time >= ? AND time <= ? \
         ORDER BY time ASC, rowid ASC"
    );

    let mut params: Vec<rusqlite::types::Value> = symbols
        .iter()
        .map(|s| rusqlite::types::Value::Text(s.clone()))
        .collect();
    if symbols.is_empty() {
        // IN () is invalid SQL; match nothing instead.
        params.push(rusqlite::types::Value::Text(String::new()));
    }
    params.push(rusqlite::types::Value::Text(exchange.to_string()));
    params.push(rusqlite::types::Value::Integer(start_ns));
    params.push(rusqlite::types::Value::Integer(end_ns));

    if let Some((limit, offset)) = page {
        sql.push_str(" LIMIT ? OFFSET ?");
        params.push(rusqlite::types::Value::Integer(limit as i64));
        params.push(rusqlite::types::Value::Integer(offset as i64));
    }

    (sql, params)
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        time: row.get(0)?,
        symbol: row.get(1)?,
        exchange: row.get(2)?,
        last_price: row.get(3)?,
        volume: row.get(4)?,
        exchange_time_ns: row.get(5)?,
        local_time_ns: row.get(6)?,
    })
}

/// Apply the cleaning rules. Returns `None` for rows that must be dropped.
fn sanitize(row: RawRow, seen: &mut HashSet<(i64, String)>) -> Option<MarketData> {
    let last_price = row.last_price?;
    let volume = row.volume?;
    if last_price <= 0.0 || volume < 0.0 {
        return None;
    }
    if !seen.insert((row.time, row.symbol.clone())) {
        return None;
    }
    Some(MarketData {
        symbol: row.symbol,
        last_price,
        volume,
        exchange_time: row.exchange_time_ns.unwrap_or(row.time),
        local_time: row.local_time_ns.unwrap_or(row.time),
        exchange: row.exchange,
    })
}
