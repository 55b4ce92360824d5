// =============================================================================
// Shared types used across the Meridian trading engine
// =============================================================================
//
// These records travel the full path of the system: adapters publish
// MarketData onto the bus, strategies emit Orders through the gateway handle,
// and the gateway answers with exactly one Trade per Order. All three are
// immutable once constructed.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "BUY")]
    Buy,
    #[serde(rename = "SELL")]
    Sell,
}

impl Side {
    /// Wire representation ("BUY" / "SELL").
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    /// Parse the wire representation. Unknown strings map to `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "BUY" => Some(Self::Buy),
            "SELL" => Some(Self::Sell),
            _ => None,
        }
    }

    /// The side that closes a position opened on this side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for BUY, -1 for SELL.
    pub fn sign(&self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal state of an order, reported on its Trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeStatus {
    #[serde(rename = "FILLED")]
    Filled,
    #[serde(rename = "REJECTED")]
    Rejected,
}

impl TradeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filled => "FILLED",
            Self::Rejected => "REJECTED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "FILLED" => Some(Self::Filled),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single market-data observation (tick) for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketData {
    pub symbol: String,
    pub last_price: f64,
    pub volume: f64,
    /// Exchange-origin timestamp, nanoseconds since epoch.
    pub exchange_time: i64,
    /// Local-receive timestamp, nanoseconds since epoch.
    pub local_time: i64,
    pub exchange: String,
}

/// An order emitted by a strategy.
///
/// `order_id` is `{strategy_id}_{n}` with `n` a per-strategy monotonic
/// counter, so ids are unique within a process without coordination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub price: f64,
    pub volume: i64,
    pub side: Side,
    /// Creation timestamp, nanoseconds since epoch.
    pub timestamp: i64,
}

/// Fill (or rejection) report for exactly one order.
///
/// Partial fills do not exist in this system: a Trade either fills the whole
/// order volume or rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub order_id: String,
    pub strategy_id: String,
    pub symbol: String,
    pub side: Side,
    pub filled_price: f64,
    pub filled_volume: i64,
    /// Fill timestamp, nanoseconds since epoch.
    pub trade_time: i64,
    pub status: TradeStatus,
    pub error_code: i64,
    pub error_message: String,
    /// Advisory only — the strategy decides whether to retry.
    pub is_retryable: bool,
    pub commission: f64,
}

impl Trade {
    pub fn is_filled(&self) -> bool {
        self.status == TradeStatus::Filled
    }
}
