// =============================================================================
// Error taxonomy
// =============================================================================
//
// Policies per kind:
//   DecodeMalformed    — log, drop the frame, continue. Never fatal.
//   BusOverflow        — returned to the order sender; it retries or drops.
//   BusDisconnect      — logged; the endpoint reconnects on its own.
//   Risk(..)           — order silently dropped from the strategy's view,
//                        logged with the reason. Never reaches the gateway.
//   StrategyCallback   — aborts the current tick for that strategy only.
//   DataSourceQuery    — fatal at backtest startup.
//   ConfigInvalid      — fatal at process startup (exit code 1).
//
// Gateway rejections are NOT errors: they travel as Trades with
// status=REJECTED and the strategy's on_trade still fires.
// =============================================================================

use thiserror::Error;

/// Reason a pre-trade risk check rejected an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskReason {
    DailyLoss,
    MaxPositions,
    PositionSize,
    TotalExposure,
}

impl std::fmt::Display for RiskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DailyLoss => "RISK_DAILY_LOSS",
            Self::MaxPositions => "RISK_MAX_POSITIONS",
            Self::PositionSize => "RISK_POSITION_SIZE",
            Self::TotalExposure => "RISK_TOTAL_EXPOSURE",
        };
        f.write_str(s)
    }
}

/// All error kinds the engine core can produce.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed frame: {0}")]
    DecodeMalformed(String),

    #[error("bus send queue full (high-water mark reached)")]
    BusOverflow,

    #[error("bus endpoint disconnected: {0}")]
    BusDisconnect(String),

    #[error("order rejected by risk gate: {0}")]
    Risk(RiskReason),

    #[error("strategy callback failed: {0}")]
    StrategyCallback(String),

    #[error("historical data query failed: {0}")]
    DataSourceQuery(#[from] rusqlite::Error),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
