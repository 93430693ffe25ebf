// =============================================================================
// Shared domain types for the paper-trading engine
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Market segment a token belongs to. Determines lot-size and margin rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    #[serde(rename = "NSE_EQ")]
    NseEq,
    #[serde(rename = "NSE_FO")]
    NseFo,
    #[serde(rename = "NSE_INDEX")]
    NseIndex,
    #[serde(rename = "BSE_EQ")]
    BseEq,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NseEq => "NSE_EQ",
            Self::NseFo => "NSE_FO",
            Self::NseIndex => "NSE_INDEX",
            Self::BseEq => "BSE_EQ",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for Segment {
    type Err = crate::errors::TradingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NSE_EQ" => Ok(Self::NseEq),
            "NSE_FO" => Ok(Self::NseFo),
            "NSE_INDEX" => Ok(Self::NseIndex),
            "BSE_EQ" => Ok(Self::BseEq),
            other => Err(crate::errors::TradingError::InvalidSymbol(other.to_string())),
        }
    }
}

/// Canonical instrument identity: `SEGMENT|TOKEN`, e.g. `NSE_EQ|11536`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentKey {
    pub segment: Segment,
    pub token: String,
}

impl InstrumentKey {
    pub fn new(segment: Segment, token: impl Into<String>) -> Self {
        Self {
            segment,
            token: token.into(),
        }
    }

    pub fn canonical(&self) -> String {
        format!("{}|{}", self.segment, self.token)
    }
}

impl fmt::Display for InstrumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

/// Static reference data for a tradable instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub key: InstrumentKey,
    pub trading_symbol: String,
    pub lot_size: u32,
    pub tick_size: Decimal,
    pub product_type: ProductType,
    /// Unix millis after which the instrument can no longer be traded (futures/options).
    pub expiry_ms: Option<i64>,
}

/// Product types a position can be carried under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProductType {
    /// Equity delivery / cash-and-carry.
    Cnc,
    /// Intraday margin.
    Mis,
    /// Carry-forward margin (futures/options).
    Nrml,
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cnc => "CNC",
            Self::Mis => "MIS",
            Self::Nrml => "NRML",
        };
        write!(f, "{s}")
    }
}

/// Direction of an order or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// +1 for Buy, -1 for Sell — used for signed quantity/cost arithmetic.
    pub fn sign(self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Open => "OPEN",
            Self::PartiallyFilled => "PARTIALLY_FILLED",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Rejected)
    }
}

/// Whether the engine is currently accepting new orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Live
    }
}

impl fmt::Display for TradingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Whether the book backing a wallet is cash or margin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    Cash,
    Margin,
}

impl Default for AccountType {
    fn default() -> Self {
        Self::Cash
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cash => write!(f, "Cash"),
            Self::Margin => write!(f, "Margin"),
        }
    }
}

/// A single normalized market-data sample, independent of upstream wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedTick {
    pub key: InstrumentKey,
    pub ltp: f64,
    pub volume: u64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    /// Exchange timestamp, unix millis.
    pub exchange_ts_ms: i64,
    /// When the broker adapter received this tick, unix millis.
    pub ingest_ts_ms: i64,
}

/// One OHLCV bar for a given instrument/interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub key: InstrumentKey,
    pub interval_secs: u32,
    /// Bucket start, unix millis, IST-aligned.
    pub open_ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
    pub closed: bool,
}
