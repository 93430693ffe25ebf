// =============================================================================
// Typed error taxonomy for the trading and journal subsystems
// =============================================================================
//
// I/O-shaped failures (websocket connect, HTTP fetch, Redis round-trip) stay
// as `anyhow::Result` at the call site, matching the upstream-connection
// code. Domain-shape failures — the ones a caller needs to branch on rather
// than just log — get their own enum here.
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TradingError {
    #[error("instrument has expired")]
    ExpiredInstrument,

    #[error("order quantity {0} is not a multiple of the lot size")]
    InvalidLotSize(u32),

    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    #[error("price is stale (age {age_ms}ms exceeds max {max_ms}ms)")]
    StalePrice { age_ms: i64, max_ms: i64 },

    #[error("contract is illiquid (no recent trades)")]
    IlliquidContract,

    #[error("partial exit is not allowed for this position")]
    PartialExitNotAllowed,

    #[error("duplicate order: idempotency key already used")]
    DuplicateOrder,

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("unknown instrument: {0}")]
    UnknownInstrument(String),

    #[error("wallet not found for account {0}")]
    WalletNotFound(String),

    #[error("order not found: {0}")]
    OrderNotFound(String),

    #[error("order {0} is not in a cancellable state")]
    OrderNotCancellable(String),

    #[error("position not found: {0}")]
    PositionNotFound(String),

    #[error("trading is currently halted ({0})")]
    TradingHalted(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JournalError {
    #[error("journal checksum mismatch for record {0}")]
    JournalCorruption(String),

    #[error("recovery sequence missing for record {0}")]
    RecoverySequenceMissing(String),

    #[error("record {0} is not in PREPARED state")]
    NotPrepared(String),

    #[error("record {0} already exists")]
    DuplicateRecord(String),
}

impl TradingError {
    /// Stable machine-readable code, used on the wire and in log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ExpiredInstrument => "EXPIRED_INSTRUMENT",
            Self::InvalidLotSize(_) => "INVALID_LOT_SIZE",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::StalePrice { .. } => "STALE_PRICE",
            Self::IlliquidContract => "ILLIQUID_CONTRACT",
            Self::PartialExitNotAllowed => "PARTIAL_EXIT_NOT_ALLOWED",
            Self::DuplicateOrder => "DUPLICATE_ORDER",
            Self::InvalidSymbol(_) => "INVALID_SYMBOL",
            Self::UnknownInstrument(_) => "UNKNOWN_INSTRUMENT",
            Self::WalletNotFound(_) => "WALLET_NOT_FOUND",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::OrderNotCancellable(_) => "ORDER_NOT_CANCELLABLE",
            Self::PositionNotFound(_) => "POSITION_NOT_FOUND",
            Self::TradingHalted(_) => "TRADING_HALTED",
        }
    }
}

impl JournalError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::JournalCorruption(_) => "JOURNAL_CORRUPTION",
            Self::RecoverySequenceMissing(_) => "RECOVERY_SEQUENCE_MISSING",
            Self::NotPrepared(_) => "NOT_PREPARED",
            Self::DuplicateRecord(_) => "DUPLICATE_RECORD",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(TradingError::ExpiredInstrument.code(), "EXPIRED_INSTRUMENT");
        assert_eq!(
            TradingError::InvalidLotSize(7).code(),
            "INVALID_LOT_SIZE"
        );
        assert_eq!(
            JournalError::JournalCorruption("x".into()).code(),
            "JOURNAL_CORRUPTION"
        );
    }

    #[test]
    fn insufficient_funds_carries_amounts() {
        let e = TradingError::InsufficientFunds {
            required: "100.00".into(),
            available: "50.00".into(),
        };
        assert!(e.to_string().contains("100.00"));
    }
}
