// =============================================================================
// C10 — Ledger
// =============================================================================
//
// Immutable double-entry postings. Every entry carries a DB-assigned,
// monotonically increasing `global_sequence` (backed by a Postgres
// `SEQUENCE`), a debit leg and a credit leg (both mandatory, both naming a
// distinct (account, ledger-account-type) pair — enforced by a CHECK
// constraint, not just app-level discipline), an `amount` the database
// itself rejects if it is not strictly positive, and a caller-supplied
// `idempotency_key` that is UNIQUE at the schema level — a retried request
// that reuses the same key is rejected by the database rather than
// re-applied.
//
// `LedgerAccountType` names one of the five sub-accounts every wallet owns.
// Postings always move value between two of *the same account's* sub-ledger
// accounts in this engine (margin blocking, settlement, fees, realized P&L
// are all intra-account) — there is no cross-account transfer path, so
// `post()` takes a single `account_id` for both legs.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::errors::TradingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LedgerAccountType {
    Cash,
    MarginBlocked,
    UnrealizedPnl,
    RealizedPnl,
    Fees,
}

impl LedgerAccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cash => "CASH",
            Self::MarginBlocked => "MARGIN_BLOCKED",
            Self::UnrealizedPnl => "UNREALIZED_PNL",
            Self::RealizedPnl => "REALIZED_PNL",
            Self::Fees => "FEES",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferenceType {
    Trade,
    Order,
    Liquidation,
    Expiry,
    Adjustment,
}

impl ReferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trade => "TRADE",
            Self::Order => "ORDER",
            Self::Liquidation => "LIQUIDATION",
            Self::Expiry => "EXPIRY",
            Self::Adjustment => "ADJUSTMENT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub global_sequence: i64,
    pub debit_account_id: String,
    pub debit_account_type: LedgerAccountType,
    pub credit_account_id: String,
    pub credit_account_type: LedgerAccountType,
    pub amount: Decimal,
    pub currency: String,
    pub reference_type: ReferenceType,
    pub reference_id: Option<String>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

/// Maps a posted (debit, credit) pair to its effect on the wallet cache's
/// two materialized fields. This table is the single source of truth both
/// `post()`'s callers rely on implicitly and `recalculate_from_ledger`
/// replays explicitly — the two must never drift apart.
fn ledger_effect(debit: LedgerAccountType, credit: LedgerAccountType, reference_type: ReferenceType, amount: Decimal) -> (Decimal, Decimal) {
    use LedgerAccountType::*;
    match (debit, credit, reference_type) {
        (Cash, MarginBlocked, _) => (Decimal::ZERO, amount),
        (MarginBlocked, Cash, ReferenceType::Order) => (amount, -amount),
        (MarginBlocked, Cash, _) => (Decimal::ZERO, -amount),
        (Cash, UnrealizedPnl, _) => (-amount, Decimal::ZERO),
        (UnrealizedPnl, Cash, _) => (amount, Decimal::ZERO),
        (Cash, RealizedPnl, _) => (amount, Decimal::ZERO),
        (RealizedPnl, Cash, _) => (-amount, Decimal::ZERO),
        (Cash, Fees, _) => (-amount, Decimal::ZERO),
        _ => (Decimal::ZERO, Decimal::ZERO),
    }
}

pub struct Ledger {
    pool: PgPool,
}

impl Ledger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Post one entry within the caller's transaction (so the ledger write
    /// and the wallet/position mutation it explains commit atomically).
    #[allow(clippy::too_many_arguments)]
    pub async fn post(
        tx: &mut Transaction<'_, Postgres>,
        account_id: &str,
        debit: LedgerAccountType,
        credit: LedgerAccountType,
        amount: Decimal,
        reference_type: ReferenceType,
        reference_id: Option<&str>,
        idempotency_key: &str,
    ) -> Result<LedgerEntry, TradingError> {
        debug_assert!(amount > Decimal::ZERO, "ledger postings must carry a positive amount");
        debug_assert!(debit != credit, "a posting must touch two distinct ledger accounts");

        let seq_row = sqlx::query("SELECT nextval('ledger_global_sequence') AS seq")
            .fetch_one(&mut **tx)
            .await
            .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;
        let global_sequence: i64 = seq_row.try_get("seq").unwrap_or(0);

        let id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO ledger_entries \
             (id, global_sequence, debit_account_id, debit_account_type, credit_account_id, credit_account_type, \
              amount, currency, reference_type, reference_id, idempotency_key) \
             VALUES ($1, $2, $3, $4, $3, $5, $6, 'INR', $7, $8, $9)",
        )
        .bind(id)
        .bind(global_sequence)
        .bind(account_id)
        .bind(debit.as_str())
        .bind(credit.as_str())
        .bind(amount)
        .bind(reference_type.as_str())
        .bind(reference_id)
        .bind(idempotency_key)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if e.to_string().contains("idempotency_key") {
                TradingError::DuplicateOrder
            } else {
                TradingError::WalletNotFound(account_id.to_string())
            }
        })?;

        info!(account_id, global_sequence, debit = debit.as_str(), credit = credit.as_str(), %amount, "ledger entry posted");

        Ok(LedgerEntry {
            id,
            global_sequence,
            debit_account_id: account_id.to_string(),
            debit_account_type: debit,
            credit_account_id: account_id.to_string(),
            credit_account_type: credit,
            amount,
            currency: "INR".to_string(),
            reference_type,
            reference_id: reference_id.map(str::to_string),
            idempotency_key: idempotency_key.to_string(),
            created_at: Utc::now(),
        })
    }

    /// Replays every posting touching `account_id` in sequence order and
    /// rebuilds (balance, blockedBalance) from scratch — used to reconcile
    /// the wallet cache (C11) against the immutable ledger. An account's
    /// opening grant is itself posted as a ledger entry (see
    /// `WalletCache::get_or_create`), so this never needs a hidden seed.
    pub async fn recalculate_from_ledger(&self, account_id: &str) -> Result<(Decimal, Decimal), TradingError> {
        let rows = sqlx::query(
            "SELECT amount, debit_account_type, credit_account_type, reference_type FROM ledger_entries \
             WHERE debit_account_id = $1 OR credit_account_id = $1 ORDER BY global_sequence ASC",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;

        let mut balance = Decimal::ZERO;
        let mut blocked = Decimal::ZERO;

        for row in rows {
            let amount: Decimal = row.try_get("amount").unwrap_or(Decimal::ZERO);
            let debit = parse_account_type(row.try_get("debit_account_type").unwrap_or_default());
            let credit = parse_account_type(row.try_get("credit_account_type").unwrap_or_default());
            let reference_type = parse_reference_type(row.try_get("reference_type").unwrap_or_default());
            let (bal_delta, blocked_delta) = ledger_effect(debit, credit, reference_type, amount);
            balance += bal_delta;
            blocked += blocked_delta;
        }

        Ok((balance, blocked))
    }
}

fn parse_account_type(s: String) -> LedgerAccountType {
    match s.as_str() {
        "CASH" => LedgerAccountType::Cash,
        "MARGIN_BLOCKED" => LedgerAccountType::MarginBlocked,
        "UNREALIZED_PNL" => LedgerAccountType::UnrealizedPnl,
        "REALIZED_PNL" => LedgerAccountType::RealizedPnl,
        _ => LedgerAccountType::Fees,
    }
}

fn parse_reference_type(s: String) -> ReferenceType {
    match s.as_str() {
        "TRADE" => ReferenceType::Trade,
        "ORDER" => ReferenceType::Order,
        "LIQUIDATION" => ReferenceType::Liquidation,
        "EXPIRY" => ReferenceType::Expiry,
        _ => ReferenceType::Adjustment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn block_increases_blocked_only() {
        let (bal, blocked) = ledger_effect(LedgerAccountType::Cash, LedgerAccountType::MarginBlocked, ReferenceType::Order, dec!(100));
        assert_eq!(bal, Decimal::ZERO);
        assert_eq!(blocked, dec!(100));
    }

    #[test]
    fn cancel_unblock_restores_balance() {
        let (bal, blocked) = ledger_effect(LedgerAccountType::MarginBlocked, LedgerAccountType::Cash, ReferenceType::Order, dec!(100));
        assert_eq!(bal, dec!(100));
        assert_eq!(blocked, dec!(-100));
    }

    #[test]
    fn fill_release_only_touches_blocked() {
        let (bal, blocked) = ledger_effect(LedgerAccountType::MarginBlocked, LedgerAccountType::Cash, ReferenceType::Trade, dec!(100));
        assert_eq!(bal, Decimal::ZERO);
        assert_eq!(blocked, dec!(-100));
    }

    #[test]
    fn realized_profit_and_loss_are_opposite() {
        let (profit, _) = ledger_effect(LedgerAccountType::Cash, LedgerAccountType::RealizedPnl, ReferenceType::Trade, dec!(50));
        let (loss, _) = ledger_effect(LedgerAccountType::RealizedPnl, LedgerAccountType::Cash, ReferenceType::Trade, dec!(50));
        assert_eq!(profit, dec!(50));
        assert_eq!(loss, dec!(-50));
    }

    #[test]
    fn account_type_wire_names_match_spec() {
        assert_eq!(LedgerAccountType::MarginBlocked.as_str(), "MARGIN_BLOCKED");
        assert_eq!(LedgerAccountType::UnrealizedPnl.as_str(), "UNREALIZED_PNL");
    }
}
