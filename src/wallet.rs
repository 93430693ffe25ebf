// =============================================================================
// C11 — Wallet Cache
// =============================================================================
//
// Materialized `(balance, blockedBalance, equity, state)` per account,
// updated only inside the same DB transaction as the ledger entries that
// explain the change — the same rule the in-process `AppState` follows for
// its own version counter: state mutation and the fact that explains it
// commit together, never separately.
//
// The cache holds no state the ledger doesn't also imply: an account's
// opening balance is itself posted as a ledger entry (see
// `get_or_create`), so `reconcile` can always rebuild both fields from
// scratch via `Ledger::recalculate_from_ledger` with no hidden seed.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::warn;

use crate::errors::TradingError;
use crate::ledger::{Ledger, LedgerAccountType, ReferenceType};
use crate::types::AccountType;

pub const INITIAL_BALANCE: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountState {
    Normal,
    MarginStressed,
    Liquidating,
}

impl AccountState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "NORMAL",
            Self::MarginStressed => "MARGIN_STRESSED",
            Self::Liquidating => "LIQUIDATING",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub account_id: String,
    pub account_type: AccountType,
    pub balance: Decimal,
    pub blocked_balance: Decimal,
    pub equity: Decimal,
    pub state: AccountState,
}

impl Wallet {
    pub fn available(&self) -> Decimal {
        self.balance - self.blocked_balance
    }
}

pub struct WalletCache {
    pool: PgPool,
}

impl WalletCache {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, account_id: &str) -> Result<Wallet, TradingError> {
        let row = sqlx::query(
            "SELECT account_id, account_type, balance, blocked_balance, equity, state FROM wallets WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?
        .ok_or_else(|| TradingError::WalletNotFound(account_id.to_string()))?;

        Ok(row_to_wallet(&row))
    }

    /// Create the wallet row and post its opening grant as a genuine ledger
    /// entry if the account doesn't already exist. Idempotent: a second
    /// call against an existing account is a no-op and returns it as-is.
    pub async fn get_or_create(&self, ledger: &Ledger, account_id: &str) -> Result<Wallet, TradingError> {
        if let Ok(wallet) = self.get(account_id).await {
            return Ok(wallet);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;

        sqlx::query(
            "INSERT INTO wallets (account_id, account_type, balance, blocked_balance, equity, state) \
             VALUES ($1, 'CASH', 0, 0, 0, 'NORMAL') ON CONFLICT (account_id) DO NOTHING",
        )
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;

        ledger
            .post(
                &mut tx,
                account_id,
                LedgerAccountType::Cash,
                LedgerAccountType::RealizedPnl,
                INITIAL_BALANCE,
                ReferenceType::Adjustment,
                None,
                &format!("{account_id}:opening-balance"),
            )
            .await?;

        let row = sqlx::query(
            "UPDATE wallets SET balance = balance + $2, equity = equity + $2, updated_at = now() \
             WHERE account_id = $1 \
             RETURNING account_id, account_type, balance, blocked_balance, equity, state",
        )
        .bind(account_id)
        .bind(INITIAL_BALANCE)
        .fetch_one(&mut *tx)
        .await
        .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;

        tx.commit()
            .await
            .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;

        Ok(row_to_wallet(&row))
    }

    /// Row-lock the wallet for the duration of the caller's transaction —
    /// callers use this before adjusting balance/blocked_balance so two
    /// concurrent orders against the same account serialize correctly.
    pub async fn lock_for_update(
        tx: &mut Transaction<'_, Postgres>,
        account_id: &str,
    ) -> Result<Wallet, TradingError> {
        let row = sqlx::query(
            "SELECT account_id, account_type, balance, blocked_balance, equity, state FROM wallets WHERE account_id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?
        .ok_or_else(|| TradingError::WalletNotFound(account_id.to_string()))?;

        Ok(row_to_wallet(&row))
    }

    pub async fn apply_delta(
        tx: &mut Transaction<'_, Postgres>,
        account_id: &str,
        balance_delta: Decimal,
        blocked_delta: Decimal,
    ) -> Result<Wallet, TradingError> {
        let row = sqlx::query(
            "UPDATE wallets SET balance = balance + $2, blocked_balance = blocked_balance + $3, \
             equity = equity + $2, updated_at = now() \
             WHERE account_id = $1 \
             RETURNING account_id, account_type, balance, blocked_balance, equity, state",
        )
        .bind(account_id)
        .bind(balance_delta)
        .bind(blocked_delta)
        .fetch_optional(&mut **tx)
        .await
        .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?
        .ok_or_else(|| TradingError::WalletNotFound(account_id.to_string()))?;

        let wallet = row_to_wallet(&row);
        if wallet.balance < Decimal::ZERO {
            warn!(account_id, balance = %wallet.balance, "wallet balance went negative");
        }
        Ok(wallet)
    }

    /// Set the account's risk state. Used only by the liquidation sweep to
    /// move an account between NORMAL / MARGIN_STRESSED / LIQUIDATING. Not
    /// tied to any ledger mutation, so it runs directly against the pool
    /// rather than inside a caller's transaction.
    pub async fn mark_state(&self, account_id: &str, state: AccountState) -> Result<(), TradingError> {
        sqlx::query("UPDATE wallets SET state = $2, updated_at = now() WHERE account_id = $1")
            .bind(account_id)
            .bind(state.as_str())
            .execute(&self.pool)
            .await
            .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;
        Ok(())
    }

    /// Reconcile the cached balance/blocked balance against the immutable
    /// ledger replay, correcting drift rather than trusting the cache
    /// blindly.
    pub async fn reconcile(&self, ledger: &Ledger, account_id: &str) -> Result<Wallet, TradingError> {
        let (ledger_balance, ledger_blocked) = ledger.recalculate_from_ledger(account_id).await?;
        let cached = self.get(account_id).await?;

        if cached.balance != ledger_balance || cached.blocked_balance != ledger_blocked {
            warn!(
                account_id,
                cached_balance = %cached.balance,
                ledger_balance = %ledger_balance,
                cached_blocked = %cached.blocked_balance,
                ledger_blocked = %ledger_blocked,
                "wallet cache drifted from ledger — correcting"
            );
            sqlx::query(
                "UPDATE wallets SET balance = $2, blocked_balance = $3, equity = $2, updated_at = now() \
                 WHERE account_id = $1",
            )
            .bind(account_id)
            .bind(ledger_balance)
            .bind(ledger_blocked)
            .execute(&self.pool)
            .await
            .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;
            return self.get(account_id).await;
        }

        Ok(cached)
    }
}

fn row_to_wallet(row: &sqlx::postgres::PgRow) -> Wallet {
    let account_type_str: String = row.try_get("account_type").unwrap_or_default();
    let state_str: String = row.try_get("state").unwrap_or_default();

    Wallet {
        account_id: row.try_get("account_id").unwrap_or_default(),
        account_type: if account_type_str == "MARGIN" {
            AccountType::Margin
        } else {
            AccountType::Cash
        },
        balance: row.try_get("balance").unwrap_or(Decimal::ZERO),
        blocked_balance: row.try_get("blocked_balance").unwrap_or(Decimal::ZERO),
        equity: row.try_get("equity").unwrap_or(Decimal::ZERO),
        state: match state_str.as_str() {
            "MARGIN_STRESSED" => AccountState::MarginStressed,
            "LIQUIDATING" => AccountState::Liquidating,
            _ => AccountState::Normal,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn available_excludes_blocked_balance() {
        let w = Wallet {
            account_id: "a1".into(),
            account_type: AccountType::Cash,
            balance: dec!(1000),
            blocked_balance: dec!(250),
            equity: dec!(1000),
            state: AccountState::Normal,
        };
        assert_eq!(w.available(), dec!(750));
    }

    #[test]
    fn state_wire_names_match_spec() {
        assert_eq!(AccountState::MarginStressed.as_str(), "MARGIN_STRESSED");
        assert_eq!(AccountState::Liquidating.as_str(), "LIQUIDATING");
    }
}
