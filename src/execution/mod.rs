// =============================================================================
// C12 — Order / Execution Engine
// =============================================================================
//
// Placement is two-phase: `place_order` runs pretrade checks, blocks margin
// and writes an OPEN order row inside one WAJ-wrapped transaction; a
// separate execution loop (`run_execution_loop`) scans OPEN orders and
// fills them against the current mark — immediately for MARKET orders,
// only once the mark crosses the limit for LIMIT orders — in its own
// WAJ-wrapped transaction. Cancelling an OPEN order releases its blocked
// margin. Liquidation force-closes bypass the split entirely through
// `liquidate_position`, since the sweep needs the position/wallet state to
// reflect the close before its next iteration, not after the next loop
// tick.
//
// Generalized from the engine's own `ExecutionEngine` (risk-gate then
// demo/live dispatch), keeping the discriminated-outcome idiom of
// `ExecutionResult` but replacing the demo/live branch with "papers every
// trade against its own mark price" — there is no live venue to route to.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::TradingError;
use crate::journal::{Journal, OperationType};
use crate::ledger::{Ledger, LedgerAccountType, ReferenceType};
use crate::positions::PositionBook;
use crate::snapshot_cache::SnapshotCache;
use crate::types::{Instrument, InstrumentKey, OrderStatus, OrderType, ProductType, Segment, Side};
use crate::wallet::WalletCache;

const EXECUTION_LOOP_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub account_id: String,
    pub instrument: Instrument,
    pub side: Side,
    pub order_type: OrderType,
    pub product_type: ProductType,
    pub quantity: u32,
    pub limit_price: Option<Decimal>,
    pub idempotency_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub order_id: Uuid,
    pub status: OrderStatus,
    pub filled_quantity: u32,
    pub avg_fill_price: Option<Decimal>,
}

pub struct ExecutionEngine {
    pool: PgPool,
    journal: Journal,
    wallet_cache: WalletCache,
    position_book: PositionBook,
    snapshot_cache: Arc<SnapshotCache>,
}

impl ExecutionEngine {
    pub fn new(
        pool: PgPool,
        journal: Journal,
        wallet_cache: WalletCache,
        position_book: PositionBook,
        snapshot_cache: Arc<SnapshotCache>,
    ) -> Self {
        Self {
            pool,
            journal,
            wallet_cache,
            position_book,
            snapshot_cache,
        }
    }

    /// Per-lot margin requirement for a product type, as a multiple of
    /// notional value. Multi-leg/combo margin netting is out of scope —
    /// every position is margined independently.
    fn margin_fraction(product_type: ProductType) -> Decimal {
        match product_type {
            ProductType::Cnc => Decimal::ONE,
            ProductType::Mis => Decimal::new(20, 2),  // 20% of notional
            ProductType::Nrml => Decimal::new(15, 2), // 15% of notional
        }
    }

    async fn pretrade_check(&self, req: &OrderRequest) -> Result<Decimal, TradingError> {
        if req.quantity == 0 || req.quantity % req.instrument.lot_size != 0 {
            return Err(TradingError::InvalidLotSize(req.quantity));
        }

        if let Some(expiry) = req.instrument.expiry_ms {
            if chrono::Utc::now().timestamp_millis() > expiry {
                return Err(TradingError::ExpiredInstrument);
            }
        }

        let snapshots = self
            .snapshot_cache
            .get(&[req.instrument.key.clone()])
            .await
            .map_err(|_| TradingError::IlliquidContract)?;
        let snapshot = snapshots.first().ok_or(TradingError::IlliquidContract)?;

        let now_ms = chrono::Utc::now().timestamp_millis();
        let age_ms = now_ms - snapshot.as_of_ms;
        const MAX_STALE_MS: i64 = 10_000;
        if age_ms > MAX_STALE_MS {
            return Err(TradingError::StalePrice {
                age_ms,
                max_ms: MAX_STALE_MS,
            });
        }

        let mark_price = Decimal::try_from(snapshot.ltp).unwrap_or(Decimal::ZERO);
        Ok(mark_price)
    }

    /// Reject an order that would shrink an open position without flattening
    /// or reversing it. The engine only supports full-exit or
    /// direction-reversal fills, so a partial-size opposite-side order is
    /// rejected up front rather than left to the position math to absorb.
    async fn check_partial_exit(&self, req: &OrderRequest) -> Result<(), TradingError> {
        let Some(pos) = self
            .position_book
            .get(&req.account_id, &req.instrument.key, req.product_type)
            .await
        else {
            return Ok(());
        };

        let is_opposite =
            (pos.net_quantity > 0 && req.side == Side::Sell) || (pos.net_quantity < 0 && req.side == Side::Buy);
        if is_opposite && (req.quantity as i64) < pos.net_quantity.abs() {
            return Err(TradingError::PartialExitNotAllowed);
        }
        Ok(())
    }

    /// Place an order: pretrade checks, margin block, OPEN row — all wrapped
    /// by the journal in one transaction. Filling happens later, in
    /// `run_execution_loop`.
    pub async fn place_order(&self, req: OrderRequest) -> Result<ExecutionOutcome, TradingError> {
        let mark_price = self.pretrade_check(&req).await?;
        self.check_partial_exit(&req).await?;

        let basis_price = req.limit_price.unwrap_or(mark_price);
        let notional = basis_price * Decimal::from(req.quantity);
        let margin_required = notional * Self::margin_fraction(req.product_type);

        let order_id = Uuid::new_v4();

        let payload = serde_json::json!({
            "order_id": order_id,
            "account_id": req.account_id,
            "instrument": req.instrument.key.canonical(),
            "side": req.side.to_string(),
            "order_type": format!("{:?}", req.order_type),
            "quantity": req.quantity,
            "margin_required": margin_required.to_string(),
            "idempotency_key": req.idempotency_key,
        });

        let journal_id = self
            .journal
            .prepare(OperationType::TradeExecution, &req.account_id, &order_id.to_string(), payload, None)
            .await
            .map_err(|_| TradingError::TradingHalted("journal unavailable".into()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| TradingError::WalletNotFound(req.account_id.clone()))?;

        let wallet = WalletCache::lock_for_update(&mut tx, &req.account_id).await?;
        if wallet.available() < margin_required {
            let _ = self.journal.abort(journal_id).await;
            return Err(TradingError::InsufficientFunds {
                required: margin_required.to_string(),
                available: wallet.available().to_string(),
            });
        }

        let block_entry = Ledger::post(
            &mut tx,
            &req.account_id,
            LedgerAccountType::Cash,
            LedgerAccountType::MarginBlocked,
            margin_required,
            ReferenceType::Order,
            Some(&order_id.to_string()),
            &format!("{}:block", req.idempotency_key),
        )
        .await?;

        WalletCache::apply_delta(&mut tx, &req.account_id, Decimal::ZERO, margin_required).await?;

        sqlx::query(
            "INSERT INTO orders (id, account_id, instrument_segment, instrument_token, side, order_type, product_type, quantity, filled_quantity, limit_price, margin_blocked, status, idempotency_key) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0, $9, $10, 'OPEN', $11)",
        )
        .bind(order_id)
        .bind(&req.account_id)
        .bind(req.instrument.key.segment.to_string())
        .bind(&req.instrument.key.token)
        .bind(req.side.to_string())
        .bind(format!("{:?}", req.order_type))
        .bind(req.product_type.to_string())
        .bind(req.quantity as i64)
        .bind(req.limit_price)
        .bind(margin_required)
        .bind(&req.idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if e.to_string().contains("idempotency_key") {
                TradingError::DuplicateOrder
            } else {
                TradingError::WalletNotFound(req.account_id.clone())
            }
        })?;

        tx.commit()
            .await
            .map_err(|_| TradingError::WalletNotFound(req.account_id.clone()))?;

        self.journal
            .commit(journal_id, &[block_entry.global_sequence])
            .await
            .map_err(|_| TradingError::TradingHalted("journal commit failed".into()))?;

        if let Ok(wallet) = self.wallet_cache.get(&req.account_id).await {
            info!(order_id = %order_id, account_id = %req.account_id, %margin_required, available = %wallet.available(), "order opened, margin blocked");
        }

        Ok(ExecutionOutcome {
            order_id,
            status: OrderStatus::Open,
            filled_quantity: 0,
            avg_fill_price: None,
        })
    }

    /// Cancel an OPEN (or partially filled) order, releasing whatever
    /// margin it still has blocked.
    pub async fn cancel_order(&self, account_id: &str, order_id: Uuid) -> Result<(), TradingError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?;

        let row = sqlx::query(
            "SELECT status, margin_blocked, idempotency_key FROM orders WHERE id = $1 AND account_id = $2 FOR UPDATE",
        )
        .bind(order_id)
        .bind(account_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?
        .ok_or_else(|| TradingError::OrderNotFound(order_id.to_string()))?;

        let status: String = row.try_get("status").unwrap_or_default();
        if status != "OPEN" && status != "PARTIALLY_FILLED" {
            return Err(TradingError::OrderNotCancellable(order_id.to_string()));
        }
        let margin_blocked: Decimal = row.try_get("margin_blocked").unwrap_or(Decimal::ZERO);
        let idempotency_key: String = row.try_get("idempotency_key").unwrap_or_default();
        let cancel_key = format!("{idempotency_key}:cancel");

        let payload = serde_json::json!({
            "order_id": order_id,
            "account_id": account_id,
            "action": "cancel",
            "margin_released": margin_blocked.to_string(),
            "idempotency_key": cancel_key,
        });
        let journal_id = self
            .journal
            .prepare(OperationType::LedgerEntry, account_id, &order_id.to_string(), payload, None)
            .await
            .map_err(|_| TradingError::TradingHalted("journal unavailable".into()))?;

        let mut sequences = Vec::new();
        if margin_blocked > Decimal::ZERO {
            let entry = Ledger::post(
                &mut tx,
                account_id,
                LedgerAccountType::MarginBlocked,
                LedgerAccountType::Cash,
                margin_blocked,
                ReferenceType::Order,
                Some(&order_id.to_string()),
                &cancel_key,
            )
            .await?;
            sequences.push(entry.global_sequence);
            WalletCache::apply_delta(&mut tx, account_id, Decimal::ZERO, -margin_blocked).await?;
        }

        sqlx::query("UPDATE orders SET status = 'CANCELLED', margin_blocked = 0, updated_at = now() WHERE id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await
            .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?;

        tx.commit()
            .await
            .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?;

        self.journal
            .commit(journal_id, &sequences)
            .await
            .map_err(|_| TradingError::TradingHalted("journal commit failed".into()))?;

        info!(order_id = %order_id, account_id, %margin_blocked, "order cancelled, margin released");
        Ok(())
    }

    /// Background task: repeatedly scans OPEN orders and fills the ones
    /// whose trigger condition is met against the current mark price.
    pub async fn run_execution_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(EXECUTION_LOOP_INTERVAL_MS));
        loop {
            ticker.tick().await;
            if let Err(e) = self.scan_open_orders().await {
                warn!(error = %e, "execution loop scan failed");
            }
        }
    }

    async fn scan_open_orders(&self) -> anyhow::Result<()> {
        let rows = sqlx::query(
            "SELECT id, account_id, instrument_segment, instrument_token, side, order_type, product_type, quantity, limit_price, margin_blocked, idempotency_key \
             FROM orders WHERE status = 'OPEN'",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let order_id: Uuid = row.try_get("id")?;
            let account_id: String = row.try_get("account_id")?;
            let segment_str: String = row.try_get("instrument_segment")?;
            let token: String = row.try_get("instrument_token")?;
            let side_str: String = row.try_get("side")?;
            let order_type_str: String = row.try_get("order_type")?;
            let product_str: String = row.try_get("product_type")?;
            let quantity: i64 = row.try_get("quantity")?;
            let limit_price: Option<Decimal> = row.try_get("limit_price")?;
            let margin_blocked: Decimal = row.try_get("margin_blocked")?;
            let idempotency_key: String = row.try_get("idempotency_key")?;

            let key = InstrumentKey::new(segment_str.parse().unwrap_or(Segment::NseEq), token);
            let side = if side_str == "SELL" { Side::Sell } else { Side::Buy };
            let product_type = match product_str.as_str() {
                "MIS" => ProductType::Mis,
                "NRML" => ProductType::Nrml,
                _ => ProductType::Cnc,
            };

            let snapshots = match self.snapshot_cache.get(&[key.clone()]).await {
                Ok(s) => s,
                Err(_) => continue,
            };
            let Some(snapshot) = snapshots.first() else {
                continue;
            };
            let mark_price = Decimal::try_from(snapshot.ltp).unwrap_or(Decimal::ZERO);

            let should_fill = match order_type_str.as_str() {
                "Limit" => match (side, limit_price) {
                    (Side::Buy, Some(limit)) => mark_price <= limit,
                    (Side::Sell, Some(limit)) => mark_price >= limit,
                    _ => false,
                },
                _ => true,
            };
            if !should_fill {
                continue;
            }

            if let Err(e) = self
                .fill_order(order_id, &account_id, &key, product_type, side, quantity as u32, margin_blocked, mark_price, &idempotency_key)
                .await
            {
                warn!(order_id = %order_id, error = %e, "fill attempt failed");
            }
        }
        Ok(())
    }

    /// Fill an OPEN order in full against `fill_price`: releases its
    /// blocked margin, applies the fill to the position book, and posts the
    /// cash leg of the trade (debit CASH for a buy, credit CASH for a sell).
    #[allow(clippy::too_many_arguments)]
    async fn fill_order(
        &self,
        order_id: Uuid,
        account_id: &str,
        key: &InstrumentKey,
        product_type: ProductType,
        side: Side,
        quantity: u32,
        margin_blocked: Decimal,
        fill_price: Decimal,
        idempotency_key: &str,
    ) -> Result<(), TradingError> {
        let payload = serde_json::json!({
            "order_id": order_id,
            "account_id": account_id,
            "fill_price": fill_price.to_string(),
            "quantity": quantity,
            "idempotency_key": format!("{idempotency_key}:fill"),
        });
        let journal_id = self
            .journal
            .prepare(OperationType::TradeExecution, account_id, &order_id.to_string(), payload, None)
            .await
            .map_err(|_| TradingError::TradingHalted("journal unavailable".into()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?;

        // Re-check under lock: another task may have filled or cancelled
        // this order since the scan read it.
        let row = sqlx::query("SELECT status FROM orders WHERE id = $1 FOR UPDATE")
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?
            .ok_or_else(|| TradingError::OrderNotFound(order_id.to_string()))?;
        let status: String = row.try_get("status").unwrap_or_default();
        if status != "OPEN" {
            let _ = self.journal.abort(journal_id).await;
            return Ok(());
        }

        let mut sequences = Vec::new();

        if margin_blocked > Decimal::ZERO {
            let release = Ledger::post(
                &mut tx,
                account_id,
                LedgerAccountType::MarginBlocked,
                LedgerAccountType::Cash,
                margin_blocked,
                ReferenceType::Trade,
                Some(&order_id.to_string()),
                &format!("{idempotency_key}:release"),
            )
            .await?;
            sequences.push(release.global_sequence);
            WalletCache::apply_delta(&mut tx, account_id, Decimal::ZERO, -margin_blocked).await?;
        }

        let fill_outcome =
            PositionBook::apply_fill(&mut tx, account_id, key, product_type, side, quantity, fill_price).await?;

        let notional = fill_price * Decimal::from(quantity);
        let cash_entry = match side {
            Side::Buy => {
                Ledger::post(
                    &mut tx,
                    account_id,
                    LedgerAccountType::Cash,
                    LedgerAccountType::UnrealizedPnl,
                    notional,
                    ReferenceType::Trade,
                    Some(&order_id.to_string()),
                    &format!("{idempotency_key}:cash"),
                )
                .await?
            }
            Side::Sell => {
                Ledger::post(
                    &mut tx,
                    account_id,
                    LedgerAccountType::UnrealizedPnl,
                    LedgerAccountType::Cash,
                    notional,
                    ReferenceType::Trade,
                    Some(&order_id.to_string()),
                    &format!("{idempotency_key}:cash"),
                )
                .await?
            }
        };
        sequences.push(cash_entry.global_sequence);

        sqlx::query("UPDATE orders SET status = 'FILLED', filled_quantity = $2, margin_blocked = 0, updated_at = now() WHERE id = $1")
            .bind(order_id)
            .bind(quantity as i64)
            .execute(&mut *tx)
            .await
            .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?;

        sqlx::query("INSERT INTO trades (id, order_id, account_id, quantity, price) VALUES ($1, $2, $3, $4, $5)")
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(account_id)
            .bind(quantity as i64)
            .bind(fill_price)
            .execute(&mut *tx)
            .await
            .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?;

        tx.commit()
            .await
            .map_err(|_| TradingError::OrderNotFound(order_id.to_string()))?;

        self.journal
            .commit(journal_id, &sequences)
            .await
            .map_err(|_| TradingError::TradingHalted("journal commit failed".into()))?;

        info!(
            order_id = %order_id,
            account_id,
            %fill_price,
            realized_pnl_delta = %fill_outcome.realized_pnl_delta,
            "order filled"
        );
        Ok(())
    }

    /// Force-close `quantity` of a position at `fill_price` on behalf of the
    /// liquidation sweep. Bypasses the placement/execution-loop split
    /// entirely: there's no order to block margin for, just an immediate
    /// position close and its cash leg, wrapped in its own journal record.
    #[allow(clippy::too_many_arguments)]
    pub async fn liquidate_position(
        &self,
        account_id: &str,
        key: &InstrumentKey,
        product_type: ProductType,
        side: Side,
        quantity: u32,
        fill_price: Decimal,
        idempotency_key: &str,
    ) -> Result<ExecutionOutcome, TradingError> {
        let order_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "order_id": order_id,
            "account_id": account_id,
            "instrument": key.canonical(),
            "side": side.to_string(),
            "quantity": quantity,
            "fill_price": fill_price.to_string(),
            "idempotency_key": idempotency_key,
        });
        let journal_id = self
            .journal
            .prepare(OperationType::Liquidation, account_id, &order_id.to_string(), payload, None)
            .await
            .map_err(|_| TradingError::TradingHalted("journal unavailable".into()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;

        let fill_outcome =
            PositionBook::apply_fill(&mut tx, account_id, key, product_type, side, quantity, fill_price).await?;

        let notional = fill_price * Decimal::from(quantity);
        let cash_entry = match side {
            Side::Buy => {
                Ledger::post(
                    &mut tx,
                    account_id,
                    LedgerAccountType::Cash,
                    LedgerAccountType::UnrealizedPnl,
                    notional,
                    ReferenceType::Liquidation,
                    Some(&order_id.to_string()),
                    idempotency_key,
                )
                .await?
            }
            Side::Sell => {
                Ledger::post(
                    &mut tx,
                    account_id,
                    LedgerAccountType::UnrealizedPnl,
                    LedgerAccountType::Cash,
                    notional,
                    ReferenceType::Liquidation,
                    Some(&order_id.to_string()),
                    idempotency_key,
                )
                .await?
            }
        };
        let sequences = vec![cash_entry.global_sequence];

        sqlx::query(
            "INSERT INTO orders (id, account_id, instrument_segment, instrument_token, side, order_type, product_type, quantity, filled_quantity, limit_price, margin_blocked, status, idempotency_key) \
             VALUES ($1, $2, $3, $4, $5, 'Market', $6, $7, $7, NULL, 0, 'FILLED', $8)",
        )
        .bind(order_id)
        .bind(account_id)
        .bind(key.segment.to_string())
        .bind(&key.token)
        .bind(side.to_string())
        .bind(product_type.to_string())
        .bind(quantity as i64)
        .bind(idempotency_key)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if e.to_string().contains("idempotency_key") {
                TradingError::DuplicateOrder
            } else {
                TradingError::WalletNotFound(account_id.to_string())
            }
        })?;

        sqlx::query("INSERT INTO trades (id, order_id, account_id, quantity, price) VALUES ($1, $2, $3, $4, $5)")
            .bind(Uuid::new_v4())
            .bind(order_id)
            .bind(account_id)
            .bind(quantity as i64)
            .bind(fill_price)
            .execute(&mut *tx)
            .await
            .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;

        tx.commit()
            .await
            .map_err(|_| TradingError::WalletNotFound(account_id.to_string()))?;

        self.journal
            .commit(journal_id, &sequences)
            .await
            .map_err(|_| TradingError::TradingHalted("journal commit failed".into()))?;

        info!(
            order_id = %order_id,
            account_id,
            %fill_price,
            realized_pnl_delta = %fill_outcome.realized_pnl_delta,
            "position force-closed by liquidation"
        );

        Ok(ExecutionOutcome {
            order_id,
            status: OrderStatus::Filled,
            filled_quantity: quantity,
            avg_fill_price: Some(fill_price),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn margin_fraction_by_product_type() {
        assert_eq!(
            ExecutionEngine::margin_fraction(ProductType::Cnc),
            Decimal::ONE
        );
        assert!(ExecutionEngine::margin_fraction(ProductType::Mis) < Decimal::ONE);
        assert!(
            ExecutionEngine::margin_fraction(ProductType::Mis)
                > ExecutionEngine::margin_fraction(ProductType::Nrml)
        );
    }
}
