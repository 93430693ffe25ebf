// =============================================================================
// C13 — Position Book
// =============================================================================
//
// Weighted-average-cost accounting per (account, instrument, product type).
// A trade that increases exposure blends into the average cost; a trade
// that decreases or reverses it realizes P&L on the portion closed. A
// position whose net quantity returns to zero is removed from the book
// rather than kept around as a zeroed row.
//
// Generalized from the engine's own `PositionManager`, replacing its
// stop-loss/take-profit exit ladder (strategy-specific, out of scope here)
// with pure cost-basis math plus direction-reversal handling.
// =============================================================================

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::errors::TradingError;
use crate::types::{InstrumentKey, ProductType, Segment, Side};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub account_id: String,
    pub key: InstrumentKey,
    pub product_type: ProductType,
    /// Signed quantity: positive is net long, negative is net short.
    pub net_quantity: i64,
    pub avg_cost: Decimal,
    pub realized_pnl: Decimal,
}

impl Position {
    pub fn is_flat(&self) -> bool {
        self.net_quantity == 0
    }
}

/// Result of applying one fill to the position book.
#[derive(Debug, Clone)]
pub struct FillOutcome {
    pub position: Option<Position>,
    pub realized_pnl_delta: Decimal,
    /// Portion of the fill that increased |position| (opened new exposure).
    pub opening_qty: u32,
    /// Portion of the fill that decreased |position| (closed existing exposure).
    pub closing_qty: u32,
    /// The position's average cost *before* this fill was applied — the
    /// cost basis being given up by the `closing_qty` portion.
    pub pre_fill_avg_cost: Decimal,
}

pub struct PositionBook {
    pool: PgPool,
}

impl PositionBook {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(
        &self,
        account_id: &str,
        key: &InstrumentKey,
        product_type: ProductType,
    ) -> Option<Position> {
        let row = sqlx::query(
            "SELECT id, account_id, instrument_segment, instrument_token, product_type, net_quantity, avg_cost, realized_pnl \
             FROM positions WHERE account_id = $1 AND instrument_segment = $2 AND instrument_token = $3 AND product_type = $4",
        )
        .bind(account_id)
        .bind(key.segment.to_string())
        .bind(&key.token)
        .bind(product_type.to_string())
        .fetch_optional(&self.pool)
        .await
        .ok()
        .flatten()?;

        Some(row_to_position(&row))
    }

    /// Apply a fill to the book inside the caller's transaction. Computes
    /// the weighted-average-cost update and any realized P&L purely in
    /// memory, then persists (or deletes, if the position is now flat).
    pub async fn apply_fill(
        tx: &mut Transaction<'_, Postgres>,
        account_id: &str,
        key: &InstrumentKey,
        product_type: ProductType,
        side: Side,
        fill_qty: u32,
        fill_price: Decimal,
    ) -> Result<FillOutcome, TradingError> {
        let existing_row = sqlx::query(
            "SELECT id, account_id, instrument_segment, instrument_token, product_type, net_quantity, avg_cost, realized_pnl \
             FROM positions WHERE account_id = $1 AND instrument_segment = $2 AND instrument_token = $3 AND product_type = $4 \
             FOR UPDATE",
        )
        .bind(account_id)
        .bind(key.segment.to_string())
        .bind(&key.token)
        .bind(product_type.to_string())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|_| TradingError::PositionNotFound(key.to_string()))?;

        let existing = existing_row.as_ref().map(row_to_position);
        let signed_fill = side.sign() as i64 * fill_qty as i64;
        let pre_fill_avg_cost = existing.as_ref().map(|p| p.avg_cost).unwrap_or(Decimal::ZERO);

        let update = match existing {
            None => PositionUpdate {
                new_net_qty: signed_fill,
                new_avg_cost: fill_price,
                realized_delta: Decimal::ZERO,
                opening_qty: fill_qty,
                closing_qty: 0,
            },
            Some(ref pos) => compute_update(pos.net_quantity, pos.avg_cost, signed_fill, fill_price),
        };
        let PositionUpdate { new_net_qty, new_avg_cost, realized_delta, opening_qty, closing_qty } = update;

        let realized_total = existing
            .as_ref()
            .map(|p| p.realized_pnl)
            .unwrap_or(Decimal::ZERO)
            + realized_delta;

        if new_net_qty == 0 {
            if let Some(pos) = &existing {
                sqlx::query("DELETE FROM positions WHERE id = $1")
                    .bind(pos.id)
                    .execute(&mut **tx)
                    .await
                    .map_err(|_| TradingError::PositionNotFound(key.to_string()))?;
            }
            info!(account_id, key = %key, "position closed (net qty returned to zero)");
            return Ok(FillOutcome {
                position: None,
                realized_pnl_delta: realized_delta,
                opening_qty,
                closing_qty,
                pre_fill_avg_cost,
            });
        }

        let id = existing.as_ref().map(|p| p.id).unwrap_or_else(Uuid::new_v4);
        sqlx::query(
            "INSERT INTO positions (id, account_id, instrument_segment, instrument_token, product_type, net_quantity, avg_cost, realized_pnl) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (account_id, instrument_segment, instrument_token, product_type) \
             DO UPDATE SET net_quantity = $6, avg_cost = $7, realized_pnl = $8, updated_at = now()",
        )
        .bind(id)
        .bind(account_id)
        .bind(key.segment.to_string())
        .bind(&key.token)
        .bind(product_type.to_string())
        .bind(new_net_qty)
        .bind(new_avg_cost)
        .bind(realized_total)
        .execute(&mut **tx)
        .await
        .map_err(|_| TradingError::PositionNotFound(key.to_string()))?;

        Ok(FillOutcome {
            position: Some(Position {
                id,
                account_id: account_id.to_string(),
                key: key.clone(),
                product_type,
                net_quantity: new_net_qty,
                avg_cost: new_avg_cost,
                realized_pnl: realized_total,
            }),
            realized_pnl_delta: realized_delta,
            opening_qty,
            closing_qty,
            pre_fill_avg_cost,
        })
    }

    pub async fn open_positions(&self, account_id: &str) -> Vec<Position> {
        let rows = sqlx::query(
            "SELECT id, account_id, instrument_segment, instrument_token, product_type, net_quantity, avg_cost, realized_pnl \
             FROM positions WHERE account_id = $1",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .unwrap_or_default();

        rows.iter().map(row_to_position).collect()
    }
}

/// Pure weighted-average-cost update, split out for unit testing without a
/// database.
struct PositionUpdate {
    new_net_qty: i64,
    new_avg_cost: Decimal,
    realized_delta: Decimal,
    opening_qty: u32,
    closing_qty: u32,
}

fn compute_update(
    net_qty: i64,
    avg_cost: Decimal,
    signed_fill: i64,
    fill_price: Decimal,
) -> PositionUpdate {
    let same_direction = net_qty == 0 || (net_qty > 0) == (signed_fill > 0);

    if same_direction {
        let new_qty = net_qty + signed_fill;
        let total_cost = avg_cost * Decimal::from(net_qty.abs()) + fill_price * Decimal::from(signed_fill.abs());
        let new_avg = if new_qty != 0 {
            total_cost / Decimal::from(new_qty.abs())
        } else {
            Decimal::ZERO
        };
        return PositionUpdate {
            new_net_qty: new_qty,
            new_avg_cost: new_avg,
            realized_delta: Decimal::ZERO,
            opening_qty: signed_fill.unsigned_abs() as u32,
            closing_qty: 0,
        };
    }

    let closing_qty = signed_fill.abs().min(net_qty.abs());
    let pnl_per_unit = if net_qty > 0 {
        fill_price - avg_cost
    } else {
        avg_cost - fill_price
    };
    let realized = pnl_per_unit * Decimal::from(closing_qty);

    let remaining_fill = signed_fill.abs() - closing_qty;
    let new_net_qty = net_qty + signed_fill;
    let opening_qty = remaining_fill.unsigned_abs() as u32;

    if remaining_fill == 0 {
        // Fill fully absorbed by closing the existing position (possibly to zero).
        PositionUpdate {
            new_net_qty,
            new_avg_cost: avg_cost,
            realized_delta: realized,
            opening_qty,
            closing_qty: closing_qty.unsigned_abs() as u32,
        }
    } else {
        // Direction reversed: the leftover quantity opens a fresh position
        // at the fill price.
        PositionUpdate {
            new_net_qty,
            new_avg_cost: fill_price,
            realized_delta: realized,
            opening_qty,
            closing_qty: closing_qty.unsigned_abs() as u32,
        }
    }
}

fn row_to_position(row: &sqlx::postgres::PgRow) -> Position {
    let segment_str: String = row.try_get("instrument_segment").unwrap_or_default();
    let product_str: String = row.try_get("product_type").unwrap_or_default();

    Position {
        id: row.try_get("id").unwrap_or_default(),
        account_id: row.try_get("account_id").unwrap_or_default(),
        key: InstrumentKey::new(
            segment_str.parse().unwrap_or(Segment::NseEq),
            row.try_get::<String, _>("instrument_token").unwrap_or_default(),
        ),
        product_type: match product_str.as_str() {
            "MIS" => ProductType::Mis,
            "NRML" => ProductType::Nrml,
            _ => ProductType::Cnc,
        },
        net_quantity: row.try_get("net_quantity").unwrap_or(0),
        avg_cost: row.try_get("avg_cost").unwrap_or(Decimal::ZERO),
        realized_pnl: row.try_get("realized_pnl").unwrap_or(Decimal::ZERO),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn opening_a_fresh_long_position() {
        let u = compute_update(0, Decimal::ZERO, 10, dec!(100));
        assert_eq!(u.new_net_qty, 10);
        assert_eq!(u.new_avg_cost, dec!(100));
        assert_eq!(u.realized_delta, Decimal::ZERO);
        assert_eq!(u.opening_qty, 10);
        assert_eq!(u.closing_qty, 0);
    }

    #[test]
    fn adding_to_a_long_position_blends_cost() {
        let u = compute_update(10, dec!(100), 10, dec!(120));
        assert_eq!(u.new_net_qty, 20);
        assert_eq!(u.new_avg_cost, dec!(110));
        assert_eq!(u.realized_delta, Decimal::ZERO);
        assert_eq!(u.opening_qty, 10);
        assert_eq!(u.closing_qty, 0);
    }

    #[test]
    fn partially_closing_a_long_realizes_pnl() {
        let u = compute_update(10, dec!(100), -4, dec!(110));
        assert_eq!(u.new_net_qty, 6);
        assert_eq!(u.new_avg_cost, dec!(100));
        assert_eq!(u.realized_delta, dec!(40));
        assert_eq!(u.opening_qty, 0);
        assert_eq!(u.closing_qty, 4);
    }

    #[test]
    fn fully_closing_a_long_realizes_pnl_and_zeroes_qty() {
        let u = compute_update(10, dec!(100), -10, dec!(95));
        assert_eq!(u.new_net_qty, 0);
        assert_eq!(u.realized_delta, dec!(-50));
        assert_eq!(u.opening_qty, 0);
        assert_eq!(u.closing_qty, 10);
    }

    #[test]
    fn reversing_direction_opens_fresh_position_at_fill_price() {
        let u = compute_update(10, dec!(100), -15, dec!(105));
        assert_eq!(u.new_net_qty, -5);
        assert_eq!(u.new_avg_cost, dec!(105));
        assert_eq!(u.realized_delta, dec!(50));
        assert_eq!(u.opening_qty, 5);
        assert_eq!(u.closing_qty, 10);
    }

    #[test]
    fn shorting_then_adding_blends_cost() {
        let u = compute_update(-10, dec!(100), -10, dec!(90));
        assert_eq!(u.new_net_qty, -20);
        assert_eq!(u.new_avg_cost, dec!(95));
        assert_eq!(u.realized_delta, Decimal::ZERO);
        assert_eq!(u.opening_qty, 10);
        assert_eq!(u.closing_qty, 0);
    }
}
