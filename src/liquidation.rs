// =============================================================================
// C14 — Liquidation Engine
// =============================================================================
//
// Periodically marks every open position to the latest snapshot price,
// computes account equity against margin used, and — for any account whose
// margin fraction has breached the maintenance threshold — force-closes
// exactly one position per iteration, recomputing risk fresh after each
// close, until the breach clears or `liquidation_max_steps` is spent. The
// account's risk state (NORMAL / MARGIN_STRESSED / LIQUIDATING) is written
// back to the wallet as the sweep progresses, so the rest of the engine
// (and the API) can see an account mid-liquidation.
//
// Shape is the same "collect the work while holding state, then mutate
// outside the lock" pattern the exit monitor uses for triple-barrier
// evaluation — except here each close changes the very risk numbers that
// decide whether another one is needed, so the work list is recomputed
// every iteration rather than collected once up front.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::execution::ExecutionEngine;
use crate::positions::{Position, PositionBook};
use crate::snapshot_cache::SnapshotCache;
use crate::types::{ProductType, Side};
use crate::wallet::{AccountState, WalletCache};

const SWEEP_INTERVAL_SECS: u64 = 5;
/// Below this fraction of margin used, an account is forced flat.
const MAINTENANCE_MARGIN_FRACTION: Decimal = Decimal::from_parts(25, 0, 0, false, 2); // 0.25
/// Below this (but at or above the maintenance floor), an account is merely
/// flagged as stressed rather than actively liquidated.
const MARGIN_STRESS_FRACTION: Decimal = Decimal::from_parts(50, 0, 0, false, 2); // 0.50

struct PricedPosition {
    pos: Position,
    mark: Decimal,
    pos_margin: Decimal,
    notional: Decimal,
    unrealized_loss: Decimal,
}

struct RiskSnapshot {
    equity: Decimal,
    margin_used: Decimal,
    margin_fraction: Decimal,
    priced: Vec<PricedPosition>,
}

pub struct LiquidationEngine {
    wallet_cache: Arc<WalletCache>,
    position_book: Arc<PositionBook>,
    snapshot_cache: Arc<SnapshotCache>,
    execution: Arc<ExecutionEngine>,
    max_steps: u32,
}

impl LiquidationEngine {
    pub fn new(
        wallet_cache: Arc<WalletCache>,
        position_book: Arc<PositionBook>,
        snapshot_cache: Arc<SnapshotCache>,
        execution: Arc<ExecutionEngine>,
        max_steps: u32,
    ) -> Self {
        Self {
            wallet_cache,
            position_book,
            snapshot_cache,
            execution,
            max_steps,
        }
    }

    pub async fn run(self: Arc<Self>, accounts: Vec<String>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(SWEEP_INTERVAL_SECS));
        loop {
            ticker.tick().await;
            for account_id in &accounts {
                if let Err(e) = self.sweep_account(account_id).await {
                    error!(account_id, error = %e, "liquidation sweep failed for account");
                }
            }
        }
    }

    /// Iteratively recomputes risk and force-closes the single worst
    /// position each pass, bounded by `max_steps`. Exits as soon as the
    /// margin fraction clears the maintenance floor.
    async fn sweep_account(&self, account_id: &str) -> anyhow::Result<()> {
        let mut liquidating = false;

        for _ in 0..self.max_steps {
            let risk = self.compute_risk(account_id).await?;

            if risk.priced.is_empty() {
                self.wallet_cache.mark_state(account_id, AccountState::Normal).await.ok();
                return Ok(());
            }

            if risk.margin_fraction >= MAINTENANCE_MARGIN_FRACTION {
                let state = if risk.margin_fraction < MARGIN_STRESS_FRACTION {
                    AccountState::MarginStressed
                } else {
                    AccountState::Normal
                };
                self.wallet_cache.mark_state(account_id, state).await.ok();
                return Ok(());
            }

            if !liquidating {
                warn!(
                    account_id,
                    equity = %risk.equity,
                    margin_used = %risk.margin_used,
                    margin_fraction = %risk.margin_fraction,
                    "account breached maintenance margin — liquidating"
                );
                self.wallet_cache.mark_state(account_id, AccountState::Liquidating).await.ok();
                liquidating = true;
            }

            let worst = Self::pick_worst(&risk.priced);
            self.force_close(account_id, &worst.pos, worst.mark).await;
        }

        if liquidating {
            error!(account_id, max_steps = self.max_steps, "liquidation sweep exhausted its step budget with the account still breached");
        }
        Ok(())
    }

    async fn compute_risk(&self, account_id: &str) -> anyhow::Result<RiskSnapshot> {
        let wallet = self.wallet_cache.get(account_id).await?;
        let positions = self.position_book.open_positions(account_id).await;

        let mut margin_used = Decimal::ZERO;
        let mut unrealized_total = Decimal::ZERO;
        let mut priced = Vec::new();

        for pos in positions {
            let snapshots = self.snapshot_cache.get(&[pos.key.clone()]).await?;
            let Some(snapshot) = snapshots.first() else {
                continue;
            };
            let mark = Decimal::try_from(snapshot.ltp).unwrap_or(pos.avg_cost);
            let notional = mark * Decimal::from(pos.net_quantity.abs());
            let pos_margin = notional * Self::margin_fraction_estimate(pos.product_type);
            let pnl = (mark - pos.avg_cost) * Decimal::from(pos.net_quantity);
            let unrealized_loss = (-pnl).max(Decimal::ZERO);

            margin_used += pos_margin;
            unrealized_total += pnl;
            priced.push(PricedPosition {
                pos,
                mark,
                pos_margin,
                notional,
                unrealized_loss,
            });
        }

        let equity = wallet.balance + unrealized_total;
        let margin_fraction = if margin_used.is_zero() {
            Decimal::MAX
        } else {
            equity / margin_used
        };

        Ok(RiskSnapshot {
            equity,
            margin_used,
            margin_fraction,
            priced,
        })
    }

    /// Priority: highest margin usage first, ties broken by largest
    /// unrealized loss, then largest notional, then ascending instrument
    /// key for full determinism.
    fn pick_worst(priced: &[PricedPosition]) -> &PricedPosition {
        priced
            .iter()
            .max_by(|a, b| {
                a.pos_margin
                    .cmp(&b.pos_margin)
                    .then_with(|| a.unrealized_loss.cmp(&b.unrealized_loss))
                    .then_with(|| a.notional.cmp(&b.notional))
                    .then_with(|| b.pos.key.canonical().cmp(&a.pos.key.canonical()))
            })
            .expect("priced is non-empty")
    }

    fn margin_fraction_estimate(product_type: ProductType) -> Decimal {
        match product_type {
            ProductType::Cnc => Decimal::ONE,
            ProductType::Mis => Decimal::new(20, 2),
            ProductType::Nrml => Decimal::new(15, 2),
        }
    }

    async fn force_close(&self, account_id: &str, pos: &Position, mark_price: Decimal) {
        let side = if pos.net_quantity > 0 { Side::Sell } else { Side::Buy };
        let quantity = pos.net_quantity.unsigned_abs() as u32;
        let idempotency_key = format!("liquidation:{}:{}", pos.id, mark_price);

        match self
            .execution
            .liquidate_position(account_id, &pos.key, pos.product_type, side, quantity, mark_price, &idempotency_key)
            .await
        {
            Ok(outcome) => info!(account_id, order_id = %outcome.order_id, key = %pos.key, "forced liquidation order filled"),
            Err(e) => error!(account_id, error = %e, key = %pos.key, "forced liquidation order failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InstrumentKey, Segment};
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn pos(token: &str, net_quantity: i64, avg_cost: Decimal, product_type: ProductType) -> Position {
        Position {
            id: Uuid::new_v4(),
            account_id: "demo".into(),
            key: InstrumentKey::new(Segment::NseEq, token),
            product_type,
            net_quantity,
            avg_cost,
            realized_pnl: Decimal::ZERO,
        }
    }

    fn priced(p: Position, mark: Decimal) -> PricedPosition {
        let notional = mark * Decimal::from(p.net_quantity.abs());
        let pos_margin = notional * LiquidationEngine::margin_fraction_estimate(p.product_type);
        let pnl = (mark - p.avg_cost) * Decimal::from(p.net_quantity);
        let unrealized_loss = (-pnl).max(Decimal::ZERO);
        PricedPosition {
            pos: p,
            mark,
            pos_margin,
            notional,
            unrealized_loss,
        }
    }

    #[test]
    fn margin_fraction_estimate_matches_execution_engine_table() {
        assert_eq!(
            LiquidationEngine::margin_fraction_estimate(ProductType::Cnc),
            Decimal::ONE
        );
        assert!(
            LiquidationEngine::margin_fraction_estimate(ProductType::Mis)
                > LiquidationEngine::margin_fraction_estimate(ProductType::Nrml)
        );
    }

    #[test]
    fn picks_highest_margin_usage_first() {
        let cheap = priced(pos("1", 10, dec!(100), ProductType::Nrml), dec!(100));
        let expensive = priced(pos("2", 10, dec!(100), ProductType::Cnc), dec!(100));
        let worst = LiquidationEngine::pick_worst(&[cheap, expensive]);
        assert_eq!(worst.pos.key.token, "2");
    }

    #[test]
    fn ties_broken_by_ascending_instrument_key() {
        let a = priced(pos("AAA", 10, dec!(100), ProductType::Cnc), dec!(100));
        let b = priced(pos("BBB", 10, dec!(100), ProductType::Cnc), dec!(100));
        let worst = LiquidationEngine::pick_worst(&[b, a]);
        assert_eq!(worst.pos.key.token, "AAA");
    }
}
