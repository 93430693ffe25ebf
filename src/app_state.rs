// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth tying together the Market-Data Pipeline and
// the Financial Core. Every subsystem holds its own interior mutability;
// AppState just wires Arc references together and exposes a version-counter
// driven snapshot for the REST/WS introspection surface.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::execution::ExecutionEngine;
use crate::journal::Journal;
use crate::ledger::Ledger;
use crate::liquidation::LiquidationEngine;
use crate::market_data::{CandleEngine, MarketFeedSupervisor, SubscriptionRegistry, TickBus};
use crate::positions::PositionBook;
use crate::runtime_config::RuntimeConfig;
use crate::snapshot_cache::SnapshotCache;
use crate::types::Instrument;
use crate::wallet::WalletCache;

const MAX_RECENT_ERRORS: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    pub message: String,
    pub code: Option<String>,
    pub at: String,
}

#[derive(Debug, Serialize)]
pub struct StateSnapshot {
    pub state_version: u64,
    pub trading_mode: String,
    pub connected_fanout_clients: usize,
    pub active_subscriptions: usize,
    pub tick_bus: crate::market_data::tick_bus::TickBusStatsSnapshot,
    pub candle_engine: crate::market_data::candle::CandleEngineStatsSnapshot,
    pub snapshot_cache: crate::snapshot_cache::SnapshotCacheStats,
    pub recent_errors: Vec<ErrorRecord>,
}

pub struct AppState {
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub instruments: Arc<RwLock<std::collections::HashMap<String, Instrument>>>,

    pub tick_bus: Arc<TickBus>,
    pub candle_engine: Arc<CandleEngine>,
    pub subscription_registry: Arc<SubscriptionRegistry>,
    pub market_feed_supervisor: Arc<MarketFeedSupervisor>,
    pub fanout_server: Arc<crate::fanout::FanoutServer>,
    pub snapshot_cache: Arc<SnapshotCache>,

    pub journal: Arc<Journal>,
    pub ledger: Arc<Ledger>,
    pub wallet_cache: Arc<WalletCache>,
    pub position_book: Arc<PositionBook>,
    pub execution_engine: Arc<ExecutionEngine>,
    pub liquidation_engine: Arc<LiquidationEngine>,

    recent_errors: RwLock<Vec<ErrorRecord>>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime_config: RuntimeConfig,
        tick_bus: Arc<TickBus>,
        candle_engine: Arc<CandleEngine>,
        subscription_registry: Arc<SubscriptionRegistry>,
        market_feed_supervisor: Arc<MarketFeedSupervisor>,
        fanout_server: Arc<crate::fanout::FanoutServer>,
        snapshot_cache: Arc<SnapshotCache>,
        journal: Arc<Journal>,
        ledger: Arc<Ledger>,
        wallet_cache: Arc<WalletCache>,
        position_book: Arc<PositionBook>,
        execution_engine: Arc<ExecutionEngine>,
        liquidation_engine: Arc<LiquidationEngine>,
    ) -> Self {
        Self {
            state_version: AtomicU64::new(0),
            runtime_config: Arc::new(RwLock::new(runtime_config)),
            instruments: Arc::new(RwLock::new(std::collections::HashMap::new())),
            tick_bus,
            candle_engine,
            subscription_registry,
            market_feed_supervisor,
            fanout_server,
            snapshot_cache,
            journal,
            ledger,
            wallet_cache,
            position_book,
            execution_engine,
            liquidation_engine,
            recent_errors: RwLock::new(Vec::new()),
        }
    }

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::Relaxed)
    }

    pub fn record_error(&self, message: impl Into<String>, code: Option<String>) {
        let mut errors = self.recent_errors.write();
        errors.push(ErrorRecord {
            message: message.into(),
            code,
            at: chrono::Utc::now().to_rfc3339(),
        });
        if errors.len() > MAX_RECENT_ERRORS {
            let excess = errors.len() - MAX_RECENT_ERRORS;
            errors.drain(0..excess);
        }
    }

    pub fn build_snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            state_version: self.current_state_version(),
            trading_mode: self.runtime_config.read().trading_mode.to_string(),
            connected_fanout_clients: self.fanout_server.connected_count(),
            active_subscriptions: self.subscription_registry.active_count(),
            tick_bus: self.tick_bus.stats(),
            candle_engine: self.candle_engine.stats(),
            snapshot_cache: self.snapshot_cache.stats(),
            recent_errors: self.recent_errors.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_error_trims_to_max() {
        let errors = RwLock::new(Vec::new());
        for i in 0..(MAX_RECENT_ERRORS + 10) {
            let mut e = errors.write();
            e.push(ErrorRecord {
                message: format!("err-{i}"),
                code: None,
                at: "now".into(),
            });
            if e.len() > MAX_RECENT_ERRORS {
                let excess = e.len() - MAX_RECENT_ERRORS;
                e.drain(0..excess);
            }
        }
        assert_eq!(errors.read().len(), MAX_RECENT_ERRORS);
    }
}
