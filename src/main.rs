// =============================================================================
// Paper Trading Engine — Main Entry Point
// =============================================================================
//
// Wires the Market-Data Pipeline (C1-C8) to the Financial Core (C9-C14)
// through the tick bus and starts the REST/WS surface. The engine boots in
// Paused mode regardless of the loaded config — an operator must explicitly
// resume trading via the control API.
// =============================================================================

mod api;
mod app_state;
mod db;
mod errors;
mod execution;
mod fanout;
mod journal;
mod ledger;
mod liquidation;
mod market_data;
mod positions;
mod runtime_config;
mod snapshot_cache;
mod symbol;
mod types;
mod wallet;

use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use rust_decimal_macros::dec;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::execution::ExecutionEngine;
use crate::fanout::FanoutServer;
use crate::journal::Journal;
use crate::ledger::Ledger;
use crate::liquidation::LiquidationEngine;
use crate::market_data::{
    CandleEngine, LastPriceSource, MarketFeedSupervisor, SimulatedBroker, SubscriptionRegistry,
    TickBus,
};
use crate::positions::PositionBook;
use crate::runtime_config::RuntimeConfig;
use crate::snapshot_cache::SnapshotCache;
use crate::types::{Instrument, ProductType, TradingMode};
use crate::wallet::WalletCache;

const CANDLE_HISTORY_DEPTH: usize = 500;
const DEFAULT_ACCOUNT_ID: &str = "demo";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("paper trading engine starting up");

    // ── 1. Configuration ─────────────────────────────────────────────────
    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "failed to load runtime config, falling back to environment/defaults");
        RuntimeConfig::from_env()
    });

    // SAFETY: always boot paused. Resumed explicitly via /api/v1/control/resume.
    config.trading_mode = TradingMode::Paused;

    info!(symbols = ?config.symbols, trading_mode = %config.trading_mode, "runtime config ready");

    // ── 2. Database ──────────────────────────────────────────────────────
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/paper_trade_engine".to_string());
    let pool = db::connect(&database_url).await?;

    // ── 3. Financial Core ────────────────────────────────────────────────
    let journal = Arc::new(Journal::new(pool.clone()));
    if let Err(e) = journal.recover().await {
        error!(error = %e, "journal recovery failed");
    }

    let ledger = Arc::new(Ledger::new(pool.clone()));
    let wallet_cache = Arc::new(WalletCache::new(pool.clone()));
    let position_book = Arc::new(PositionBook::new(pool.clone()));

    wallet_cache.get_or_create(&ledger, DEFAULT_ACCOUNT_ID).await?;

    // ── 4. Market-Data Pipeline ──────────────────────────────────────────
    let tick_bus = Arc::new(TickBus::new());
    let candle_engine = Arc::new(CandleEngine::new(CANDLE_HISTORY_DEPTH));
    let subscription_registry = Arc::new(SubscriptionRegistry::new());
    let broker: crate::market_data::SharedBroker = Arc::new(SimulatedBroker::new());

    let mut instruments = std::collections::HashMap::new();
    for raw in &config.symbols {
        match symbol::normalize(raw) {
            Ok(key) => {
                subscription_registry.subscribe(&key);
                let instrument = Instrument {
                    key: key.clone(),
                    trading_symbol: raw.clone(),
                    lot_size: 1,
                    tick_size: dec!(0.05),
                    product_type: ProductType::Cnc,
                    expiry_ms: None,
                };
                instruments.insert(key.canonical(), instrument);
            }
            Err(e) => warn!(symbol = %raw, error = %e, "skipping unrecognised symbol in config"),
        }
    }

    let market_feed_supervisor = Arc::new(MarketFeedSupervisor::new(
        broker,
        subscription_registry.clone(),
        tick_bus.clone(),
        config.min_safety_count,
    ));

    let last_price_source = Arc::new(LastPriceSource::new());
    last_price_source.attach_to_tick_bus(&tick_bus);

    let snapshot_cache = Arc::new(SnapshotCache::new(
        std::env::var("REDIS_URL").ok().as_deref(),
        last_price_source.clone(),
        config.snapshot_ttl_secs,
    ));

    let fanout_server = Arc::new(FanoutServer::new(
        subscription_registry.clone(),
        market_feed_supervisor.clone(),
        candle_engine.clone(),
        config.ws_max_symbols_per_client,
        config.ws_max_buffered_bytes,
        config.ws_max_message_size_bytes,
        config.ws_auth_required,
    ));
    fanout_server.attach_to_tick_bus(&tick_bus);

    // Feed every tick into the candle engine and fan out any candle it closes.
    {
        let candle_engine = candle_engine.clone();
        let fanout_server = fanout_server.clone();
        tick_bus.register_handler(Arc::new(move |tick| {
            for closed in candle_engine.ingest(&tick) {
                fanout_server.broadcast_candle(&closed);
            }
        }));
    }

    // ── 5. Execution & Liquidation ───────────────────────────────────────
    let execution_engine = Arc::new(ExecutionEngine::new(
        pool.clone(),
        Journal::new(pool.clone()),
        WalletCache::new(pool.clone()),
        PositionBook::new(pool.clone()),
        snapshot_cache.clone(),
    ));

    let liquidation_engine = Arc::new(LiquidationEngine::new(
        wallet_cache.clone(),
        position_book.clone(),
        snapshot_cache.clone(),
        execution_engine.clone(),
        config.liquidation_max_steps,
    ));

    // ── 6. Shared state ──────────────────────────────────────────────────
    let state = Arc::new(AppState::new(
        config.clone(),
        tick_bus,
        candle_engine,
        subscription_registry,
        market_feed_supervisor.clone(),
        fanout_server.clone(),
        snapshot_cache,
        journal,
        ledger,
        wallet_cache,
        position_book,
        execution_engine,
        liquidation_engine.clone(),
    ));
    *state.instruments.write() = instruments;

    // ── 7. Background tasks ──────────────────────────────────────────────
    tokio::spawn(market_feed_supervisor.run());
    tokio::spawn(execution_engine.clone().run_execution_loop());
    tokio::spawn(liquidation_engine.run(vec![DEFAULT_ACCOUNT_ID.to_string()]));

    // ── 8. HTTP/WS server ────────────────────────────────────────────────
    let rest_router = api::rest::router(state.clone());
    let ws_router = Router::new()
        .route("/api/v1/ws", get(crate::fanout::ws_handler))
        .with_state(state.fanout_server.clone());
    let app = rest_router.merge(ws_router);

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "API server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "API server failed");
        }
    });

    info!("all subsystems running, press ctrl+c to stop");

    // ── 9. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "failed to save runtime config on shutdown");
    }

    info!("paper trading engine shut down complete");
    Ok(())
}
