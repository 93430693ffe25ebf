// =============================================================================
// REST API Endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Health is public; everything else
// requires a valid signed bearer token via the `AuthBearer` extractor.
// CORS is permissive — tighten `allowed_origins` for a real deployment.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::api::auth::AuthBearer;
use crate::app_state::AppState;
use crate::errors::TradingError;
use crate::execution::OrderRequest;
use crate::types::TradingMode;

/// Maps a domain error to the HTTP status a caller should branch on — a
/// duplicate submission is a conflict, a bad instrument/quantity/partial
/// exit is a client error, a stale/illiquid market or a halted engine is a
/// server-side unavailability, not the caller's fault.
fn status_for(e: &TradingError) -> StatusCode {
    match e {
        TradingError::DuplicateOrder | TradingError::OrderNotCancellable(_) => StatusCode::CONFLICT,
        TradingError::InvalidLotSize(_)
        | TradingError::InvalidSymbol(_)
        | TradingError::UnknownInstrument(_)
        | TradingError::ExpiredInstrument
        | TradingError::PartialExitNotAllowed
        | TradingError::InsufficientFunds { .. } => StatusCode::BAD_REQUEST,
        TradingError::WalletNotFound(_) | TradingError::OrderNotFound(_) | TradingError::PositionNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        TradingError::StalePrice { .. } | TradingError::IlliquidContract | TradingError::TradingHalted(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        .route("/api/v1/positions/:account_id", get(positions))
        .route("/api/v1/wallet/:account_id", get(wallet))
        .route("/api/v1/orders", post(place_order))
        .route("/api/v1/orders/:account_id/:order_id", axum::routing::delete(cancel_order))
        .route("/api/v1/snapshot/:segment/:token", get(snapshot))
        .route("/api/v1/control/pause", post(control_pause))
        .route("/api/v1/control/resume", post(control_resume))
        .route("/api/v1/control/kill", post(control_kill))
        .layer(cors)
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: state.current_state_version(),
        server_time: chrono::Utc::now().timestamp_millis(),
    })
}

async fn full_state(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.build_snapshot())
}

async fn positions(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> impl IntoResponse {
    Json(state.position_book.open_positions(&account_id).await)
}

async fn wallet(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
) -> impl IntoResponse {
    match state.wallet_cache.get(&account_id).await {
        Ok(w) => Json(w).into_response(),
        Err(e) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": e.code() })),
        )
            .into_response(),
    }
}

async fn snapshot(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((segment, token)): Path<(String, String)>,
) -> impl IntoResponse {
    let Ok(segment) = segment.parse::<crate::types::Segment>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "INVALID_SYMBOL" })),
        )
            .into_response();
    };
    let key = crate::types::InstrumentKey::new(segment, token);
    match state.snapshot_cache.get(&[key]).await {
        Ok(snaps) => Json(snaps).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct PlaceOrderRequest {
    account_id: String,
    instrument: crate::types::Instrument,
    side: crate::types::Side,
    order_type: crate::types::OrderType,
    product_type: crate::types::ProductType,
    quantity: u32,
    limit_price: Option<rust_decimal::Decimal>,
    idempotency_key: String,
}

async fn place_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> impl IntoResponse {
    if state.runtime_config.read().trading_mode != TradingMode::Live {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": "TRADING_HALTED" })),
        )
            .into_response();
    }

    let outcome = state
        .execution_engine
        .place_order(OrderRequest {
            account_id: req.account_id,
            instrument: req.instrument,
            side: req.side,
            order_type: req.order_type,
            product_type: req.product_type,
            quantity: req.quantity,
            limit_price: req.limit_price,
            idempotency_key: req.idempotency_key,
        })
        .await;

    match outcome {
        Ok(outcome) => {
            state.increment_version();
            (StatusCode::CREATED, Json(outcome)).into_response()
        }
        Err(e) => {
            state.record_error(e.to_string(), Some(e.code().to_string()));
            (
                status_for(&e),
                Json(serde_json::json!({ "error": e.code(), "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn cancel_order(
    _auth: AuthBearer,
    State(state): State<Arc<AppState>>,
    Path((account_id, order_id)): Path<(String, uuid::Uuid)>,
) -> impl IntoResponse {
    match state.execution_engine.cancel_order(&account_id, order_id).await {
        Ok(()) => {
            state.increment_version();
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            state.record_error(e.to_string(), Some(e.code().to_string()));
            (
                status_for(&e),
                Json(serde_json::json!({ "error": e.code(), "message": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[derive(Serialize)]
struct ControlResponse {
    trading_mode: String,
}

async fn control_pause(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.runtime_config.write().trading_mode = TradingMode::Paused;
    state.increment_version();
    info!("trading paused via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Paused.to_string(),
    })
}

async fn control_resume(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.runtime_config.write().trading_mode = TradingMode::Live;
    state.increment_version();
    info!("trading resumed via API");
    Json(ControlResponse {
        trading_mode: TradingMode::Live.to_string(),
    })
}

async fn control_kill(_auth: AuthBearer, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.runtime_config.write().trading_mode = TradingMode::Killed;
    state.increment_version();
    warn!("trading killed via API — manual restart required");
    Json(ControlResponse {
        trading_mode: TradingMode::Killed.to_string(),
    })
}
