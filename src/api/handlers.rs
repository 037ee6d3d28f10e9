//! API request handlers
//!
//! Thin adapters over [`TradingEngine`](crate::trading::TradingEngine):
//! decode the request, call the engine, map the error to a status code.

use crate::config_manager::SettingsUpdate;
use crate::db::{HoldingStatus, ObjectSpec};
use crate::ledger::LedgerError;
use crate::trading::EngineError;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{error, info};

// ==========================================
// Response Helpers
// ==========================================

fn json_error(status: StatusCode, error: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "success": false,
            "error": error
        })),
    )
        .into_response()
}

pub fn bad_request(error: &str) -> Response {
    json_error(StatusCode::BAD_REQUEST, error)
}

/// Map an engine error to its HTTP status
pub fn engine_error(e: EngineError) -> Response {
    let status = match &e {
        EngineError::AlreadyRunning | EngineError::NotRunning => StatusCode::CONFLICT,
        EngineError::Config(_) => StatusCode::BAD_REQUEST,
        EngineError::Exchange(_) => StatusCode::BAD_GATEWAY,
        EngineError::Ledger(inner) => match inner {
            LedgerError::NotFound(_) => StatusCode::NOT_FOUND,
            LedgerError::InvalidState(_) | LedgerError::ObjectInUse(_) => StatusCode::CONFLICT,
            LedgerError::InvalidObject(_) => StatusCode::BAD_REQUEST,
            LedgerError::Exchange(_) => StatusCode::BAD_GATEWAY,
            LedgerError::Db(_) | LedgerError::DataIntegrity(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
    };
    if status.is_server_error() {
        error!("Request failed: {}", e);
    }
    json_error(status, &e.to_string())
}

fn ok<T: serde::Serialize>(data: T) -> Response {
    Json(serde_json::json!({
        "success": true,
        "data": data
    }))
    .into_response()
}

// ==========================================
// Request Types
// ==========================================

#[derive(Debug, Deserialize)]
pub struct HoldingsQuery {
    /// Open (default), Sold, Cancelled or all
    pub status: Option<String>,
}

// ==========================================
// Status & Health
// ==========================================

pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "lot_trader",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn get_engine_status(State(state): State<Arc<AppState>>) -> Response {
    ok(state.engine.status())
}

pub async fn start_engine(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.start().await {
        Ok(()) => {
            info!("Engine started via API");
            ok(state.engine.status())
        }
        Err(e) => engine_error(e),
    }
}

pub async fn stop_engine(State(state): State<Arc<AppState>>) -> Response {
    state.engine.stop().await;
    info!("Engine stopped via API");
    ok(state.engine.status())
}

pub async fn get_settings(State(state): State<Arc<AppState>>) -> Response {
    let config = state.engine.config();
    let has_credentials = config.credentials().is_ok();
    Json(serde_json::json!({
        "success": true,
        "data": config,
        "has_credentials": has_credentials
    }))
    .into_response()
}

pub async fn update_settings(
    State(state): State<Arc<AppState>>,
    Json(update): Json<SettingsUpdate>,
) -> Response {
    match state.engine.update_settings(update).await {
        Ok(config) => ok(config),
        Err(e) => engine_error(e),
    }
}

// ==========================================
// Purchase Objects
// ==========================================

pub async fn list_objects(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.list_objects().await {
        Ok(objects) => ok(objects),
        Err(e) => engine_error(e),
    }
}

pub async fn create_object(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<ObjectSpec>,
) -> Response {
    match state.engine.define_object(&spec).await {
        Ok(object) => (StatusCode::CREATED, ok(object)).into_response(),
        Err(e) => engine_error(e),
    }
}

pub async fn get_object(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.engine.get_object(id).await {
        Ok(object) => ok(object),
        Err(e) => engine_error(e),
    }
}

pub async fn update_object(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(spec): Json<ObjectSpec>,
) -> Response {
    match state.engine.update_object(id, &spec).await {
        Ok(object) => ok(object),
        Err(e) => engine_error(e),
    }
}

pub async fn delete_object(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.engine.delete_object(id).await {
        Ok(()) => ok(serde_json::json!({ "deleted": id })),
        Err(e) => engine_error(e),
    }
}

pub async fn buy_object(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.engine.buy_object(id).await {
        Ok(holding) => (StatusCode::CREATED, ok(holding)).into_response(),
        Err(e) => engine_error(e),
    }
}

// ==========================================
// Holdings
// ==========================================

pub async fn list_holdings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HoldingsQuery>,
) -> Response {
    let status = match query.status.as_deref() {
        None => Some(HoldingStatus::Open),
        Some(s) if s.eq_ignore_ascii_case("all") => None,
        Some(s) => match s.parse::<HoldingStatus>() {
            Ok(status) => Some(status),
            Err(e) => return bad_request(&e),
        },
    };

    match state.engine.list_holdings(status).await {
        Ok(holdings) => ok(holdings),
        Err(e) => engine_error(e),
    }
}

pub async fn get_operations(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.engine.operations_for(id).await {
        Ok(ops) => ok(ops),
        Err(e) => engine_error(e),
    }
}

pub async fn sale_preview(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.engine.sale_preview(id).await {
        Ok(preview) => ok(preview),
        Err(e) => engine_error(e),
    }
}

pub async fn sell_holding(State(state): State<Arc<AppState>>, Path(id): Path<i64>) -> Response {
    match state.engine.sell_holding(id).await {
        Ok(gain) => ok(serde_json::json!({ "holding_id": id, "gain": gain })),
        Err(e) => engine_error(e),
    }
}

pub async fn get_performance(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.performance().await {
        Ok(performance) => ok(performance),
        Err(e) => engine_error(e),
    }
}
