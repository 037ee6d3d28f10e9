//! API module - Axum HTTP server and routes
//!
//! Operator commands as JSON endpoints plus the `/ws` event stream.

mod handlers;
mod websocket;

use crate::AppState;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Create the main application router with all endpoints
pub fn create_router(state: Arc<AppState>) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ==========================================
        // Status & Health
        // ==========================================
        .route("/api/health", get(handlers::health_check))
        .route("/api/engine/status", get(handlers::get_engine_status))
        .route("/api/engine/start", post(handlers::start_engine))
        .route("/api/engine/stop", post(handlers::stop_engine))
        .route(
            "/api/engine/settings",
            get(handlers::get_settings).put(handlers::update_settings),
        )
        // ==========================================
        // Purchase Objects
        // ==========================================
        .route(
            "/api/objects",
            get(handlers::list_objects).post(handlers::create_object),
        )
        .route(
            "/api/objects/:id",
            get(handlers::get_object)
                .put(handlers::update_object)
                .delete(handlers::delete_object),
        )
        .route("/api/objects/:id/buy", post(handlers::buy_object))
        // ==========================================
        // Holdings
        // ==========================================
        .route("/api/holdings", get(handlers::list_holdings))
        .route("/api/holdings/:id/operations", get(handlers::get_operations))
        .route("/api/holdings/:id/sale-preview", get(handlers::sale_preview))
        .route("/api/holdings/:id/sell", post(handlers::sell_holding))
        .route("/api/performance", get(handlers::get_performance))
        // ==========================================
        // WebSocket for real-time updates
        // ==========================================
        .route("/ws", get(websocket::ws_handler))
        // Apply middleware
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_manager::{ConfigManager, TraderConfig};
    use crate::db::Database;
    use crate::event_bus::EventBus;
    use crate::exchange::PaperExchange;
    use crate::ledger::InventoryLedger;
    use crate::trading::TradingEngine;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn state(config: TraderConfig) -> Arc<AppState> {
        let ledger = Arc::new(InventoryLedger::new(Database::in_memory().await.unwrap()));
        let engine = TradingEngine::new(
            ledger,
            Arc::new(EventBus::new()),
            Arc::new(ConfigManager::new(config)),
        );
        Arc::new(AppState {
            engine: Arc::new(engine),
        })
    }

    async fn call(
        state: &Arc<AppState>,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let request = match body {
            Some(body) => request.body(Body::from(body.to_string())).unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = create_router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn object_body() -> Value {
        json!({
            "name": "Lote 0.001",
            "quantity": 0.001,
            "value": 300.0,
            "buy_price": 300000.0,
            "sell_price": 320000.0,
            "min_appreciation": 0.05,
            "validity_days": 7
        })
    }

    #[tokio::test]
    async fn test_health() {
        let state = state(TraderConfig::default()).await;
        let (status, body) = call(&state, "GET", "/api/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    #[tokio::test]
    async fn test_object_crud() {
        let state = state(TraderConfig::default()).await;

        let (status, body) = call(&state, "POST", "/api/objects", Some(object_body())).await;
        assert_eq!(status, StatusCode::CREATED);
        let id = body["data"]["id"].as_i64().unwrap();

        let (status, body) = call(&state, "GET", "/api/objects", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let mut edited = object_body();
        edited["min_appreciation"] = json!(0.08);
        let (status, body) =
            call(&state, "PUT", &format!("/api/objects/{}", id), Some(edited)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["min_appreciation"], 0.08);

        let (status, _) = call(&state, "DELETE", &format!("/api/objects/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&state, "GET", &format!("/api/objects/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_invalid_object_is_bad_request() {
        let state = state(TraderConfig::default()).await;
        let mut body = object_body();
        body["quantity"] = json!(0.0);
        let (status, body) = call(&state, "POST", "/api/objects", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("quantity"));
    }

    #[tokio::test]
    async fn test_start_without_credentials_is_rejected() {
        let state = state(TraderConfig::default()).await;
        let (status, body) = call(&state, "POST", "/api/engine/start", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("Missing credentials"));

        let (_, body) = call(&state, "GET", "/api/engine/status", None).await;
        assert_eq!(body["data"]["is_running"], false);
    }

    #[tokio::test]
    async fn test_buy_and_sell_flow() {
        let state = state(TraderConfig {
            api_key: "k".to_string(),
            api_secret: "s".to_string(),
            ..Default::default()
        })
        .await;

        let (_, body) = call(&state, "POST", "/api/objects", Some(object_body())).await;
        let object_id = body["data"]["id"].as_i64().unwrap();

        let (status, _) =
            call(&state, "POST", &format!("/api/objects/{}/buy", object_id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let exchange = Arc::new(PaperExchange::with_price(300_000.0));
        state.engine.start_with_exchange(exchange.clone()).await.unwrap();

        let (status, body) =
            call(&state, "POST", &format!("/api/objects/{}/buy", object_id), None).await;
        assert_eq!(status, StatusCode::CREATED);
        let holding_id = body["data"]["id"].as_i64().unwrap();

        let (_, body) = call(&state, "GET", "/api/holdings", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        // the template is frozen while the lot is open
        let (status, _) =
            call(&state, "PUT", &format!("/api/objects/{}", object_id), Some(object_body())).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) =
            call(&state, "GET", &format!("/api/holdings/{}/sale-preview", holding_id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["holding_id"], holding_id);

        let (status, _) =
            call(&state, "POST", &format!("/api/holdings/{}/sell", holding_id), None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            call(&state, "POST", &format!("/api/holdings/{}/sell", holding_id), None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (_, body) =
            call(&state, "GET", &format!("/api/holdings/{}/operations", holding_id), None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 2);

        let (_, body) = call(&state, "GET", "/api/holdings?status=Sold", None).await;
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (_, body) = call(&state, "GET", "/api/performance", None).await;
        assert_eq!(body["data"]["operations"], 2);
        assert_eq!(body["data"]["sells"], 1);

        let (status, _) = call(&state, "POST", "/api/engine/stop", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(exchange.sells(), 1);
    }

    #[tokio::test]
    async fn test_unknown_status_filter() {
        let state = state(TraderConfig::default()).await;
        let (status, _) = call(&state, "GET", "/api/holdings?status=Vendido", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&state, "GET", "/api/holdings/77/operations", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
