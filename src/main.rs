//! Lot Trader - HTTP/WebSocket server around the trading engine

use lot_trader::api::create_router;
use lot_trader::config_manager::{ConfigManager, TraderConfig};
use lot_trader::db::Database;
use lot_trader::event_bus::EventBus;
use lot_trader::ledger::InventoryLedger;
use lot_trader::trading::TradingEngine;
use lot_trader::AppState;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize logging
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Lot Trader v{}", env!("CARGO_PKG_VERSION"));

    // Get configuration from file + environment
    let config_path = std::env::var("TRADER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let mut config = TraderConfig::load(&config_path)?;
    config.apply_env()?;
    config.validate()?;

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://trader.db".to_string());
    let port: u16 = std::env::var("PORT")
        .unwrap_or_else(|_| "8000".to_string())
        .parse()
        .unwrap_or(8000);
    let autostart = matches!(
        std::env::var("TRADER_AUTOSTART").as_deref(),
        Ok("1") | Ok("true")
    );

    // Initialize database
    info!("Connecting to database...");
    let db = Database::connect(&database_url).await?;
    info!("Database connected");

    let ledger = Arc::new(InventoryLedger::new(db));
    let bus = Arc::new(EventBus::new());
    let engine = Arc::new(TradingEngine::new(ledger, bus, Arc::new(ConfigManager::new(config))));

    if autostart {
        if let Err(e) = engine.start().await {
            warn!("Engine not started: {}", e);
        }
    }

    // Create application state
    let state = Arc::new(AppState {
        engine: engine.clone(),
    });

    // Create router with all API endpoints
    let app = create_router(state);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting API server on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    engine.stop().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");
}
