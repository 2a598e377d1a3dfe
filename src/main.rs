use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{extract::State, response::Json, routing::get, Router};
use serde_json::{json, Value};
use tokio::{signal, sync::mpsc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use fulfillment_ledger as ledger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = ledger::config::load_config().context("failed to load configuration")?;
    ledger::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = ledger::db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to establish database connection")?;
    let db_arc = Arc::new(db_pool);

    // Init events
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = ledger::events::EventSender::new(event_tx);

    // Notification registry, owned here by the transport layer and handed
    // to the event processor as a capability.
    let registry = Arc::new(ledger::notifications::ChannelRegistry::new());
    tokio::spawn(ledger::events::process_events(event_rx, registry.clone()));

    // Build services
    let gateway: Arc<dyn ledger::services::payments::PaymentGateway> =
        Arc::new(ledger::services::payments::NoopPaymentGateway);
    let services =
        ledger::AppServices::build(db_arc.clone(), event_sender.clone(), gateway, &cfg);

    let state = ledger::AppState {
        db: db_arc,
        config: cfg.clone(),
        event_sender,
        services,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("Fulfillment ledger listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutdown complete");
    Ok(())
}

async fn health() -> Json<ledger::ApiResponse<Value>> {
    Json(ledger::ApiResponse::success(json!({ "status": "ok" })))
}

async fn ready(State(state): State<ledger::AppState>) -> Json<ledger::ApiResponse<Value>> {
    match ledger::db::ping(&state.db).await {
        Ok(()) => Json(ledger::ApiResponse::success(json!({ "status": "ready" }))),
        Err(e) => {
            error!(error = %e, "Readiness check failed");
            Json(ledger::ApiResponse::error("database unavailable"))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
