use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use switchboard::bus::{EventBus, RedisBus};
use switchboard::config::SwitchboardConfig;
use switchboard::gateway::{ws, Gateway};
use switchboard::shutdown::ShutdownSignal;

#[tokio::main]
async fn main() {
    // 1. Initialize Logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Load Configuration
    let config = match SwitchboardConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    // 3. Connect the Event Bus
    let bus = match RedisBus::connect(&config.redis.url, config.bus.backoff()).await {
        Ok(bus) => bus,
        Err(e) => {
            error!(error = %e, "Failed to set up Redis bus");
            std::process::exit(1);
        }
    };
    let bus: Arc<dyn EventBus> = Arc::new(bus);

    // 4. Start the Gateway
    let gateway = Arc::new(
        Gateway::new(config.gateway.resolve_instance_id(), bus.clone())
            .with_topic_prefix(config.gateway.topic_prefix.clone())
            .with_default_room(config.gateway.default_room())
            .with_send_buffer(config.gateway.send_buffer),
    );
    let subscription = gateway.start();

    let shutdown = ShutdownSignal::new();
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .with_state(gateway.clone())
        .merge(ws::router(gateway.clone(), shutdown.clone()));

    // 5. Start Server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, error = %e, "Failed to bind listener");
            std::process::exit(1);
        }
    };

    info!(
        addr = %addr,
        instance_id = %gateway.instance_id(),
        "Switchboard gateway listening"
    );

    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    let server_shutdown = shutdown.clone();
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.recv().await })
        .await
    {
        error!(error = %e, "Server error");
    }

    // 6. Drain
    bus.close().await;
    if tokio::time::timeout(shutdown.timeout(), subscription)
        .await
        .is_err()
    {
        warn!("Bus subscription did not stop in time");
    }

    info!(
        sessions = gateway.session_count().await,
        "Switchboard gateway stopped"
    );
}

async fn health_check(
    State(gateway): State<Arc<Gateway>>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match gateway.bus().ping().await {
        Ok(()) => Ok(Json(json!({
            "status": "ok",
            "bus": "connected",
            "instance_id": gateway.instance_id(),
        }))),
        Err(e) => {
            error!(error = %e, "Bus ping failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "degraded",
                    "bus": e.to_string(),
                    "instance_id": gateway.instance_id(),
                })),
            ))
        }
    }
}

/// Get metrics endpoint - returns gateway counters as JSON
async fn get_metrics(State(gateway): State<Arc<Gateway>>) -> Json<Value> {
    let snapshot = gateway.metrics().snapshot();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "instance_id": gateway.instance_id(),
        "uptime_seconds": snapshot.uptime_seconds,
        "uptime": snapshot.uptime,
        "sessions": gateway.session_count().await,
        "topics": gateway.topics(),
        "connections": snapshot.connections,
        "events": snapshot.events,
        "status": "running"
    }))
}
