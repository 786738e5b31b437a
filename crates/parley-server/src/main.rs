mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_db::Database;
use parley_gateway::auth::JwtAuthenticator;
use parley_gateway::connection;
use parley_gateway::queue::CloseReason;
use parley_gateway::state::{self, GatewayState};

use crate::config::ServerConfig;

#[derive(Clone)]
struct ServerState {
    gateway: GatewayState,
    max_frame_bytes: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley_server=debug,parley_gateway=debug,parley_db=info,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    let gateway = state::build(
        db,
        Arc::new(JwtAuthenticator::new(&config.jwt_secret)),
        config.gateway(),
    );

    // Scheduled delivery runs until shutdown
    let shutdown = CancellationToken::new();
    let scheduler_task = gateway
        .scheduler
        .spawn(config.scheduler_interval, shutdown.clone());

    let state = ServerState {
        gateway: gateway.clone(),
        max_frame_bytes: config.max_frame_bytes,
    };

    let app = Router::new()
        .route("/gateway", get(ws_upgrade))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = config.addr()?;
    info!("Parley server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let gateway = gateway.clone();
            let shutdown = shutdown.clone();
            async move {
                shutdown_signal().await;
                shutdown.cancel();
                gateway.registry.close_all(CloseReason::GoingAway);
            }
        })
        .await?;

    // Let an in-progress tick finish its commits
    shutdown.cancel();
    scheduler_task.await?;
    info!("Parley server stopped");

    Ok(())
}

async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.max_frame_bytes)
        .on_upgrade(move |socket| connection::handle_connection(socket, state.gateway))
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    format!("ok ({} sessions)", state.gateway.registry.len())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
