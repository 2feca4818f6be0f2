use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use merlin_engine::TurnCoordinator;
use merlin_store::{Database, MessageRepo, SessionRepo};

use crate::handlers;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Idle time before a `: ping` comment is written on a turn stream.
    pub heartbeat_interval: Duration,
    pub max_history_page: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8080,
            heartbeat_interval: Duration::from_secs(15),
            max_history_page: 200,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<TurnCoordinator>,
    pub sessions: Arc<SessionRepo>,
    pub messages: Arc<MessageRepo>,
    pub db: Database,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(coordinator: Arc<TurnCoordinator>, db: Database, config: ServerConfig) -> Self {
        Self {
            coordinator,
            sessions: Arc::new(SessionRepo::new(db.clone())),
            messages: Arc::new(MessageRepo::new(db.clone())),
            db,
            config: Arc::new(config),
        }
    }
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(handlers::health))
        .route("/v1/metrics", get(handlers::metrics))
        .route("/v1/chat/sessions/active", post(handlers::active_session))
        .route("/v1/chat/sessions/{session_id}", get(handlers::get_session))
        .route("/v1/chat/sessions/{session_id}/archive", post(handlers::archive_session))
        .route("/v1/chat/sessions/{session_id}/history", get(handlers::history))
        .route("/v1/chat/sessions/{session_id}/turn", post(handlers::turn))
        .route("/v1/chat/sessions/{session_id}/message", post(handlers::message))
        .route("/v1/chat/sessions/{session_id}/cancel", post(handlers::cancel))
        .with_state(state)
        .layer(axum::middleware::from_fn(handlers::propagate_trace))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve in the background. Port 0 picks a free port.
pub async fn start(
    config: ServerConfig,
    coordinator: Arc<TurnCoordinator>,
    db: Database,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::new(coordinator, db, config);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!(addr = %local_addr, "merlin server started");

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(signal.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "server stopped with error");
        }
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        shutdown,
        server,
    })
}

/// Handle returned by `start()`. Dropping it leaves the server running.
pub struct ServerHandle {
    pub port: u16,
    shutdown: CancellationToken,
    server: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and wait for open ones to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.server.await {
            tracing::warn!(error = %e, "server task ended abnormally");
        }
    }
}
