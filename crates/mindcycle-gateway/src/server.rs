//! Gateway server: WebSocket fan-out, health, percept ingress, mode control

use crate::ws::handle_connection;
use axum::{
    extract::{rejection::JsonRejection, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use mindcycle_core::{EventMessage, ModeRequest, PerceptInput};
use mindcycle_engine::config::GatewayConfig;
use mindcycle_engine::{EngineError, EngineHandle};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Shared state for every route.
pub struct GatewayState {
    pub engine: EngineHandle,
    /// Engine output, already wrapped as wire events. Each socket subscribes.
    pub events: broadcast::Sender<EventMessage>,
    pub started_at: Instant,
}

impl GatewayState {
    pub fn new(engine: EngineHandle, events: broadcast::Sender<EventMessage>) -> Self {
        Self { engine, events, started_at: Instant::now() }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("engine is not running")]
    Unavailable,

    #[error("{0}")]
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Closed => ApiError::Unavailable,
            other => ApiError::Engine(other),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        ApiError::BadRequest(e.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

pub fn router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/percepts", post(percept_handler))
        .route("/mode", post(mode_handler))
        .route("/dreams/refresh", post(refresh_handler))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn start_gateway(
    config: &GatewayConfig,
    state: Arc<GatewayState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let bind_addr: SocketAddr = format!("{}:{}", config.bind.to_addr(), config.port).parse()?;

    info!("Mindcycle Gateway v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", bind_addr);
    info!("  WebSocket: ws://{}/ws", bind_addr);
    info!("  Percepts:  http://{}/percepts", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Gateway stopped");
    Ok(())
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_handler(State(state): State<Arc<GatewayState>>) -> Result<impl IntoResponse, ApiError> {
    let status = state.engine.status().await?;
    Ok(Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": state.started_at.elapsed().as_secs(),
        "displayClients": state.events.receiver_count(),
        "engine": status,
    })))
}

async fn percept_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<PerceptInput>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(input) = body?;
    let percept = input
        .into_percept()
        .map_err(|e| ApiError::BadRequest(e.to_string()))?;
    debug!("Percept in: {:?} at {}", percept.modality, percept.timestamp);
    state.engine.push_percept(percept).await?;
    Ok(StatusCode::ACCEPTED)
}

async fn mode_handler(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<ModeRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) = body?;
    info!("Mode switch requested: {}", request.mode);
    state.engine.switch_mode(request.mode).await?;
    Ok(Json(state.engine.status().await?))
}

async fn refresh_handler(State(state): State<Arc<GatewayState>>) -> Result<impl IntoResponse, ApiError> {
    let eligible = state.engine.refresh_dreams().await?;
    Ok(Json(serde_json::json!({ "eligible": eligible })))
}
