//! HTTP surface consumed by the web front end

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::TutorError;
use crate::handler::RequestHandler;

/// Shared state behind every route.
pub struct AppState {
    pub handler: RequestHandler,
    /// Device label reported by health checks, fixed at startup
    pub device: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub session_id: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status: &'static str,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model_loaded: bool,
    pub device: String,
}

#[derive(Debug, Deserialize)]
pub struct ClearRequest {
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

/// Build the service router. CORS is permissive so the static front end
/// can be served from anywhere.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/health", get(health))
        .route("/clear", post(clear))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(config: &ServerConfig, state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let reply = state
        .handler
        .handle_chat(&request.message, request.session_id.as_deref())
        .await?;

    Ok(Json(ChatResponse {
        response: reply.response,
        session_id: reply.session_id,
        status: "success",
    }))
}

/// Answers even while a generation holds the inference gate: nothing here
/// touches the gate or any session lock.
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let model_loaded = state.handler.model_loaded();
    Json(HealthResponse {
        status: if model_loaded { "healthy" } else { "degraded" },
        model_loaded,
        device: state.device.clone(),
    })
}

async fn clear(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ClearRequest>,
) -> Json<StatusResponse> {
    state.handler.handle_clear(&request.session_id).await;
    Json(StatusResponse { status: "success" })
}

/// Maps pipeline errors onto the documented JSON contract. Internal detail
/// never reaches the client.
struct ApiError(TutorError);

impl From<TutorError> for ApiError {
    fn from(error: TutorError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TutorError::Validation(_) => StatusCode::BAD_REQUEST,
            TutorError::ModelUnavailable(_) | TutorError::GenerationTimeout { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            TutorError::Generation(_) | TutorError::Configuration { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(ErrorResponse {
            error: self.0.client_message(),
            status: "error",
        });
        (status, body).into_response()
    }
}
