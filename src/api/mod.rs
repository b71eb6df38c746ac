//! HTTP binding of the registry.

use crate::error::RegistryError;
use crate::registry::Registry;
use axum::{
    extract::{DefaultBodyLimit, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    serve, Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};

mod faces;
mod users;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
}

/// Error response: `{"error": <kind>, "message": <text>}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_input", message)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        let status = match &err {
            RegistryError::InvalidInput(_)
            | RegistryError::NoFaceDetected
            | RegistryError::NameConflict(_) => StatusCode::BAD_REQUEST,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::ExtractionFailure(_) => StatusCode::BAD_GATEWAY,
            RegistryError::StoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.kind(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!("{} {}: {}", self.status, self.kind, self.message);
        }
        let body = json!({
            "error": self.kind,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state.registry.status();
    Json(json!({
        "message": "Facebank is running",
        "ready": status.ready,
        "total": status.total,
    }))
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.metrics().summary())
}

/// Builds the application router. `max_upload_bytes` caps every request body.
pub fn router(registry: Arc<Registry>, max_upload_bytes: usize) -> Router {
    let state = AppState { registry };

    Router::new()
        .route("/api/status", get(status))
        .route("/api/metrics", get(metrics))
        .route("/register/:identity", post(faces::register))
        .route("/recognize", post(faces::recognize))
        .route("/users", get(users::list))
        .route("/users/detail", get(users::detail))
        .route("/users/:identity", put(users::rename).delete(users::delete))
        .route("/users/:identity/photo", get(users::photo))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(
    registry: Arc<Registry>,
    addr: SocketAddr,
    max_upload_bytes: usize,
) -> anyhow::Result<()> {
    let app = router(registry, max_upload_bytes);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("API listening on {addr}");
    serve(listener, app).await?;
    Ok(())
}
