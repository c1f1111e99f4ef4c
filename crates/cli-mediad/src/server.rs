use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::json;

use mediad::{
    ChunkAssembler, JobRunner, ServiceConfig, ServiceError, Splitter, TaskRegistry,
};

use crate::handlers;
use crate::split_handlers;

/// Largest accepted chunk body; uploads beyond this are rejected up front
const MAX_CHUNK_BODY_BYTES: usize = 256 * 1024 * 1024;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServiceConfig>,
    pub registry: Arc<TaskRegistry>,
    pub assembler: Arc<ChunkAssembler>,
    pub runner: Arc<JobRunner>,
    pub splitter: Arc<Splitter>,
}

/// JSON error payload with the HTTP status the service error maps to
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        ApiError {
            status,
            message: msg.into(),
        }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match &err {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::InvalidInput(_) | ServiceError::MissingChunk { .. } => {
                StatusCode::BAD_REQUEST
            }
            ServiceError::Cancelled => StatusCode::CONFLICT,
            ServiceError::Io(_) | ServiceError::Engine(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16(),
        }));
        (self.status, body).into_response()
    }
}

/// Build the full route table over the shared state
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/upload/init", post(handlers::upload_init))
        .route(
            "/api/upload/chunk",
            post(handlers::upload_chunk).layer(DefaultBodyLimit::max(MAX_CHUNK_BODY_BYTES)),
        )
        .route("/api/upload/status/{uploadId}", get(handlers::upload_status))
        .route("/api/upload/cancel/{uploadId}", post(handlers::upload_cancel))
        .route("/api/convert/start", post(handlers::convert_start))
        .route("/api/convert/status/{taskId}", get(handlers::convert_status))
        .route("/api/convert/cancel/{taskId}", post(handlers::convert_cancel))
        .route("/api/convert/list", get(handlers::convert_list))
        .route(
            "/api/convert/download/{taskId}",
            get(handlers::convert_download),
        )
        .route("/api/progress/{id}", get(handlers::progress))
        .route("/api/split/start", post(split_handlers::split_start))
        .route(
            "/api/split/download/{taskId}/{segmentIndex}",
            get(split_handlers::split_download),
        )
        .route(
            "/api/split/cleanup/{taskId}",
            delete(split_handlers::split_cleanup),
        )
        .layer(axum::middleware::from_fn(cors))
        .with_state(state)
}

/// Permissive CORS for browser front ends; preflights short-circuit here
async fn cors(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Response {
    let preflight = req.method() == Method::OPTIONS;
    let mut response = if preflight {
        StatusCode::NO_CONTENT.into_response()
    } else {
        next.run(req).await
    };
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type"),
    );
    response
}
