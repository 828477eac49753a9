//! Shared REST state, error mapping and operational endpoints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use outreach_channels::{SendGridSender, TaskQueueSender};
use outreach_core::config::AppConfig;
use outreach_core::error::OutreachError;
use outreach_sequence::SequenceEngine;
use serde::Serialize;
use tracing::{error, warn};
use utoipa::ToSchema;

use crate::idempotency::IdempotencyCache;

/// Shared application state for REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: SequenceEngine,
    pub email: Arc<SendGridSender>,
    pub tasks: Arc<TaskQueueSender>,
    pub idempotency: Arc<IdempotencyCache>,
    pub node_id: String,
    pub start_time: Instant,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(
        config: &AppConfig,
        engine: SequenceEngine,
        email: Arc<SendGridSender>,
        tasks: Arc<TaskQueueSender>,
    ) -> Self {
        Self {
            engine,
            email,
            tasks,
            idempotency: Arc::new(IdempotencyCache::from_config(&config.idempotency)),
            node_id: config.node_id.clone(),
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Flip the readiness probe, e.g. while draining on shutdown.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

/// Error returned by every handler; always rendered as a JSON `ErrorResponse`.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<OutreachError> for ApiError {
    fn from(err: OutreachError) -> Self {
        let status = match &err {
            OutreachError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OutreachError::Serialization(_) => StatusCode::BAD_REQUEST,
            OutreachError::NotFound(_) => StatusCode::NOT_FOUND,
            OutreachError::Conflict(_) | OutreachError::Terminal(_) => StatusCode::CONFLICT,
            OutreachError::Config(_)
            | OutreachError::Persistence(_)
            | OutreachError::Io(_)
            | OutreachError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = if status.is_server_error() {
            error!(error = %err, "Request failed");
            "Internal processing error".to_string()
        } else {
            err.to_string()
        };
        Self::new(status, err.code(), message)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), "invalid_body", rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_client_error() {
            warn!(status = self.status.as_u16(), code = self.code, message = %self.message, "Request rejected");
        }
        metrics::counter!("api.errors", "code" => self.code).increment(1);
        (
            self.status,
            Json(ErrorResponse {
                error: self.code.to_string(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

/// `Json` extractor whose rejections use the API's error body.
#[derive(FromRequest)]
#[from_request(via(axum::Json), rejection(ApiError))]
pub struct ApiJson<T>(pub T);

// ─── Operations ─────────────────────────────────────────────────────────────

#[derive(Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
    pub uptime_secs: u64,
    pub enrollments: usize,
    pub sequences: usize,
}

/// GET /health — Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    tag = "Operations",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        node_id: state.node_id.clone(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        enrollments: state.engine.store().len(),
        sequences: state.engine.registry().list().len(),
    })
}

/// GET /ready — Readiness probe.
#[utoipa::path(
    get,
    path = "/ready",
    tag = "Operations",
    responses(
        (status = 200, description = "Ready to accept traffic"),
        (status = 503, description = "Starting up or draining"),
    )
)]
pub async fn readiness(State(state): State<AppState>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// GET /live — Liveness probe.
#[utoipa::path(
    get,
    path = "/live",
    tag = "Operations",
    responses((status = 200, description = "Process is alive"))
)]
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}
