//! Enrollment API plus the operator task queue for human-performed steps.

use axum::extract::{Path, State};
use axum::Json;
use chrono::Utc;
use outreach_channels::OutreachTask;
use outreach_core::error::OutreachError;
use outreach_sequence::ingest::{InboundEvent, IngestOutcome};
use outreach_sequence::types::{Enrollment, EventKind};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::rest::{ApiError, AppState, ErrorResponse};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TaskCompletionResponse {
    pub task: OutreachTask,
    /// `None` when the enrollment had already finished.
    pub outcome: Option<IngestOutcome>,
}

/// GET /v1/enrollments/{id} — Enrollment state and history.
#[utoipa::path(
    get,
    path = "/v1/enrollments/{id}",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment", body = Enrollment),
        (status = 404, description = "Unknown enrollment", body = ErrorResponse),
    )
)]
pub async fn handle_get(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    Ok(Json(state.engine.get_enrollment(&id)?))
}

/// POST /v1/enrollments/{id}/pause — Hold a single enrollment.
#[utoipa::path(
    post,
    path = "/v1/enrollments/{id}/pause",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment paused, or pause recorded while a worker holds it", body = Enrollment),
        (status = 404, description = "Unknown enrollment", body = ErrorResponse),
        (status = 409, description = "Enrollment already finished", body = ErrorResponse),
    )
)]
pub async fn handle_pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    Ok(Json(state.engine.pause_enrollment(&id)?))
}

/// POST /v1/enrollments/{id}/resume — Resume a paused enrollment.
#[utoipa::path(
    post,
    path = "/v1/enrollments/{id}/resume",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Enrollment id")),
    responses(
        (status = 200, description = "Enrollment resumed", body = Enrollment),
        (status = 404, description = "Unknown enrollment", body = ErrorResponse),
        (status = 409, description = "Enrollment is not paused", body = ErrorResponse),
    )
)]
pub async fn handle_resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Enrollment>, ApiError> {
    Ok(Json(state.engine.resume_enrollment(&id)?))
}

/// GET /v1/tasks — Open operator tasks, oldest first.
#[utoipa::path(
    get,
    path = "/v1/tasks",
    tag = "Tasks",
    responses((status = 200, description = "Open tasks", body = Vec<OutreachTask>))
)]
pub async fn handle_open_tasks(State(state): State<AppState>) -> Json<Vec<OutreachTask>> {
    Json(state.tasks.open_tasks())
}

/// POST /v1/tasks/{id}/complete — Mark a task done and feed `task_completed`
/// back into the enrollment.
#[utoipa::path(
    post,
    path = "/v1/tasks/{id}/complete",
    tag = "Tasks",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task completed", body = TaskCompletionResponse),
        (status = 404, description = "Unknown task", body = ErrorResponse),
    )
)]
pub async fn handle_complete_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskCompletionResponse>, ApiError> {
    let now = Utc::now();
    let task = state
        .tasks
        .complete(&id, now)
        .ok_or_else(|| OutreachError::NotFound(format!("task {id}")))?;
    let outcome = state.engine.record_event(
        task.enrollment_id,
        InboundEvent {
            // One completion per task, however often it is reported.
            event_id: format!("task-{id}"),
            kind: EventKind::TaskCompleted,
            timestamp: task.completed_at.unwrap_or(now),
            metadata: serde_json::json!({
                "task_id": id,
                "step": task.step_number,
                "channel": task.kind.as_str(),
            }),
        },
    );
    let outcome = match outcome {
        Ok(outcome) => Some(outcome),
        Err(OutreachError::Terminal(_)) => None,
        Err(e) => return Err(e.into()),
    };
    Ok(Json(TaskCompletionResponse { task, outcome }))
}
