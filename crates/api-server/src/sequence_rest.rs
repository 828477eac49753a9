//! Sequence Admin API: publish, inspect, pause and resume sequences.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use outreach_core::error::OutreachError;
use outreach_sequence::registry::VersionSummary;
use outreach_sequence::store::EnrollmentStats;
use outreach_sequence::types::{
    Contact, Enrollment, SequenceDefinition, SequenceDraft, SequenceVersionId,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::rest::{ApiError, ApiJson, AppState, ErrorResponse};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct PublishResponse {
    pub sequence_id: Uuid,
    pub version: u32,
    pub digest: String,
    /// False when the draft matched the latest version and no new version was minted.
    pub created: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SequencePauseResponse {
    pub sequence_id: Uuid,
    pub paused: bool,
    pub versions_affected: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct EnrollRequest {
    pub prospect_id: String,
    #[serde(default)]
    pub contact: Contact,
}

/// POST /v1/sequences — Publish a new sequence or a new version of one.
#[utoipa::path(
    post,
    path = "/v1/sequences",
    tag = "Sequences",
    request_body = SequenceDraft,
    responses(
        (status = 201, description = "Version published", body = PublishResponse),
        (status = 200, description = "Identical to the latest version", body = PublishResponse),
        (status = 404, description = "Unknown sequence id", body = ErrorResponse),
        (status = 422, description = "Invalid definition", body = ErrorResponse),
    )
)]
pub async fn handle_publish(
    State(state): State<AppState>,
    ApiJson(draft): ApiJson<SequenceDraft>,
) -> Result<(StatusCode, Json<PublishResponse>), ApiError> {
    let outcome = state.engine.publish(draft)?;
    let definition = &outcome.definition;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    metrics::counter!("api.sequences_published").increment(1);
    Ok((
        status,
        Json(PublishResponse {
            sequence_id: definition.id,
            version: definition.version,
            digest: definition.digest.clone(),
            created: outcome.created,
        }),
    ))
}

/// GET /v1/sequences — Latest version of every sequence.
#[utoipa::path(
    get,
    path = "/v1/sequences",
    tag = "Sequences",
    responses((status = 200, description = "Latest definitions", body = Vec<SequenceDefinition>))
)]
pub async fn handle_list(State(state): State<AppState>) -> Json<Vec<SequenceDefinition>> {
    let mut sequences: Vec<SequenceDefinition> = state
        .engine
        .registry()
        .list()
        .iter()
        .map(|d| d.as_ref().clone())
        .collect();
    sequences.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
    Json(sequences)
}

/// GET /v1/sequences/{id}/versions — Version history of a sequence.
#[utoipa::path(
    get,
    path = "/v1/sequences/{id}/versions",
    tag = "Sequences",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses(
        (status = 200, description = "Versions, oldest first", body = Vec<VersionSummary>),
        (status = 404, description = "Unknown sequence", body = ErrorResponse),
    )
)]
pub async fn handle_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<VersionSummary>>, ApiError> {
    Ok(Json(state.engine.versions(&id)?))
}

/// GET /v1/sequences/{id}/versions/{version} — One immutable definition.
#[utoipa::path(
    get,
    path = "/v1/sequences/{id}/versions/{version}",
    tag = "Sequences",
    params(
        ("id" = Uuid, Path, description = "Sequence id"),
        ("version" = u32, Path, description = "Version number"),
    ),
    responses(
        (status = 200, description = "Definition", body = SequenceDefinition),
        (status = 404, description = "Unknown sequence version", body = ErrorResponse),
    )
)]
pub async fn handle_get_version(
    State(state): State<AppState>,
    Path((id, version)): Path<(Uuid, u32)>,
) -> Result<Json<SequenceDefinition>, ApiError> {
    let key = SequenceVersionId::new(id, version);
    let definition = state
        .engine
        .registry()
        .get(&key)
        .ok_or_else(|| OutreachError::NotFound(format!("sequence version {key}")))?;
    Ok(Json(definition.as_ref().clone()))
}

/// POST /v1/sequences/{id}/pause — Stop scheduling every enrollment of a sequence.
#[utoipa::path(
    post,
    path = "/v1/sequences/{id}/pause",
    tag = "Sequences",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses(
        (status = 200, description = "Sequence paused", body = SequencePauseResponse),
        (status = 404, description = "Unknown sequence", body = ErrorResponse),
    )
)]
pub async fn handle_pause(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SequencePauseResponse>, ApiError> {
    let versions_affected = state.engine.pause_sequence(&id)?;
    info!(sequence_id = %id, versions = versions_affected, "Sequence paused via API");
    Ok(Json(SequencePauseResponse {
        sequence_id: id,
        paused: true,
        versions_affected,
    }))
}

/// POST /v1/sequences/{id}/resume — Resume scheduling for a paused sequence.
#[utoipa::path(
    post,
    path = "/v1/sequences/{id}/resume",
    tag = "Sequences",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses(
        (status = 200, description = "Sequence resumed", body = SequencePauseResponse),
        (status = 404, description = "Unknown sequence", body = ErrorResponse),
    )
)]
pub async fn handle_resume(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SequencePauseResponse>, ApiError> {
    let versions_affected = state.engine.resume_sequence(&id)?;
    info!(sequence_id = %id, versions = versions_affected, "Sequence resumed via API");
    Ok(Json(SequencePauseResponse {
        sequence_id: id,
        paused: false,
        versions_affected,
    }))
}

/// GET /v1/sequences/{id}/stats — Enrollment counts across all versions.
#[utoipa::path(
    get,
    path = "/v1/sequences/{id}/stats",
    tag = "Sequences",
    params(("id" = Uuid, Path, description = "Sequence id")),
    responses(
        (status = 200, description = "Enrollment statistics", body = EnrollmentStats),
        (status = 404, description = "Unknown sequence", body = ErrorResponse),
    )
)]
pub async fn handle_stats(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<EnrollmentStats>, ApiError> {
    Ok(Json(state.engine.stats(&id)?))
}

/// POST /v1/sequences/{id}/enroll — Enroll a prospect into the latest version.
#[utoipa::path(
    post,
    path = "/v1/sequences/{id}/enroll",
    tag = "Enrollments",
    params(("id" = Uuid, Path, description = "Sequence id")),
    request_body = EnrollRequest,
    responses(
        (status = 201, description = "Prospect enrolled", body = Enrollment),
        (status = 404, description = "Unknown sequence", body = ErrorResponse),
        (status = 409, description = "Prospect already active in this sequence", body = ErrorResponse),
        (status = 422, description = "Invalid request", body = ErrorResponse),
    )
)]
pub async fn handle_enroll(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    ApiJson(request): ApiJson<EnrollRequest>,
) -> Result<(StatusCode, Json<Enrollment>), ApiError> {
    let enrollment = state
        .engine
        .enroll(&id, &request.prospect_id, request.contact)?;
    metrics::counter!("api.enrollments_created").increment(1);
    Ok((StatusCode::CREATED, Json(enrollment)))
}
