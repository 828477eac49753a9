//! Event Webhook: provider signals into enrollment histories.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use outreach_channels::SendGridEvent;
use outreach_core::error::OutreachError;
use outreach_sequence::ingest::{InboundEvent, IngestOutcome};
use outreach_sequence::types::EventKind;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::rest::{ApiError, ApiJson, AppState, ErrorResponse};

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookEventRequest {
    pub enrollment_id: Uuid,
    pub event_kind: EventKind,
    /// When the provider observed the event. Defaults to receipt time.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Provider-unique id; redeliveries with the same id are ignored.
    pub event_id: String,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct WebhookEventResponse {
    pub enrollment_id: Uuid,
    pub outcome: IngestOutcome,
}

#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SendGridBatchResponse {
    pub recorded: usize,
    pub duplicates: usize,
    /// Delivery-pipeline events and events without an enrollment id.
    pub ignored: usize,
    /// Unknown or already finished enrollments.
    pub rejected: usize,
}

/// POST /v1/webhooks/events — Record one inbound event against an enrollment.
#[utoipa::path(
    post,
    path = "/v1/webhooks/events",
    tag = "Webhooks",
    request_body = WebhookEventRequest,
    responses(
        (status = 202, description = "Event recorded or recognised as a duplicate", body = WebhookEventResponse),
        (status = 404, description = "Unknown enrollment", body = ErrorResponse),
        (status = 409, description = "Enrollment already finished", body = ErrorResponse),
        (status = 422, description = "Unsupported event kind or missing event id", body = ErrorResponse),
    )
)]
pub async fn handle_event(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<WebhookEventRequest>,
) -> Result<(StatusCode, Json<WebhookEventResponse>), ApiError> {
    let outcome = state.engine.record_event(
        request.enrollment_id,
        InboundEvent {
            event_id: request.event_id,
            kind: request.event_kind,
            timestamp: request.timestamp.unwrap_or_else(Utc::now),
            metadata: request.metadata,
        },
    )?;
    metrics::counter!("api.webhook_events", "source" => "generic").increment(1);
    Ok((
        StatusCode::ACCEPTED,
        Json(WebhookEventResponse {
            enrollment_id: request.enrollment_id,
            outcome,
        }),
    ))
}

/// POST /v1/webhooks/sendgrid — SendGrid event webhook batch.
///
/// Always answers 200 for a well-formed batch so SendGrid does not redeliver
/// events the engine cannot use.
#[utoipa::path(
    post,
    path = "/v1/webhooks/sendgrid",
    tag = "Webhooks",
    request_body = Vec<SendGridEvent>,
    responses(
        (status = 200, description = "Batch processed", body = SendGridBatchResponse),
        (status = 400, description = "Malformed batch", body = ErrorResponse),
    )
)]
pub async fn handle_sendgrid(
    State(state): State<AppState>,
    ApiJson(events): ApiJson<Vec<SendGridEvent>>,
) -> Json<SendGridBatchResponse> {
    let mut response = SendGridBatchResponse::default();
    for event in &events {
        state.email.process_webhook(event);
        let Some((enrollment_id, inbound)) = event.to_inbound() else {
            debug!(event = %event.event, "SendGrid event not actionable");
            response.ignored += 1;
            continue;
        };
        match state.engine.record_event(enrollment_id, inbound) {
            Ok(IngestOutcome::Recorded) => response.recorded += 1,
            Ok(IngestOutcome::Duplicate) => response.duplicates += 1,
            Err(OutreachError::NotFound(_)) | Err(OutreachError::Terminal(_)) => {
                response.rejected += 1
            }
            Err(e) => {
                warn!(enrollment_id = %enrollment_id, error = %e, "SendGrid event rejected");
                response.rejected += 1;
            }
        }
    }
    metrics::counter!("api.webhook_events", "source" => "sendgrid").increment(events.len() as u64);
    Json(response)
}
