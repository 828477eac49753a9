use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Analytics event describing an enrollment lifecycle change. Emitted through
/// an [`EventSink`](crate::event_bus::EventSink), never read back by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_id: Uuid,
    pub event_type: EngineEventType,
    pub enrollment_id: Uuid,
    pub sequence_id: Option<Uuid>,
    pub sequence_version: Option<u32>,
    pub prospect_id: Option<String>,
    pub step_number: Option<u32>,
    pub detail: Option<String>,
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EngineEventType {
    // Enrollment lifecycle
    EnrollmentCreated,
    EnrollmentPaused,
    EnrollmentResumed,
    EnrollmentCompleted,
    EnrollmentEnded,
    EnrollmentFailed,
    // Scheduler
    StepExecuted,
    StepDeferred,
    StepSkipped,
    SendRetried,
    // Inbound provider signals
    InboundRecorded,
    // Definitions
    SequencePublished,
    SequenceArchived,
}

impl EngineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineEventType::EnrollmentCreated => "enrollment_created",
            EngineEventType::EnrollmentPaused => "enrollment_paused",
            EngineEventType::EnrollmentResumed => "enrollment_resumed",
            EngineEventType::EnrollmentCompleted => "enrollment_completed",
            EngineEventType::EnrollmentEnded => "enrollment_ended",
            EngineEventType::EnrollmentFailed => "enrollment_failed",
            EngineEventType::StepExecuted => "step_executed",
            EngineEventType::StepDeferred => "step_deferred",
            EngineEventType::StepSkipped => "step_skipped",
            EngineEventType::SendRetried => "send_retried",
            EngineEventType::InboundRecorded => "inbound_recorded",
            EngineEventType::SequencePublished => "sequence_published",
            EngineEventType::SequenceArchived => "sequence_archived",
        }
    }
}
