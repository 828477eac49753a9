//! OpenAPI specification and Swagger UI configuration.

use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Outreach Sequence Engine API",
        version = "0.1.0",
        description = "Multi-step outreach sequences: versioned definitions, per-prospect enrollments, condition-driven advancement and provider event webhooks.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Sequences", description = "Publish, inspect, pause and resume sequence definitions"),
        (name = "Enrollments", description = "Enroll prospects and manage individual enrollments"),
        (name = "Tasks", description = "Operator queue for LinkedIn, call and manual steps"),
        (name = "Webhooks", description = "Inbound provider events"),
        (name = "Operations", description = "Health, readiness, and liveness probes"),
    ),
    paths(
        // Sequences
        crate::sequence_rest::handle_publish,
        crate::sequence_rest::handle_list,
        crate::sequence_rest::handle_versions,
        crate::sequence_rest::handle_get_version,
        crate::sequence_rest::handle_pause,
        crate::sequence_rest::handle_resume,
        crate::sequence_rest::handle_stats,
        // Enrollments
        crate::sequence_rest::handle_enroll,
        crate::enrollment_rest::handle_get,
        crate::enrollment_rest::handle_pause,
        crate::enrollment_rest::handle_resume,
        // Tasks
        crate::enrollment_rest::handle_open_tasks,
        crate::enrollment_rest::handle_complete_task,
        // Webhooks
        crate::webhook_rest::handle_event,
        crate::webhook_rest::handle_sendgrid,
        // Operations
        crate::rest::health_check,
        crate::rest::readiness,
        crate::rest::liveness,
    ),
    components(schemas(
        // Definitions
        outreach_sequence::types::SequenceDraft,
        outreach_sequence::types::SequenceDefinition,
        outreach_sequence::types::SequenceVersionId,
        outreach_sequence::types::SequenceSettings,
        outreach_sequence::types::SendingSchedule,
        outreach_sequence::types::TimeRange,
        outreach_sequence::types::ClockTime,
        outreach_sequence::types::Step,
        outreach_sequence::types::StepKind,
        outreach_sequence::types::StepContent,
        outreach_sequence::types::Delay,
        outreach_sequence::types::Condition,
        outreach_sequence::types::ConditionTrigger,
        outreach_sequence::types::ConditionAction,
        outreach_sequence::registry::VersionSummary,
        // Enrollments
        outreach_sequence::types::Enrollment,
        outreach_sequence::types::EnrollmentStatus,
        outreach_sequence::types::EndReason,
        outreach_sequence::types::Contact,
        outreach_sequence::types::Event,
        outreach_sequence::types::EventKind,
        outreach_sequence::store::EnrollmentStats,
        outreach_sequence::ingest::IngestOutcome,
        outreach_channels::OutreachTask,
        outreach_channels::SendGridEvent,
        // API types
        crate::sequence_rest::PublishResponse,
        crate::sequence_rest::SequencePauseResponse,
        crate::sequence_rest::EnrollRequest,
        crate::enrollment_rest::TaskCompletionResponse,
        crate::webhook_rest::WebhookEventRequest,
        crate::webhook_rest::WebhookEventResponse,
        crate::webhook_rest::SendGridBatchResponse,
        crate::rest::ErrorResponse,
        crate::rest::HealthResponse,
    ))
)]
pub struct ApiDoc;
