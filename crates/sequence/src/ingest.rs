//! Event Ingest: append inbound provider signals to enrollment history.
//!
//! Recording never advances an enrollment; the scheduler picks up unevaluated
//! events on its next pass.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use outreach_core::event_bus::{make_event, noop_sink, EventSink};
use outreach_core::types::EngineEventType;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::IngestError;
use crate::store::{AppendOutcome, EnrollmentStore};
use crate::types::{Event, EventKind};

/// Provider notification as received from the outside world.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct InboundEvent {
    /// Caller-supplied id used for de-duplication.
    pub event_id: String,
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum IngestOutcome {
    Recorded,
    Duplicate,
}

pub struct EventIngest {
    store: Arc<dyn EnrollmentStore>,
    event_sink: Arc<dyn EventSink>,
}

impl EventIngest {
    pub fn new(store: Arc<dyn EnrollmentStore>) -> Self {
        Self {
            store,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn record(
        &self,
        enrollment_id: Uuid,
        inbound: InboundEvent,
    ) -> Result<IngestOutcome, IngestError> {
        if !inbound.kind.is_inbound() {
            return Err(IngestError::unsupported(inbound.kind));
        }
        if inbound.event_id.trim().is_empty() {
            return Err(IngestError::MissingEventId);
        }

        let kind = inbound.kind;
        let event = Event {
            event_id: inbound.event_id,
            kind,
            timestamp: inbound.timestamp,
            recorded_at: Utc::now(),
            step_number: None,
            metadata: inbound.metadata,
        };

        match self.store.append_event(&enrollment_id, event)? {
            AppendOutcome::Duplicate => {
                debug!(enrollment_id = %enrollment_id, kind = kind.as_str(), "Duplicate inbound event ignored");
                metrics::counter!("ingest.duplicates").increment(1);
                Ok(IngestOutcome::Duplicate)
            }
            AppendOutcome::Recorded(event) => {
                info!(
                    enrollment_id = %enrollment_id,
                    kind = kind.as_str(),
                    step = ?event.step_number,
                    "Recorded inbound event"
                );
                metrics::counter!("ingest.recorded", "kind" => kind.as_str()).increment(1);
                self.event_sink.emit(
                    make_event(
                        EngineEventType::InboundRecorded,
                        enrollment_id,
                        None,
                        event.step_number,
                    )
                    .with_detail(kind.as_str()),
                );
                Ok(IngestOutcome::Recorded)
            }
        }
    }
}
