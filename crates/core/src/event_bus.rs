//! Engine event bus: trait for emitting analytics events from any module.
//!
//! Components accept an `Arc<dyn EventSink>` to push enrollment lifecycle
//! events into whatever analytics pipeline the deployment wires up.

use crate::types::{EngineEvent, EngineEventType};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Trait for emitting analytics events.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// No-op sink for tests and components that don't need event emission.
pub struct NoOpSink;

impl EventSink for NoOpSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// In-memory sink that captures events for testing.
#[derive(Default)]
pub struct CaptureSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().expect("event bus mutex poisoned").clone()
    }

    pub fn count(&self) -> usize {
        self.events.lock().expect("event bus mutex poisoned").len()
    }

    pub fn count_type(&self, event_type: EngineEventType) -> usize {
        self.events
            .lock()
            .expect("event bus mutex poisoned")
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("event bus mutex poisoned").clear();
    }
}

impl EventSink for CaptureSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().expect("event bus mutex poisoned").push(event);
    }
}

/// Convenience builder for an `EngineEvent` tied to one enrollment.
pub fn make_event(
    event_type: EngineEventType,
    enrollment_id: Uuid,
    prospect_id: Option<String>,
    step_number: Option<u32>,
) -> EngineEvent {
    EngineEvent {
        event_id: Uuid::new_v4(),
        event_type,
        enrollment_id,
        sequence_id: None,
        sequence_version: None,
        prospect_id,
        step_number,
        detail: None,
        node_id: "local".into(),
        timestamp: Utc::now(),
    }
}

impl EngineEvent {
    /// Attach the sequence version the enrollment is pinned to.
    pub fn with_sequence(mut self, sequence_id: Uuid, version: u32) -> Self {
        self.sequence_id = Some(sequence_id);
        self.sequence_version = Some(version);
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Convenience: create a no-op event bus for modules that don't need it.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoOpSink)
}

/// Convenience: create a capture sink for tests.
pub fn capture_sink() -> Arc<CaptureSink> {
    Arc::new(CaptureSink::new())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_sink() {
        let sink = capture_sink();
        assert_eq!(sink.count(), 0);

        let enrollment = Uuid::new_v4();
        let seq = Uuid::new_v4();
        sink.emit(make_event(
            EngineEventType::EnrollmentCreated,
            enrollment,
            Some("prospect-1".into()),
            None,
        ));
        sink.emit(
            make_event(EngineEventType::StepExecuted, enrollment, None, Some(1))
                .with_sequence(seq, 2)
                .with_detail("email"),
        );

        assert_eq!(sink.count(), 2);
        assert_eq!(sink.count_type(EngineEventType::EnrollmentCreated), 1);
        assert_eq!(sink.count_type(EngineEventType::StepExecuted), 1);

        let events = sink.events();
        assert_eq!(events[0].prospect_id.as_deref(), Some("prospect-1"));
        assert_eq!(events[1].sequence_id, Some(seq));
        assert_eq!(events[1].sequence_version, Some(2));
        assert_eq!(events[1].detail.as_deref(), Some("email"));

        sink.clear();
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_noop_sink() {
        let sink = noop_sink();
        // Should not panic
        sink.emit(make_event(
            EngineEventType::StepDeferred,
            Uuid::new_v4(),
            None,
            Some(3),
        ));
    }
}
