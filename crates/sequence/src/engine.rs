use std::sync::Arc;

use chrono::{DateTime, Utc};
use outreach_core::error::{OutreachError, OutreachResult};
use outreach_core::event_bus::{make_event, noop_sink, EventSink};
use outreach_core::types::EngineEventType;
use tracing::info;
use uuid::Uuid;

use crate::calendar::step_eligible_at;
use crate::ingest::{EventIngest, InboundEvent, IngestOutcome};
use crate::persistence::EngineSnapshot;
use crate::rate_limit::DailyRateLimiter;
use crate::registry::{PublishOutcome, SequenceRegistry, VersionSummary};
use crate::scheduler::{SchedulerSettings, SequenceScheduler};
use crate::sender::ChannelSender;
use crate::store::{EnrollmentStats, EnrollmentStore, InMemoryEnrollmentStore, NewEnrollment};
use crate::types::{
    ClockTime, Condition, ConditionAction, ConditionTrigger, Contact, Enrollment, SendingSchedule,
    SequenceDraft, SequenceSettings, Step, StepKind, TimeRange,
};

/// Operator and caller facing entry point. Owns the registry, the enrollment
/// store and the daily budget; the scheduler is built on top of the same parts.
#[derive(Clone)]
pub struct SequenceEngine {
    registry: Arc<SequenceRegistry>,
    store: Arc<InMemoryEnrollmentStore>,
    limiter: Arc<DailyRateLimiter>,
    ingest: Arc<EventIngest>,
    event_sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for SequenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceEngine")
            .field("registry", &self.registry)
            .field("enrollments", &self.store.len())
            .finish()
    }
}

impl SequenceEngine {
    pub fn new() -> Self {
        Self::with_event_sink(noop_sink())
    }

    /// Engine whose components all report to `sink`.
    pub fn with_event_sink(sink: Arc<dyn EventSink>) -> Self {
        let registry = Arc::new(SequenceRegistry::new().with_event_sink(sink.clone()));
        let store = Arc::new(InMemoryEnrollmentStore::new());
        let ingest = Arc::new(EventIngest::new(store.clone()).with_event_sink(sink.clone()));
        Self {
            registry,
            store,
            limiter: Arc::new(DailyRateLimiter::new()),
            ingest,
            event_sink: sink,
        }
    }

    pub fn registry(&self) -> Arc<SequenceRegistry> {
        self.registry.clone()
    }

    pub fn store(&self) -> Arc<InMemoryEnrollmentStore> {
        self.store.clone()
    }

    pub fn limiter(&self) -> Arc<DailyRateLimiter> {
        self.limiter.clone()
    }

    /// Scheduler sharing this engine's state.
    pub fn scheduler(
        &self,
        sender: Arc<dyn ChannelSender>,
        settings: SchedulerSettings,
    ) -> SequenceScheduler {
        SequenceScheduler::new(
            self.registry.clone(),
            self.store.clone(),
            self.limiter.clone(),
            sender,
            settings,
        )
        .with_event_sink(self.event_sink.clone())
    }

    // ─── Sequence admin ─────────────────────────────────────────────────────

    pub fn publish(&self, draft: SequenceDraft) -> OutreachResult<PublishOutcome> {
        Ok(self.registry.publish(draft, Utc::now())?)
    }

    pub fn versions(&self, sequence_id: &Uuid) -> OutreachResult<Vec<VersionSummary>> {
        if !self.registry.contains(sequence_id) {
            return Err(OutreachError::NotFound(format!("sequence {sequence_id}")));
        }
        Ok(self.registry.versions(sequence_id))
    }

    pub fn pause_sequence(&self, sequence_id: &Uuid) -> OutreachResult<usize> {
        Ok(self.registry.pause_sequence(sequence_id)?)
    }

    pub fn resume_sequence(&self, sequence_id: &Uuid) -> OutreachResult<usize> {
        Ok(self.registry.resume_sequence(sequence_id)?)
    }

    pub fn stats(&self, sequence_id: &Uuid) -> OutreachResult<EnrollmentStats> {
        if !self.registry.contains(sequence_id) {
            return Err(OutreachError::NotFound(format!("sequence {sequence_id}")));
        }
        Ok(self.store.stats(sequence_id))
    }

    // ─── Enrollment ─────────────────────────────────────────────────────────

    /// Enroll a prospect into the latest version of a sequence.
    pub fn enroll(
        &self,
        sequence_id: &Uuid,
        prospect_id: &str,
        contact: Contact,
    ) -> OutreachResult<Enrollment> {
        self.enroll_at(sequence_id, prospect_id, contact, Utc::now())
    }

    pub fn enroll_at(
        &self,
        sequence_id: &Uuid,
        prospect_id: &str,
        contact: Contact,
        now: DateTime<Utc>,
    ) -> OutreachResult<Enrollment> {
        if prospect_id.trim().is_empty() {
            return Err(OutreachError::Validation("prospect_id must not be empty".into()));
        }
        let definition = self
            .registry
            .latest(sequence_id)
            .ok_or_else(|| OutreachError::NotFound(format!("sequence {sequence_id}")))?;
        let first = definition.first_active_step().ok_or_else(|| {
            OutreachError::Validation(format!("sequence {sequence_id} has no active steps"))
        })?;
        let next_eligible_at = step_eligible_at(&definition, first, &contact, now);

        let enrollment = self.store.enroll(NewEnrollment {
            prospect_id: prospect_id.to_string(),
            contact,
            sequence: definition.version_id(),
            first_step: first.step_number,
            next_eligible_at,
            now,
        })?;

        info!(
            enrollment_id = %enrollment.id,
            sequence = %enrollment.sequence,
            prospect_id = %enrollment.prospect_id,
            next_eligible_at = %enrollment.next_eligible_at,
            "Prospect enrolled"
        );
        metrics::counter!("enrollments.created").increment(1);
        self.event_sink.emit(
            make_event(
                EngineEventType::EnrollmentCreated,
                enrollment.id,
                Some(enrollment.prospect_id.clone()),
                Some(enrollment.current_step),
            )
            .with_sequence(enrollment.sequence.sequence_id, enrollment.sequence.version),
        );
        Ok(enrollment)
    }

    pub fn get_enrollment(&self, id: &Uuid) -> OutreachResult<Enrollment> {
        self.store
            .get(id)
            .ok_or_else(|| OutreachError::NotFound(format!("enrollment {id}")))
    }

    pub fn pause_enrollment(&self, id: &Uuid) -> OutreachResult<Enrollment> {
        let enrollment = self.store.pause(id, Utc::now())?;
        info!(enrollment_id = %id, deferred = enrollment.pause_requested, "Enrollment paused");
        self.emit_lifecycle(EngineEventType::EnrollmentPaused, &enrollment);
        Ok(enrollment)
    }

    pub fn resume_enrollment(&self, id: &Uuid) -> OutreachResult<Enrollment> {
        let enrollment = self.store.resume(id, Utc::now())?;
        info!(enrollment_id = %id, status = enrollment.status.as_str(), "Enrollment resumed");
        self.emit_lifecycle(EngineEventType::EnrollmentResumed, &enrollment);
        Ok(enrollment)
    }

    pub fn record_event(&self, enrollment_id: Uuid, event: InboundEvent) -> OutreachResult<IngestOutcome> {
        Ok(self.ingest.record(enrollment_id, event)?)
    }

    fn emit_lifecycle(&self, event_type: EngineEventType, enrollment: &Enrollment) {
        self.event_sink.emit(
            make_event(
                event_type,
                enrollment.id,
                Some(enrollment.prospect_id.clone()),
                Some(enrollment.current_step),
            )
            .with_sequence(enrollment.sequence.sequence_id, enrollment.sequence.version),
        );
    }

    // ─── Persistence ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            taken_at: Utc::now(),
            registry: self.registry.export(),
            enrollments: self.store.export(),
            budget: self.limiter.export(),
        }
    }

    pub fn restore(&self, snapshot: EngineSnapshot) {
        info!(
            taken_at = %snapshot.taken_at,
            versions = snapshot.registry.definitions.len(),
            enrollments = snapshot.enrollments.len(),
            "Restoring engine snapshot"
        );
        self.registry.import(snapshot.registry);
        self.store.import(snapshot.enrollments);
        self.limiter.import(snapshot.budget);
    }

    /// Publish a pair of stock sequences for local development.
    pub fn seed_demo_sequences(&self) -> OutreachResult<Vec<Uuid>> {
        let cold = SequenceDraft {
            sequence_id: None,
            name: "Cold outbound (3 touch)".into(),
            description: Some("Intro email, follow-up, then a call".into()),
            steps: vec![
                Step::new(1, StepKind::Email)
                    .with_content("Quick question", "Hi {{first_name}}, ...")
                    .with_condition(ConditionTrigger::Bounced, ConditionAction::EndSequence),
                Step::new(2, StepKind::Email)
                    .with_delay(3, 0)
                    .with_content("Re: Quick question", "Following up ...")
                    .with_condition(ConditionTrigger::MessageClicked, ConditionAction::SkipTo { step: 3 }),
                Step::new(3, StepKind::Call).with_delay(7, 0),
            ],
            settings: SequenceSettings::default(),
        };

        let mut social_step = Step::new(2, StepKind::Linkedin).with_delay(1, 0);
        social_step.respect_timezone = true;
        social_step.send_time = Some(ClockTime::hm(10, 0));
        social_step.conditions.push(Condition {
            trigger: ConditionTrigger::Connected,
            action: ConditionAction::SkipTo { step: 4 },
        });
        let social = SequenceDraft {
            sequence_id: None,
            name: "Social warm-up".into(),
            description: Some("Email, LinkedIn connect, wait, manual follow-up".into()),
            steps: vec![
                Step::new(1, StepKind::Email).with_content("Hello", "Nice to meet you"),
                social_step,
                Step::new(3, StepKind::Wait).with_delay(2, 0),
                Step::new(4, StepKind::ManualTask)
                    .with_content("Personal follow-up", "Check their recent posts"),
            ],
            settings: SequenceSettings {
                max_emails_per_day: 100,
                sending_schedule: SendingSchedule::weekdays(
                    TimeRange::new(ClockTime::hm(8, 0), ClockTime::hm(18, 0)),
                    "Europe/London",
                ),
                ..SequenceSettings::default()
            },
        };

        let mut ids = Vec::new();
        for draft in [cold, social] {
            ids.push(self.publish(draft)?.definition.id);
        }
        info!(count = ids.len(), "Seeded demo sequences");
        Ok(ids)
    }
}

impl Default for SequenceEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EnrollmentStatus;
    use outreach_core::event_bus::capture_sink;

    #[test]
    fn test_enroll_pins_latest_version() {
        let engine = SequenceEngine::new();
        let ids = engine.seed_demo_sequences().unwrap();
        let e = engine
            .enroll(&ids[0], "prospect-1", Contact::email("a@example.com"))
            .unwrap();
        assert_eq!(e.sequence.version, 1);
        assert_eq!(e.current_step, 1);

        let again = engine.enroll(&ids[0], "prospect-1", Contact::email("a@example.com"));
        assert!(matches!(again, Err(OutreachError::Conflict(_))));
    }

    #[test]
    fn test_republish_leaves_existing_enrollments_alone() {
        let engine = SequenceEngine::new();
        let ids = engine.seed_demo_sequences().unwrap();
        let before = engine
            .enroll(&ids[0], "prospect-1", Contact::email("a@example.com"))
            .unwrap();

        let v1 = engine.registry().latest(&ids[0]).unwrap();
        let mut draft = SequenceDraft {
            sequence_id: Some(ids[0]),
            name: v1.name.clone(),
            description: v1.description.clone(),
            steps: v1.steps.clone(),
            settings: v1.settings.clone(),
        };
        draft.steps.truncate(1);
        let v2 = engine.publish(draft).unwrap();
        assert_eq!(v2.definition.version, 2);

        let after = engine.get_enrollment(&before.id).unwrap();
        assert_eq!(after.sequence, before.sequence);
        assert_eq!(after.next_eligible_at, before.next_eligible_at);
        assert_eq!(after.current_step, before.current_step);
        assert_eq!(engine.versions(&ids[0]).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_sequence_and_enrollment() {
        let engine = SequenceEngine::new();
        let missing = Uuid::new_v4();
        assert!(matches!(
            engine.enroll(&missing, "p", Contact::default()),
            Err(OutreachError::NotFound(_))
        ));
        assert!(matches!(
            engine.get_enrollment(&missing),
            Err(OutreachError::NotFound(_))
        ));
        assert!(matches!(engine.stats(&missing), Err(OutreachError::NotFound(_))));
    }

    #[test]
    fn test_pause_resume_emit_events() {
        let sink = capture_sink();
        let engine = SequenceEngine::with_event_sink(sink.clone());
        let ids = engine.seed_demo_sequences().unwrap();
        let e = engine
            .enroll(&ids[1], "prospect-9", Contact::email("b@example.com"))
            .unwrap();

        assert_eq!(engine.pause_enrollment(&e.id).unwrap().status, EnrollmentStatus::Paused);
        assert_ne!(engine.resume_enrollment(&e.id).unwrap().status, EnrollmentStatus::Paused);
        assert_eq!(sink.count_type(EngineEventType::EnrollmentCreated), 1);
        assert_eq!(sink.count_type(EngineEventType::EnrollmentPaused), 1);
        assert_eq!(sink.count_type(EngineEventType::EnrollmentResumed), 1);
        assert_eq!(sink.count_type(EngineEventType::SequencePublished), 2);

        let stats = engine.stats(&ids[1]).unwrap();
        assert_eq!(stats.enrolled, 1);
    }
}
