//! Enrollment Store: per-enrollee state under optimistic concurrency.
//!
//! Every status change bumps the enrollment's version; callers pass the
//! version they read and lose with `VersionConflict` when someone else got
//! there first. Event appends are merged under the record lock without a
//! version bump so that inbound events never invalidate a worker's claim.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::StoreError;
use crate::state_machine::EnrollmentStateMachine;
use crate::types::{
    Contact, EndReason, Enrollment, EnrollmentStatus, Event, EventKind, SequenceVersionId,
};

/// Request to create an enrollment.
#[derive(Debug, Clone)]
pub struct NewEnrollment {
    pub prospect_id: String,
    pub contact: Contact,
    pub sequence: SequenceVersionId,
    pub first_step: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

/// Result row of the due query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DueEnrollment {
    pub id: Uuid,
    pub version: u64,
    pub sequence: SequenceVersionId,
    pub next_eligible_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedStep {
    pub step_number: u32,
    pub at: DateTime<Utc>,
}

/// State a scheduler worker commits after processing a claimed enrollment.
#[derive(Debug, Clone)]
pub struct Advance {
    pub status: EnrollmentStatus,
    pub current_step: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub completed: Option<CompletedStep>,
    pub send_attempts: u32,
    pub end_reason: Option<EndReason>,
    pub failure_reason: Option<String>,
    /// Appended to history in order.
    pub events: Vec<Event>,
    /// History length observed at claim time. When set, the condition window
    /// restarts there, so events that arrived during the send stay in scope.
    pub condition_window: Option<usize>,
    pub evaluated_inbound: usize,
    pub now: DateTime<Utc>,
}

impl Advance {
    /// Commit that leaves the enrollment as it was claimed.
    pub fn unchanged(enrollment: &Enrollment, now: DateTime<Utc>) -> Self {
        Self {
            status: enrollment.status,
            current_step: enrollment.current_step,
            next_eligible_at: enrollment.next_eligible_at,
            completed: None,
            send_attempts: enrollment.send_attempts,
            end_reason: None,
            failure_reason: None,
            events: Vec::new(),
            condition_window: None,
            evaluated_inbound: enrollment.evaluated_inbound,
            now,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Recorded(Event),
    Duplicate,
}

/// Per-sequence enrollment counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct EnrollmentStats {
    pub enrolled: usize,
    pub active: usize,
    pub waiting: usize,
    pub paused: usize,
    pub completed: usize,
    pub ended: usize,
    pub failed: usize,
    pub replied: usize,
    pub bounced: usize,
    pub unsubscribed: usize,
}

pub trait EnrollmentStore: Send + Sync {
    /// Fails with `AlreadyActive` when the prospect holds a non-terminal
    /// enrollment in the same sequence family.
    fn enroll(&self, request: NewEnrollment) -> Result<Enrollment, StoreError>;

    fn get(&self, id: &Uuid) -> Option<Enrollment>;

    /// Schedulable, unleased enrollments that are eligible now or have
    /// inbound events the evaluator has not seen. Oldest first.
    fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<DueEnrollment>;

    /// Take an exclusive lease before executing side effects.
    fn claim(
        &self,
        id: &Uuid,
        expected_version: u64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Enrollment, StoreError>;

    /// Commit a worker's result and release its lease.
    fn advance(&self, id: &Uuid, expected_version: u64, update: Advance)
        -> Result<Enrollment, StoreError>;

    /// Idempotent on `event.event_id`.
    fn append_event(&self, id: &Uuid, event: Event) -> Result<AppendOutcome, StoreError>;

    fn pause(&self, id: &Uuid, now: DateTime<Utc>) -> Result<Enrollment, StoreError>;

    fn resume(&self, id: &Uuid, now: DateTime<Utc>) -> Result<Enrollment, StoreError>;

    fn list_by_sequence(&self, sequence_id: &Uuid) -> Vec<Enrollment>;

    /// Versions that still have non-terminal enrollments pinned to them.
    fn pinned_versions(&self) -> HashSet<SequenceVersionId>;

    fn stats(&self, sequence_id: &Uuid) -> EnrollmentStats {
        let mut stats = EnrollmentStats::default();
        for enrollment in self.list_by_sequence(sequence_id) {
            stats.enrolled += 1;
            match enrollment.status {
                EnrollmentStatus::Active => stats.active += 1,
                EnrollmentStatus::Waiting => stats.waiting += 1,
                EnrollmentStatus::Paused => stats.paused += 1,
                EnrollmentStatus::Completed => stats.completed += 1,
                EnrollmentStatus::EndedByCondition => stats.ended += 1,
                EnrollmentStatus::Failed => stats.failed += 1,
            }
            let seen = |kind: EventKind| enrollment.history.iter().any(|e| e.kind == kind);
            if seen(EventKind::Replied) {
                stats.replied += 1;
            }
            if seen(EventKind::Bounced) {
                stats.bounced += 1;
            }
            if seen(EventKind::Unsubscribed) {
                stats.unsubscribed += 1;
            }
        }
        stats
    }
}

struct Record {
    enrollment: Enrollment,
    seen_event_ids: HashSet<String>,
}

impl Record {
    fn new(enrollment: Enrollment) -> Self {
        let seen_event_ids = enrollment
            .history
            .iter()
            .map(|e| e.event_id.clone())
            .collect();
        Self {
            enrollment,
            seen_event_ids,
        }
    }
}

/// DashMap-backed store. Lock order is always active index, then records.
pub struct InMemoryEnrollmentStore {
    records: DashMap<Uuid, Record>,
    /// (prospect, sequence family) -> non-terminal enrollment.
    active: DashMap<(String, Uuid), Uuid>,
    state_machine: EnrollmentStateMachine,
}

impl InMemoryEnrollmentStore {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            active: DashMap::new(),
            state_machine: EnrollmentStateMachine::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All enrollments, terminal ones included.
    pub fn export(&self) -> Vec<Enrollment> {
        self.records.iter().map(|r| r.enrollment.clone()).collect()
    }

    /// Replace contents with a previously exported set. Leases do not survive.
    pub fn import(&self, enrollments: Vec<Enrollment>) {
        self.records.clear();
        self.active.clear();
        for mut enrollment in enrollments {
            enrollment.lease_until = None;
            if !enrollment.status.is_terminal() {
                self.active.insert(
                    (enrollment.prospect_id.clone(), enrollment.sequence.sequence_id),
                    enrollment.id,
                );
            }
            self.records.insert(enrollment.id, Record::new(enrollment));
        }
    }

    fn check_version(enrollment: &Enrollment, expected: u64) -> Result<(), StoreError> {
        if enrollment.version != expected {
            return Err(StoreError::VersionConflict {
                expected,
                actual: enrollment.version,
            });
        }
        Ok(())
    }
}

impl Default for InMemoryEnrollmentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EnrollmentStore for InMemoryEnrollmentStore {
    fn enroll(&self, request: NewEnrollment) -> Result<Enrollment, StoreError> {
        let slot = self
            .active
            .entry((request.prospect_id.clone(), request.sequence.sequence_id));
        if let Entry::Occupied(occupied) = &slot {
            let existing = *occupied.get();
            let live = self
                .records
                .get(&existing)
                .is_some_and(|r| !r.enrollment.status.is_terminal());
            if live {
                return Err(StoreError::AlreadyActive {
                    prospect_id: request.prospect_id,
                    existing,
                });
            }
        }

        let enrollment = Enrollment {
            id: Uuid::new_v4(),
            prospect_id: request.prospect_id,
            contact: request.contact,
            sequence: request.sequence,
            status: EnrollmentStatus::pending(request.next_eligible_at, request.now),
            current_step: request.first_step,
            next_eligible_at: request.next_eligible_at,
            last_completed_step: None,
            last_completed_at: None,
            send_attempts: 0,
            end_reason: None,
            failure_reason: None,
            enrolled_at: request.now,
            updated_at: request.now,
            version: 1,
            condition_window: 0,
            inbound_count: 0,
            evaluated_inbound: 0,
            lease_until: None,
            pause_requested: false,
            history: Vec::new(),
        };
        self.records
            .insert(enrollment.id, Record::new(enrollment.clone()));
        slot.insert(enrollment.id);
        Ok(enrollment)
    }

    fn get(&self, id: &Uuid) -> Option<Enrollment> {
        self.records.get(id).map(|r| r.enrollment.clone())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Vec<DueEnrollment> {
        let mut due: Vec<DueEnrollment> = self
            .records
            .iter()
            .filter_map(|record| {
                let e = &record.enrollment;
                let eligible = e.next_eligible_at <= now || e.has_unevaluated_events();
                (e.status.is_schedulable() && !e.is_leased(now) && eligible).then(|| {
                    DueEnrollment {
                        id: e.id,
                        version: e.version,
                        sequence: e.sequence,
                        next_eligible_at: e.next_eligible_at,
                    }
                })
            })
            .collect();
        due.sort_by_key(|d| d.next_eligible_at);
        due.truncate(limit);
        due
    }

    fn claim(
        &self,
        id: &Uuid,
        expected_version: u64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Enrollment, StoreError> {
        let mut record = self.records.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        let e = &mut record.enrollment;
        Self::check_version(e, expected_version)?;
        if e.status.is_terminal() {
            return Err(StoreError::Terminal(*id));
        }
        if !e.status.is_schedulable() {
            return Err(StoreError::InvalidTransition {
                from: e.status,
                to: EnrollmentStatus::Active,
            });
        }
        if e.is_leased(now) {
            return Err(StoreError::Leased(*id));
        }
        e.lease_until = Some(lease_until);
        e.version += 1;
        Ok(e.clone())
    }

    fn advance(
        &self,
        id: &Uuid,
        expected_version: u64,
        update: Advance,
    ) -> Result<Enrollment, StoreError> {
        let (committed, released_key) = {
            let mut guard = self.records.get_mut(id).ok_or(StoreError::NotFound(*id))?;
            let Record {
                enrollment: e,
                seen_event_ids,
            } = &mut *guard;
            Self::check_version(e, expected_version)?;
            if e.status.is_terminal() {
                return Err(StoreError::Terminal(*id));
            }

            let mut status = update.status;
            let apply_pause = e.pause_requested && !status.is_terminal();
            if apply_pause {
                status = EnrollmentStatus::Paused;
            }
            let Some(trigger) = self.state_machine.trigger(e.status, status) else {
                return Err(StoreError::InvalidTransition {
                    from: e.status,
                    to: status,
                });
            };
            if e.status != status {
                debug!(enrollment_id = %id, from = ?e.status, to = ?status, trigger, "Enrollment transition");
            }

            if let Some(start) = update.condition_window {
                e.condition_window = start.min(e.history.len());
            }
            for event in update.events {
                if event.kind.is_inbound() {
                    e.inbound_count += 1;
                }
                seen_event_ids.insert(event.event_id.clone());
                e.history.push(event);
            }
            if apply_pause {
                let paused = Event::engine(EventKind::Paused, e.last_completed_step, update.now);
                seen_event_ids.insert(paused.event_id.clone());
                e.history.push(paused);
            }

            e.status = status;
            e.pause_requested = false;
            e.current_step = update.current_step;
            e.next_eligible_at = update.next_eligible_at;
            if let Some(completed) = update.completed {
                e.last_completed_step = Some(completed.step_number);
                e.last_completed_at = Some(completed.at);
            }
            e.send_attempts = update.send_attempts;
            if update.end_reason.is_some() {
                e.end_reason = update.end_reason;
            }
            if update.failure_reason.is_some() {
                e.failure_reason = update.failure_reason;
            }
            e.evaluated_inbound = update.evaluated_inbound.min(e.inbound_count);
            e.lease_until = None;
            e.updated_at = update.now;
            e.version += 1;

            let released = status
                .is_terminal()
                .then(|| (e.prospect_id.clone(), e.sequence.sequence_id));
            (e.clone(), released)
        };

        if let Some(key) = released_key {
            self.active.remove_if(&key, |_, owner| owner == id);
        }
        Ok(committed)
    }

    fn append_event(&self, id: &Uuid, mut event: Event) -> Result<AppendOutcome, StoreError> {
        let mut guard = self.records.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        let Record {
            enrollment: e,
            seen_event_ids,
        } = &mut *guard;
        if e.status.is_terminal() {
            return Err(StoreError::Terminal(*id));
        }
        if !seen_event_ids.insert(event.event_id.clone()) {
            return Ok(AppendOutcome::Duplicate);
        }
        if event.step_number.is_none() {
            // A held enrollment is mid-step: the event answers that step.
            event.step_number = if e.lease_until.is_some() {
                Some(e.current_step)
            } else {
                e.last_completed_step
            };
        }
        if event.kind.is_inbound() {
            e.inbound_count += 1;
        }
        e.updated_at = event.recorded_at;
        e.history.push(event.clone());
        Ok(AppendOutcome::Recorded(event))
    }

    fn pause(&self, id: &Uuid, now: DateTime<Utc>) -> Result<Enrollment, StoreError> {
        let mut guard = self.records.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        let Record {
            enrollment: e,
            seen_event_ids,
        } = &mut *guard;
        if e.status.is_terminal() {
            return Err(StoreError::Terminal(*id));
        }
        if e.status == EnrollmentStatus::Paused {
            return Ok(e.clone());
        }
        if e.is_leased(now) {
            // Applied by the worker's commit.
            e.pause_requested = true;
            return Ok(e.clone());
        }
        if !self.state_machine.can_transition(e.status, EnrollmentStatus::Paused) {
            return Err(StoreError::InvalidTransition {
                from: e.status,
                to: EnrollmentStatus::Paused,
            });
        }
        let event = Event::engine(EventKind::Paused, e.last_completed_step, now);
        seen_event_ids.insert(event.event_id.clone());
        e.history.push(event);
        e.status = EnrollmentStatus::Paused;
        e.updated_at = now;
        e.version += 1;
        Ok(e.clone())
    }

    fn resume(&self, id: &Uuid, now: DateTime<Utc>) -> Result<Enrollment, StoreError> {
        let mut guard = self.records.get_mut(id).ok_or(StoreError::NotFound(*id))?;
        let Record {
            enrollment: e,
            seen_event_ids,
        } = &mut *guard;
        if e.status.is_terminal() {
            return Err(StoreError::Terminal(*id));
        }
        if e.status != EnrollmentStatus::Paused {
            e.pause_requested = false;
            return Ok(e.clone());
        }
        let resumed = EnrollmentStatus::pending(e.next_eligible_at, now);
        if !self.state_machine.can_transition(e.status, resumed) {
            return Err(StoreError::InvalidTransition {
                from: e.status,
                to: resumed,
            });
        }
        let event = Event::engine(EventKind::Resumed, e.last_completed_step, now);
        seen_event_ids.insert(event.event_id.clone());
        e.history.push(event);
        e.status = resumed;
        e.updated_at = now;
        e.version += 1;
        Ok(e.clone())
    }

    fn list_by_sequence(&self, sequence_id: &Uuid) -> Vec<Enrollment> {
        self.records
            .iter()
            .filter(|r| r.enrollment.sequence.sequence_id == *sequence_id)
            .map(|r| r.enrollment.clone())
            .collect()
    }

    fn pinned_versions(&self) -> HashSet<SequenceVersionId> {
        self.records
            .iter()
            .filter(|r| !r.enrollment.status.is_terminal())
            .map(|r| r.enrollment.sequence)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::sync::Arc;

    fn new_enrollment(prospect: &str, sequence: SequenceVersionId, now: DateTime<Utc>) -> NewEnrollment {
        NewEnrollment {
            prospect_id: prospect.to_string(),
            contact: Contact::email("p@example.com"),
            sequence,
            first_step: 1,
            next_eligible_at: now,
            now,
        }
    }

    fn inbound(id: &str, kind: EventKind, now: DateTime<Utc>) -> Event {
        Event {
            event_id: id.to_string(),
            kind,
            timestamp: now,
            recorded_at: now,
            step_number: None,
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_enroll_rejects_second_active_enrollment() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let first = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        assert_eq!(first.status, EnrollmentStatus::Active);

        // Another version of the same family counts too.
        let other_version = SequenceVersionId::new(seq.sequence_id, 2);
        let err = store
            .enroll(new_enrollment("p1", other_version, now))
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyActive { existing, .. } if existing == first.id));

        // Different prospect is fine.
        assert!(store.enroll(new_enrollment("p2", seq, now)).is_ok());
    }

    #[test]
    fn test_reenroll_after_terminal() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let first = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        let claimed = store
            .claim(&first.id, first.version, now, now + Duration::seconds(30))
            .unwrap();
        let mut done = Advance::unchanged(&claimed, now);
        done.status = EnrollmentStatus::Completed;
        store.advance(&first.id, claimed.version, done).unwrap();

        let second = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(store.get(&first.id).unwrap().status, EnrollmentStatus::Completed);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        let lease = now + Duration::seconds(30);

        assert!(store.claim(&e.id, e.version, now, lease).is_ok());
        let err = store.claim(&e.id, e.version, now, lease).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        // Leased enrollments drop out of the due query.
        assert!(store.due(now, 10).is_empty());
        // Once the lease expires it is due again.
        assert_eq!(store.due(lease + Duration::seconds(1), 10).len(), 1);
    }

    #[test]
    fn test_concurrent_claims_single_winner() {
        let store = Arc::new(InMemoryEnrollmentStore::new());
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    store
                        .claim(&e.id, e.version, now, now + Duration::seconds(30))
                        .is_ok()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_advance_requires_claimed_version() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        let claimed = store
            .claim(&e.id, e.version, now, now + Duration::seconds(30))
            .unwrap();

        let stale = store.advance(&e.id, e.version, Advance::unchanged(&claimed, now));
        assert!(matches!(stale, Err(StoreError::VersionConflict { .. })));

        let committed = store
            .advance(&e.id, claimed.version, Advance::unchanged(&claimed, now))
            .unwrap();
        assert_eq!(committed.version, claimed.version + 1);
        assert!(committed.lease_until.is_none());
    }

    #[test]
    fn test_append_event_is_idempotent() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();

        let first = store
            .append_event(&e.id, inbound("evt-1", EventKind::Opened, now))
            .unwrap();
        assert!(matches!(first, AppendOutcome::Recorded(_)));
        let again = store
            .append_event(&e.id, inbound("evt-1", EventKind::Opened, now))
            .unwrap();
        assert_eq!(again, AppendOutcome::Duplicate);

        let stored = store.get(&e.id).unwrap();
        assert_eq!(stored.history.len(), 1);
        assert_eq!(stored.inbound_count, 1);
        assert!(stored.has_unevaluated_events());
        // Appends do not invalidate a claim.
        assert_eq!(stored.version, e.version);
    }

    #[test]
    fn test_terminal_enrollment_rejects_events() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        let claimed = store
            .claim(&e.id, e.version, now, now + Duration::seconds(30))
            .unwrap();
        let mut failed = Advance::unchanged(&claimed, now);
        failed.status = EnrollmentStatus::Failed;
        store.advance(&e.id, claimed.version, failed).unwrap();

        let err = store
            .append_event(&e.id, inbound("late", EventKind::Opened, now))
            .unwrap_err();
        assert_eq!(err, StoreError::Terminal(e.id));
        assert!(matches!(store.pause(&e.id, now), Err(StoreError::Terminal(_))));
    }

    #[test]
    fn test_pause_and_resume() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();

        let paused = store.pause(&e.id, now).unwrap();
        assert_eq!(paused.status, EnrollmentStatus::Paused);
        assert!(store.due(now, 10).is_empty());
        // Pausing twice is a no-op.
        assert_eq!(store.pause(&e.id, now).unwrap().version, paused.version);

        let resumed = store.resume(&e.id, now).unwrap();
        assert_eq!(resumed.status, EnrollmentStatus::Active);
        assert_eq!(store.due(now, 10).len(), 1);
        let kinds: Vec<_> = resumed.history.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Paused, EventKind::Resumed]);
    }

    #[test]
    fn test_advance_rejects_transition_out_of_pause() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        let paused = store.pause(&e.id, now).unwrap();

        let mut done = Advance::unchanged(&paused, now);
        done.status = EnrollmentStatus::Completed;
        let err = store.advance(&e.id, paused.version, done).unwrap_err();
        assert_eq!(
            err,
            StoreError::InvalidTransition {
                from: EnrollmentStatus::Paused,
                to: EnrollmentStatus::Completed,
            }
        );
        assert_eq!(store.get(&e.id).unwrap().status, EnrollmentStatus::Paused);
    }

    #[test]
    fn test_pause_while_leased_applies_on_commit() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        let claimed = store
            .claim(&e.id, e.version, now, now + Duration::seconds(30))
            .unwrap();

        let pending = store.pause(&e.id, now).unwrap();
        assert!(pending.pause_requested);
        assert_eq!(pending.status, EnrollmentStatus::Active);

        let mut next = Advance::unchanged(&claimed, now);
        next.status = EnrollmentStatus::Waiting;
        next.current_step = 2;
        let committed = store.advance(&e.id, claimed.version, next).unwrap();
        assert_eq!(committed.status, EnrollmentStatus::Paused);
        assert_eq!(committed.current_step, 2);
        assert!(!committed.pause_requested);
    }

    #[test]
    fn test_due_includes_unevaluated_events() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let mut request = new_enrollment("p1", seq, now);
        request.next_eligible_at = now + Duration::days(3);
        let e = store.enroll(request).unwrap();
        assert_eq!(e.status, EnrollmentStatus::Waiting);
        assert!(store.due(now, 10).is_empty());

        store
            .append_event(&e.id, inbound("reply-1", EventKind::Replied, now))
            .unwrap();
        assert_eq!(store.due(now, 10).len(), 1);
    }

    #[test]
    fn test_event_during_claim_stays_in_condition_window() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        let claimed = store
            .claim(&e.id, e.version, now, now + Duration::seconds(30))
            .unwrap();

        // Bounce lands while the worker is still sending step 1.
        let AppendOutcome::Recorded(bounce) = store
            .append_event(&e.id, inbound("bounce-1", EventKind::Bounced, now))
            .unwrap()
        else {
            panic!("expected a recorded event");
        };
        assert_eq!(bounce.step_number, Some(1));

        let mut next = Advance::unchanged(&claimed, now);
        next.current_step = 2;
        next.status = EnrollmentStatus::Waiting;
        next.next_eligible_at = now + Duration::days(1);
        next.condition_window = Some(claimed.history.len());
        next.completed = Some(CompletedStep { step_number: 1, at: now });
        next.events.push(Event::engine(EventKind::Sent, Some(1), now));
        let committed = store.advance(&e.id, claimed.version, next).unwrap();

        let scoped: Vec<EventKind> = committed.history[committed.condition_window..]
            .iter()
            .map(|ev| ev.kind)
            .collect();
        assert_eq!(scoped, vec![EventKind::Bounced, EventKind::Sent]);

        // Once released, events answer the last executed step.
        let AppendOutcome::Recorded(open) = store
            .append_event(&e.id, inbound("open-1", EventKind::Opened, now))
            .unwrap()
        else {
            panic!("expected a recorded event");
        };
        assert_eq!(open.step_number, Some(1));
    }

    #[test]
    fn test_export_import_restores_index() {
        let store = InMemoryEnrollmentStore::new();
        let now = Utc::now();
        let seq = SequenceVersionId::new(Uuid::new_v4(), 1);
        let e = store.enroll(new_enrollment("p1", seq, now)).unwrap();
        store
            .append_event(&e.id, inbound("evt-1", EventKind::Opened, now))
            .unwrap();

        let restored = InMemoryEnrollmentStore::new();
        restored.import(store.export());
        assert_eq!(restored.len(), 1);
        assert!(matches!(
            restored.enroll(new_enrollment("p1", seq, now)),
            Err(StoreError::AlreadyActive { .. })
        ));
        assert_eq!(
            restored
                .append_event(&e.id, inbound("evt-1", EventKind::Opened, now))
                .unwrap(),
            AppendOutcome::Duplicate
        );
    }
}
