//! Sequence Scheduler: scans due enrollments, gates them through the sending
//! window and daily budget, calls the Channel Sender and commits the verdict.
//!
//! A pass claims each enrollment (version bump plus lease) before any side
//! effect, so two workers scanning the same due set never both send for one
//! enrollee. Losing a claim or a commit is a normal outcome, not an error.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use outreach_core::config::AppConfig;
use outreach_core::event_bus::{make_event, noop_sink, EventSink};
use outreach_core::types::EngineEventType;
use rand::seq::SliceRandom;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::calendar::{
    local_day, next_local_midnight, schedule_timezone, step_eligible_at, step_timezone,
    SendingWindow,
};
use crate::error::StoreError;
use crate::evaluator::ConditionEvaluator;
use crate::rate_limit::DailyRateLimiter;
use crate::registry::SequenceRegistry;
use crate::sender::{send_with_timeout, ChannelSender, RetryPolicy, SendOutcome, SendRequest};
use crate::store::{Advance, CompletedStep, DueEnrollment, EnrollmentStore};
use crate::types::{
    EndReason, Enrollment, EnrollmentStatus, Event, EventKind, SequenceDefinition, Step, Verdict,
};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub node_id: String,
    pub batch_size: usize,
    pub lease: Duration,
    pub send_timeout: std::time::Duration,
    pub retry: RetryPolicy,
    pub retention_days: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for SchedulerSettings {
    fn from(config: &AppConfig) -> Self {
        let scheduler = &config.scheduler;
        let send_timeout = std::time::Duration::from_millis(scheduler.send_timeout_ms.max(1));
        // A lease must outlive the send it protects.
        let lease = Duration::seconds(scheduler.lease_secs.max(1) as i64)
            .max(Duration::from_std(send_timeout * 2).unwrap_or_else(|_| Duration::hours(1)));
        Self {
            node_id: config.node_id.clone(),
            batch_size: scheduler.batch_size.max(1),
            lease,
            send_timeout,
            retry: RetryPolicy::from(&scheduler.retry),
            retention_days: config.rate_limit.retention_days,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    WindowClosed,
    RateLimited,
    RetryBackoff,
}

impl DeferReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeferReason::WindowClosed => "window_closed",
            DeferReason::RateLimited => "rate_limited",
            DeferReason::RetryBackoff => "retry_backoff",
        }
    }
}

/// What happened to one enrollment during a pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// A step ran and another is scheduled.
    Executed { step: u32 },
    Completed { step: u32 },
    Ended(EndReason),
    Failed { reason: String },
    Deferred(DeferReason),
    /// New events were evaluated; the next step is not due yet.
    Reevaluated,
    /// Another worker advanced the enrollment first.
    Conflict,
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub scanned: usize,
    pub executed: usize,
    pub completed: usize,
    pub ended: usize,
    pub failed: usize,
    pub deferred: usize,
    pub retried: usize,
    pub reevaluated: usize,
    pub conflicts: usize,
    pub paused_skipped: usize,
    pub skipped: usize,
}

impl PassReport {
    fn record(&mut self, outcome: &PassOutcome) {
        match outcome {
            PassOutcome::Executed { .. } => self.executed += 1,
            PassOutcome::Completed { .. } => {
                self.executed += 1;
                self.completed += 1;
            }
            PassOutcome::Ended(_) => self.ended += 1,
            PassOutcome::Failed { .. } => self.failed += 1,
            PassOutcome::Deferred(DeferReason::RetryBackoff) => self.retried += 1,
            PassOutcome::Deferred(_) => self.deferred += 1,
            PassOutcome::Reevaluated => self.reevaluated += 1,
            PassOutcome::Conflict => self.conflicts += 1,
            PassOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.scanned == 0
    }
}

/// Pass instant advanced by the wall-clock time spent in the pass. Step
/// timing uses the pass instant; leases are taken against this clock so a
/// claim late in a long pass is not born expired.
#[derive(Debug, Clone, Copy)]
struct PassClock {
    start: DateTime<Utc>,
    started: Instant,
}

impl PassClock {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            start,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.start + Duration::from_std(self.started.elapsed()).unwrap_or_else(|_| Duration::zero())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub purged_counters: usize,
    pub archived_versions: usize,
}

pub struct SequenceScheduler {
    registry: Arc<SequenceRegistry>,
    store: Arc<dyn EnrollmentStore>,
    limiter: Arc<DailyRateLimiter>,
    sender: Arc<dyn ChannelSender>,
    evaluator: ConditionEvaluator,
    settings: SchedulerSettings,
    event_sink: Arc<dyn EventSink>,
}

impl SequenceScheduler {
    pub fn new(
        registry: Arc<SequenceRegistry>,
        store: Arc<dyn EnrollmentStore>,
        limiter: Arc<DailyRateLimiter>,
        sender: Arc<dyn ChannelSender>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            registry,
            store,
            limiter,
            sender,
            evaluator: ConditionEvaluator::new(),
            settings,
            event_sink: noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// One scan over the due set as of `now`.
    pub async fn run_pass(&self, now: DateTime<Utc>) -> PassReport {
        let mut due = self.store.due(now, self.settings.batch_size);
        // Concurrent workers start from different points of the same due set.
        due.shuffle(&mut rand::thread_rng());

        let clock = PassClock::new(now);
        let mut report = PassReport {
            scanned: due.len(),
            ..PassReport::default()
        };
        for item in due {
            if self.registry.is_paused(&item.sequence) {
                report.paused_skipped += 1;
                continue;
            }
            let outcome = self.process(item, now, clock).await;
            report.record(&outcome);
        }

        if !report.is_idle() {
            debug!(
                scanned = report.scanned,
                executed = report.executed,
                deferred = report.deferred,
                conflicts = report.conflicts,
                "Scheduler pass finished"
            );
        }
        report
    }

    /// Purge old budget counters and archive idle superseded versions.
    pub fn run_maintenance(&self, now: DateTime<Utc>) -> MaintenanceReport {
        let cutoff: NaiveDate =
            now.date_naive() - Duration::days(i64::from(self.settings.retention_days));
        let purged_counters = self.limiter.purge_before(cutoff);
        let archived = self.registry.archive_unpinned(&self.store.pinned_versions());
        let report = MaintenanceReport {
            purged_counters,
            archived_versions: archived.len(),
        };
        if report.purged_counters > 0 || report.archived_versions > 0 {
            info!(
                purged = report.purged_counters,
                archived = report.archived_versions,
                "Scheduler maintenance finished"
            );
        }
        report
    }

    async fn process(&self, due: DueEnrollment, now: DateTime<Utc>, clock: PassClock) -> PassOutcome {
        let claimed_at = clock.now();
        let lease_until = claimed_at + self.settings.lease;
        let claimed = match self.store.claim(&due.id, due.version, claimed_at, lease_until) {
            Ok(enrollment) => enrollment,
            Err(StoreError::VersionConflict { .. }) | Err(StoreError::Leased(_)) => {
                metrics::counter!("scheduler.version_conflicts").increment(1);
                debug!(enrollment_id = %due.id, "Lost claim to another worker");
                return PassOutcome::Conflict;
            }
            Err(err) => {
                debug!(enrollment_id = %due.id, error = %err, "Claim rejected");
                return PassOutcome::Skipped;
            }
        };

        let mut plan = Advance::unchanged(&claimed, now);
        let Some(definition) = self.registry.get(&claimed.sequence) else {
            let reason = format!("sequence version {} not found", claimed.sequence);
            return self.fail(&claimed, plan, reason);
        };

        if claimed.has_unevaluated_events() {
            plan.evaluated_inbound = claimed.inbound_count;
            let last_step = claimed
                .last_completed_step
                .and_then(|n| definition.step(n));
            let verdict = self.evaluator.evaluate(
                &definition.settings,
                last_step,
                &claimed.history,
                claimed.condition_window,
            );
            match verdict {
                Verdict::End(reason) => return self.end(&claimed, plan, reason),
                Verdict::SkipTo(target) => {
                    if let Some(completed_at) = claimed.last_completed_at {
                        match definition.active_step_from(target) {
                            None => {
                                let step = claimed.last_completed_step.unwrap_or(plan.current_step);
                                return self.complete(&claimed, plan, step);
                            }
                            Some(next) if next.step_number < plan.current_step => {
                                debug!(
                                    enrollment_id = %claimed.id,
                                    current = plan.current_step,
                                    target = next.step_number,
                                    "Backward jump ignored"
                                );
                            }
                            Some(next) if next.step_number > plan.current_step => {
                                debug!(
                                    enrollment_id = %claimed.id,
                                    from = plan.current_step,
                                    to = next.step_number,
                                    "Condition jump"
                                );
                                self.emit(
                                    EngineEventType::StepSkipped,
                                    &claimed,
                                    Some(plan.current_step),
                                    Some(format!("jump to step {}", next.step_number)),
                                );
                                plan.current_step = next.step_number;
                                plan.send_attempts = 0;
                                plan.next_eligible_at = step_eligible_at(
                                    &definition,
                                    next,
                                    &claimed.contact,
                                    completed_at,
                                );
                            }
                            Some(_) => {}
                        }
                    }
                }
                Verdict::Continue => {}
            }
            if plan.next_eligible_at > now {
                plan.status = EnrollmentStatus::Waiting;
                return self.commit(&claimed, plan, PassOutcome::Reevaluated);
            }
        }

        let step = definition
            .step(plan.current_step)
            .filter(|s| s.active)
            .or_else(|| definition.active_step_from(plan.current_step));
        match step {
            Some(step) => {
                let lease = Lease {
                    until: lease_until,
                    clock,
                };
                self.execute(&claimed, &definition, step, plan, now, lease).await
            }
            None => {
                let step = claimed.last_completed_step.unwrap_or(plan.current_step);
                self.complete(&claimed, plan, step)
            }
        }
    }

    async fn execute(
        &self,
        claimed: &Enrollment,
        definition: &SequenceDefinition,
        step: &Step,
        mut plan: Advance,
        now: DateTime<Utc>,
        lease: Lease,
    ) -> PassOutcome {
        plan.current_step = step.step_number;

        if step.kind.is_window_gated() {
            let tz = step_timezone(definition, step, &claimed.contact);
            let window = SendingWindow::new(&definition.settings.sending_schedule, tz)
                .skipping_weekends(step.skip_weekends);
            if !window.contains(now) {
                let reopen = window
                    .next_start(now)
                    .unwrap_or_else(|| now + Duration::days(1));
                return self.defer(claimed, plan, reopen, DeferReason::WindowClosed);
            }
        }

        let reservation = if step.kind.consumes_budget() {
            let tz = schedule_timezone(definition);
            let day = local_day(tz, now);
            let cap = definition.settings.max_emails_per_day;
            if !self.limiter.try_reserve(definition.id, day, cap) {
                let next_day = next_local_midnight(tz, now);
                return self.defer(claimed, plan, next_day, DeferReason::RateLimited);
            }
            Some(day)
        } else {
            None
        };

        let completion = if step.kind.invokes_sender() {
            if !lease.covers(self.settings.send_timeout) {
                // Another worker may claim it before the send returns.
                self.release(definition, reservation);
                metrics::counter!("scheduler.lease_exhausted").increment(1);
                warn!(
                    enrollment_id = %claimed.id,
                    step = step.step_number,
                    "Lease too short for a send, leaving for the next pass"
                );
                return self.commit(claimed, plan, PassOutcome::Skipped);
            }
            let attempt = claimed.send_attempts + 1;
            let request = SendRequest {
                enrollment_id: claimed.id,
                prospect_id: claimed.prospect_id.clone(),
                sequence: claimed.sequence,
                step_number: step.step_number,
                kind: step.kind,
                contact: claimed.contact.clone(),
                content: step.content.clone(),
                attempt,
                track_opens: definition.settings.track_opens,
                track_clicks: definition.settings.track_clicks,
            };
            let started = Instant::now();
            let outcome =
                send_with_timeout(self.sender.as_ref(), &request, self.settings.send_timeout).await;
            metrics::histogram!("scheduler.send_latency_ms")
                .record(started.elapsed().as_secs_f64() * 1000.0);
            metrics::counter!(
                "scheduler.sends",
                "kind" => step.kind.as_str(),
                "outcome" => outcome.label()
            )
            .increment(1);

            match outcome {
                SendOutcome::Delivered {
                    provider_message_id,
                } => Event::engine(EventKind::Sent, Some(step.step_number), now).with_metadata(
                    serde_json::json!({
                        "channel": step.kind.as_str(),
                        "provider_message_id": provider_message_id,
                        "attempt": attempt,
                    }),
                ),
                SendOutcome::TransientFailure { reason } => {
                    self.release(definition, reservation);
                    plan.events.push(send_failed(step, now, &reason, attempt, true));
                    if self.settings.retry.exhausted(attempt) {
                        let reason = format!("gave up after {attempt} attempts: {reason}");
                        return self.fail(claimed, plan, reason);
                    }
                    warn!(
                        enrollment_id = %claimed.id,
                        step = step.step_number,
                        attempt,
                        reason = %reason,
                        "Transient send failure, retrying"
                    );
                    plan.send_attempts = attempt;
                    let backoff = Duration::from_std(self.settings.retry.backoff(attempt))
                        .unwrap_or_else(|_| Duration::hours(1));
                    return self.defer(claimed, plan, now + backoff, DeferReason::RetryBackoff);
                }
                SendOutcome::PermanentFailure { reason } => {
                    self.release(definition, reservation);
                    plan.events.push(send_failed(step, now, &reason, attempt, false));
                    return self.fail(claimed, plan, reason);
                }
            }
        } else {
            Event::engine(EventKind::WaitElapsed, Some(step.step_number), now)
        };

        // Inbound events may have landed while the sender was busy.
        let (mut history, inbound_seen) = match self.store.get(&claimed.id) {
            Some(current) => (current.history, current.inbound_count),
            None => (claimed.history.clone(), claimed.inbound_count),
        };
        // A wait keeps the condition scope of the step before it.
        let opens_window = step.kind.invokes_sender();
        let window_start = if opens_window {
            claimed.history.len()
        } else {
            claimed.condition_window
        };
        history.push(completion.clone());
        plan.events.push(completion);
        plan.condition_window = opens_window.then_some(claimed.history.len());
        plan.evaluated_inbound = inbound_seen;
        plan.send_attempts = 0;
        plan.completed = Some(CompletedStep {
            step_number: step.step_number,
            at: now,
        });

        metrics::counter!("scheduler.steps_executed", "kind" => step.kind.as_str()).increment(1);
        self.emit(
            EngineEventType::StepExecuted,
            claimed,
            Some(step.step_number),
            Some(step.kind.as_str().to_string()),
        );

        let verdict =
            self.evaluator
                .evaluate(&definition.settings, Some(step), &history, window_start);
        let next = match verdict {
            Verdict::End(reason) => return self.end(claimed, plan, reason),
            Verdict::Continue => definition.active_step_after(step.step_number),
            Verdict::SkipTo(target) => {
                let jumped = definition.active_step_from(target);
                let natural = definition.active_step_after(step.step_number);
                if let Some(to) = jumped {
                    if natural.map(|n| n.step_number) != Some(to.step_number) {
                        self.emit(
                            EngineEventType::StepSkipped,
                            claimed,
                            Some(step.step_number),
                            Some(format!("jump to step {}", to.step_number)),
                        );
                    }
                }
                jumped
            }
        };

        match next {
            None => self.complete(claimed, plan, step.step_number),
            Some(next) => {
                plan.current_step = next.step_number;
                plan.next_eligible_at = step_eligible_at(definition, next, &claimed.contact, now);
                plan.status = EnrollmentStatus::pending(plan.next_eligible_at, now);
                self.commit(
                    claimed,
                    plan,
                    PassOutcome::Executed {
                        step: step.step_number,
                    },
                )
            }
        }
    }

    fn release(&self, definition: &SequenceDefinition, reservation: Option<NaiveDate>) {
        if let Some(day) = reservation {
            self.limiter.release(definition.id, day);
        }
    }

    fn defer(
        &self,
        claimed: &Enrollment,
        mut plan: Advance,
        until: DateTime<Utc>,
        reason: DeferReason,
    ) -> PassOutcome {
        plan.next_eligible_at = until;
        plan.status = EnrollmentStatus::pending(until, plan.now);
        metrics::counter!("scheduler.deferred", "reason" => reason.as_str()).increment(1);
        debug!(
            enrollment_id = %claimed.id,
            step = plan.current_step,
            until = %until,
            reason = reason.as_str(),
            "Step deferred"
        );
        self.commit(claimed, plan, PassOutcome::Deferred(reason))
    }

    fn fail(&self, claimed: &Enrollment, mut plan: Advance, reason: String) -> PassOutcome {
        plan.status = EnrollmentStatus::Failed;
        plan.failure_reason = Some(reason.clone());
        self.commit(claimed, plan, PassOutcome::Failed { reason })
    }

    fn end(&self, claimed: &Enrollment, mut plan: Advance, reason: EndReason) -> PassOutcome {
        plan.status = EnrollmentStatus::EndedByCondition;
        plan.end_reason = Some(reason);
        self.commit(claimed, plan, PassOutcome::Ended(reason))
    }

    fn complete(&self, claimed: &Enrollment, mut plan: Advance, step: u32) -> PassOutcome {
        plan.status = EnrollmentStatus::Completed;
        self.commit(claimed, plan, PassOutcome::Completed { step })
    }

    fn commit(&self, claimed: &Enrollment, plan: Advance, outcome: PassOutcome) -> PassOutcome {
        let sent: Vec<Event> = plan
            .events
            .iter()
            .filter(|e| e.kind == EventKind::Sent)
            .cloned()
            .collect();
        match self.store.advance(&claimed.id, claimed.version, plan) {
            Ok(committed) => {
                self.observe(&committed, &outcome);
                outcome
            }
            Err(StoreError::VersionConflict { expected, actual }) => {
                metrics::counter!("scheduler.version_conflicts").increment(1);
                warn!(
                    enrollment_id = %claimed.id,
                    expected,
                    actual,
                    "Commit lost to a concurrent update"
                );
                // The message went out and its budget slot stays spent; keep
                // the delivery in the audit trail.
                for event in sent {
                    metrics::counter!("scheduler.orphaned_sends").increment(1);
                    if let Err(err) = self.store.append_event(&claimed.id, event) {
                        warn!(enrollment_id = %claimed.id, error = %err, "Could not record orphaned send");
                    }
                }
                PassOutcome::Conflict
            }
            Err(err) => {
                warn!(enrollment_id = %claimed.id, error = %err, "Commit rejected");
                PassOutcome::Skipped
            }
        }
    }

    fn observe(&self, committed: &Enrollment, outcome: &PassOutcome) {
        let step = Some(committed.current_step);
        match outcome {
            PassOutcome::Completed { step } => {
                info!(enrollment_id = %committed.id, step, "Enrollment completed");
                metrics::counter!("scheduler.completed").increment(1);
                self.emit(EngineEventType::EnrollmentCompleted, committed, Some(*step), None);
            }
            PassOutcome::Ended(reason) => {
                info!(enrollment_id = %committed.id, reason = ?reason, "Enrollment ended by condition");
                metrics::counter!("scheduler.ended").increment(1);
                self.emit(
                    EngineEventType::EnrollmentEnded,
                    committed,
                    committed.last_completed_step,
                    Some(format!("{reason:?}")),
                );
            }
            PassOutcome::Failed { reason } => {
                warn!(enrollment_id = %committed.id, reason = %reason, "Enrollment failed");
                metrics::counter!("scheduler.failed").increment(1);
                self.emit(EngineEventType::EnrollmentFailed, committed, step, Some(reason.clone()));
            }
            PassOutcome::Deferred(DeferReason::RetryBackoff) => {
                self.emit(EngineEventType::SendRetried, committed, step, None);
            }
            PassOutcome::Deferred(reason) => {
                self.emit(
                    EngineEventType::StepDeferred,
                    committed,
                    step,
                    Some(reason.as_str().to_string()),
                );
            }
            _ => {}
        }
        if committed.status == EnrollmentStatus::Paused {
            info!(enrollment_id = %committed.id, "Deferred pause applied");
            self.emit(EngineEventType::EnrollmentPaused, committed, step, None);
        }
    }

    fn emit(
        &self,
        event_type: EngineEventType,
        enrollment: &Enrollment,
        step: Option<u32>,
        detail: Option<String>,
    ) {
        let mut event = make_event(
            event_type,
            enrollment.id,
            Some(enrollment.prospect_id.clone()),
            step,
        )
        .with_sequence(enrollment.sequence.sequence_id, enrollment.sequence.version);
        event.node_id = self.settings.node_id.clone();
        if let Some(detail) = detail {
            event = event.with_detail(detail);
        }
        self.event_sink.emit(event);
    }
}

/// A claim's expiry, read against the pass clock.
#[derive(Debug, Clone, Copy)]
struct Lease {
    until: DateTime<Utc>,
    clock: PassClock,
}

impl Lease {
    fn covers(&self, send_timeout: std::time::Duration) -> bool {
        let budget = Duration::from_std(send_timeout).unwrap_or_else(|_| Duration::hours(1));
        self.until - self.clock.now() > budget
    }
}

fn send_failed(step: &Step, now: DateTime<Utc>, reason: &str, attempt: u32, transient: bool) -> Event {
    Event::engine(EventKind::SendFailed, Some(step.step_number), now).with_metadata(
        serde_json::json!({
            "channel": step.kind.as_str(),
            "reason": reason,
            "attempt": attempt,
            "transient": transient,
        }),
    )
}

// ─── Worker pool ────────────────────────────────────────────────────────────

/// Independent scan workers plus one maintenance task.
pub struct SchedulerPool {
    handles: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
    workers: usize,
}

impl SchedulerPool {
    pub fn start(
        scheduler: Arc<SequenceScheduler>,
        workers: usize,
        poll_interval: std::time::Duration,
        maintenance_interval: std::time::Duration,
    ) -> Self {
        let (shutdown, signal) = watch::channel(false);
        let node = scheduler.settings().node_id.clone();
        let mut handles = Vec::with_capacity(workers + 1);

        for i in 0..workers {
            let worker_id = format!("{node}-scheduler-{i:02}");
            handles.push(spawn_worker(
                worker_id.clone(),
                scheduler.clone(),
                poll_interval,
                signal.clone(),
            ));
            info!(worker_id = %worker_id, "Scheduler worker spawned");
        }
        handles.push(spawn_maintenance(
            scheduler,
            maintenance_interval,
            signal,
        ));

        info!(count = workers, node = %node, "Scheduler pool started");
        Self {
            handles,
            shutdown,
            workers,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Signal every task and wait for the in-flight passes to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Scheduler task panicked");
            }
        }
        info!("Scheduler pool stopped");
    }
}

fn spawn_worker(
    worker_id: String,
    scheduler: Arc<SequenceScheduler>,
    poll_interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = scheduler.run_pass(Utc::now()).await;
                    if report.executed > 0 || report.failed > 0 {
                        debug!(
                            worker_id = %worker_id,
                            executed = report.executed,
                            failed = report.failed,
                            "Worker pass"
                        );
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(worker_id = %worker_id, "Scheduler worker exiting");
    })
}

fn spawn_maintenance(
    scheduler: Arc<SequenceScheduler>,
    interval: std::time::Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    scheduler.run_maintenance(Utc::now());
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryEnrollmentStore, NewEnrollment};
    use crate::types::{
        ConditionAction, ConditionTrigger, Contact, SendingSchedule, SequenceDraft,
        SequenceSettings, StepKind,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use outreach_core::event_bus::capture_sink;
    use std::sync::Mutex;

    /// Replays scripted outcomes, then delivers.
    struct Scripted {
        outcomes: Mutex<Vec<SendOutcome>>,
        calls: Mutex<Vec<SendRequest>>,
    }

    impl Scripted {
        fn new(outcomes: Vec<SendOutcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ChannelSender for Scripted {
        async fn send(&self, request: &SendRequest) -> SendOutcome {
            self.calls.lock().unwrap().push(request.clone());
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                SendOutcome::delivered(format!("msg-{}", request.step_number))
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct Harness {
        registry: Arc<SequenceRegistry>,
        store: Arc<InMemoryEnrollmentStore>,
        limiter: Arc<DailyRateLimiter>,
        sender: Arc<Scripted>,
        scheduler: SequenceScheduler,
    }

    fn harness(outcomes: Vec<SendOutcome>) -> Harness {
        let registry = Arc::new(SequenceRegistry::new());
        let store = Arc::new(InMemoryEnrollmentStore::new());
        let limiter = Arc::new(DailyRateLimiter::new());
        let sender = Scripted::new(outcomes);
        let mut settings = SchedulerSettings::default();
        settings.retry.max_attempts = 2;
        let scheduler = SequenceScheduler::new(
            registry.clone(),
            store.clone(),
            limiter.clone(),
            sender.clone(),
            settings,
        );
        Harness {
            registry,
            store,
            limiter,
            sender,
            scheduler,
        }
    }

    fn monday_10am() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 8, 10, 0, 0).unwrap()
    }

    fn publish(h: &Harness, steps: Vec<Step>, settings: SequenceSettings) -> Arc<SequenceDefinition> {
        h.registry
            .publish(
                SequenceDraft {
                    sequence_id: None,
                    name: "test".into(),
                    description: None,
                    steps,
                    settings,
                },
                monday_10am(),
            )
            .unwrap()
            .definition
    }

    fn utc_settings() -> SequenceSettings {
        SequenceSettings {
            sending_schedule: SendingSchedule::weekdays(
                crate::types::TimeRange::new(
                    crate::types::ClockTime::hm(9, 0),
                    crate::types::ClockTime::hm(17, 0),
                ),
                "UTC",
            ),
            ..SequenceSettings::default()
        }
    }

    fn enroll(h: &Harness, def: &SequenceDefinition, prospect: &str, at: DateTime<Utc>) -> Enrollment {
        h.store
            .enroll(NewEnrollment {
                prospect_id: prospect.into(),
                contact: Contact::email("p@example.com"),
                sequence: def.version_id(),
                first_step: 1,
                next_eligible_at: at,
                now: at,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_executes_and_schedules_next_step() {
        let h = harness(Vec::new());
        let def = publish(
            &h,
            vec![
                Step::new(1, StepKind::Email),
                Step::new(2, StepKind::Email).with_delay(2, 0),
            ],
            utc_settings(),
        );
        let now = monday_10am();
        let e = enroll(&h, &def, "p1", now);

        let report = h.scheduler.run_pass(now).await;
        assert_eq!(report.executed, 1);
        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.status, EnrollmentStatus::Waiting);
        assert_eq!(after.current_step, 2);
        assert_eq!(after.last_completed_step, Some(1));
        assert_eq!(after.next_eligible_at, now + Duration::days(2));
        assert!(after.lease_until.is_none());

        let report = h.scheduler.run_pass(now + Duration::days(2)).await;
        assert_eq!(report.completed, 1);
        assert_eq!(h.store.get(&e.id).unwrap().status, EnrollmentStatus::Completed);
        assert_eq!(h.sender.calls(), 2);
    }

    #[test]
    fn test_lease_outlives_send_timeout() {
        let mut config = AppConfig::default();
        config.scheduler.lease_secs = 1;
        config.scheduler.send_timeout_ms = 10_000;
        let settings = SchedulerSettings::from(&config);
        assert_eq!(settings.lease, Duration::seconds(20));
    }

    #[tokio::test]
    async fn test_short_lease_skips_send_and_releases_budget() {
        let h = harness(Vec::new());
        let settings = SchedulerSettings {
            lease: Duration::seconds(1),
            send_timeout: std::time::Duration::from_secs(2),
            ..SchedulerSettings::default()
        };
        let scheduler = SequenceScheduler::new(
            h.registry.clone(),
            h.store.clone(),
            h.limiter.clone(),
            h.sender.clone(),
            settings,
        );
        let def = publish(&h, vec![Step::new(1, StepKind::Email)], utc_settings());
        let now = monday_10am();
        let e = enroll(&h, &def, "p1", now);

        let report = scheduler.run_pass(now).await;
        assert_eq!(report.skipped, 1);
        assert_eq!(h.sender.calls(), 0);
        assert_eq!(h.limiter.usage(def.id, now.date_naive()), 0);
        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.status, EnrollmentStatus::Active);
        assert_eq!(after.current_step, 1);
        assert!(after.lease_until.is_none());
    }

    #[tokio::test]
    async fn test_reevaluated_jump_never_moves_backwards() {
        let h = harness(Vec::new());
        let def = publish(
            &h,
            vec![
                Step::new(1, StepKind::Email)
                    .with_condition(ConditionTrigger::MessageOpened, ConditionAction::SkipTo { step: 1 }),
                Step::new(2, StepKind::Email).with_delay(2, 0),
            ],
            utc_settings(),
        );
        let now = monday_10am();
        let e = enroll(&h, &def, "p1", now);
        h.scheduler.run_pass(now).await;

        h.store
            .append_event(&e.id, Event::engine(EventKind::Opened, None, now + Duration::minutes(30)))
            .unwrap();
        let report = h.scheduler.run_pass(now + Duration::hours(1)).await;
        assert_eq!(report.reevaluated, 1);

        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.current_step, 2);
        assert_eq!(after.status, EnrollmentStatus::Waiting);
        assert_eq!(after.next_eligible_at, now + Duration::days(2));
        assert!(!after.has_unevaluated_events());
        assert_eq!(h.sender.calls(), 1);
    }

    #[tokio::test]
    async fn test_window_closed_defers_without_sending() {
        let h = harness(Vec::new());
        let def = publish(&h, vec![Step::new(1, StepKind::Email)], utc_settings());
        // Saturday
        let saturday = Utc.with_ymd_and_hms(2024, 1, 13, 12, 0, 0).unwrap();
        let e = enroll(&h, &def, "p1", saturday);

        let report = h.scheduler.run_pass(saturday).await;
        assert_eq!(report.deferred, 1);
        assert_eq!(h.sender.calls(), 0);
        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.status, EnrollmentStatus::Waiting);
        assert_eq!(
            after.next_eligible_at,
            Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap()
        );
    }

    #[tokio::test]
    async fn test_transient_failures_retry_then_fail() {
        let h = harness(vec![
            SendOutcome::transient("503"),
            SendOutcome::transient("503"),
        ]);
        let def = publish(&h, vec![Step::new(1, StepKind::Email)], utc_settings());
        let now = monday_10am();
        let e = enroll(&h, &def, "p1", now);

        let report = h.scheduler.run_pass(now).await;
        assert_eq!(report.retried, 1);
        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.send_attempts, 1);
        assert_eq!(after.next_eligible_at, now + Duration::seconds(60));
        // Budget released on failure.
        assert_eq!(h.limiter.usage(def.id, now.date_naive()), 0);

        let later = now + Duration::minutes(2);
        let report = h.scheduler.run_pass(later).await;
        assert_eq!(report.failed, 1);
        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.status, EnrollmentStatus::Failed);
        assert!(after.failure_reason.unwrap().contains("2 attempts"));
    }

    #[tokio::test]
    async fn test_permanent_failure_is_terminal() {
        let h = harness(vec![SendOutcome::permanent("invalid recipient")]);
        let def = publish(
            &h,
            vec![Step::new(1, StepKind::Email), Step::new(2, StepKind::Email)],
            utc_settings(),
        );
        let now = monday_10am();
        let e = enroll(&h, &def, "p1", now);

        h.scheduler.run_pass(now).await;
        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.status, EnrollmentStatus::Failed);
        assert_eq!(after.failure_reason.as_deref(), Some("invalid recipient"));
        assert_eq!(h.limiter.usage(def.id, now.date_naive()), 0);
        assert!(h.scheduler.run_pass(now + Duration::days(1)).await.is_idle());
    }

    #[tokio::test]
    async fn test_paused_version_is_skipped_without_state_change() {
        let h = harness(Vec::new());
        let def = publish(&h, vec![Step::new(1, StepKind::Email)], utc_settings());
        let now = monday_10am();
        let e = enroll(&h, &def, "p1", now);
        h.registry.pause_sequence(&def.id).unwrap();

        let report = h.scheduler.run_pass(now).await;
        assert_eq!(report.paused_skipped, 1);
        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.version, e.version);
        assert_eq!(after.status, EnrollmentStatus::Active);

        h.registry.resume_sequence(&def.id).unwrap();
        assert_eq!(h.scheduler.run_pass(now).await.completed, 1);
    }

    #[tokio::test]
    async fn test_wait_and_manual_steps_skip_budget() {
        let h = harness(Vec::new());
        let mut settings = utc_settings();
        settings.max_emails_per_day = 1;
        let def = publish(
            &h,
            vec![
                Step::new(1, StepKind::Wait),
                Step::new(2, StepKind::ManualTask),
                Step::new(3, StepKind::Email),
            ],
            settings,
        );
        let now = monday_10am();
        let e = enroll(&h, &def, "p1", now);
        for _ in 0..3 {
            h.scheduler.run_pass(now).await;
        }
        let after = h.store.get(&e.id).unwrap();
        assert_eq!(after.status, EnrollmentStatus::Completed);
        assert_eq!(after.executed_steps(), vec![1, 2, 3]);
        assert_eq!(h.limiter.usage(def.id, now.date_naive()), 1);
        // The wait never reached the sender.
        assert_eq!(h.sender.calls(), 2);
    }

    #[tokio::test]
    async fn test_events_emitted_to_sink() {
        let sink = capture_sink();
        let h = harness(Vec::new());
        let scheduler = SequenceScheduler::new(
            h.registry.clone(),
            h.store.clone(),
            h.limiter.clone(),
            h.sender.clone(),
            SchedulerSettings::default(),
        )
        .with_event_sink(sink.clone());
        let def = publish(&h, vec![Step::new(1, StepKind::Email)], utc_settings());
        enroll(&h, &def, "p1", monday_10am());

        scheduler.run_pass(monday_10am()).await;
        assert_eq!(sink.count_type(EngineEventType::StepExecuted), 1);
        assert_eq!(sink.count_type(EngineEventType::EnrollmentCompleted), 1);
    }

    #[tokio::test]
    async fn test_maintenance_archives_idle_versions() {
        let h = harness(Vec::new());
        let v1 = publish(&h, vec![Step::new(1, StepKind::Email)], utc_settings());
        h.registry
            .publish(
                SequenceDraft {
                    sequence_id: Some(v1.id),
                    name: "test v2".into(),
                    description: None,
                    steps: vec![Step::new(1, StepKind::Email)],
                    settings: utc_settings(),
                },
                monday_10am(),
            )
            .unwrap();
        h.limiter
            .try_reserve(v1.id, monday_10am().date_naive() - Duration::days(30), 0);

        let report = h.scheduler.run_maintenance(monday_10am());
        assert_eq!(report.archived_versions, 1);
        assert_eq!(report.purged_counters, 1);
    }

    #[tokio::test]
    async fn test_pool_starts_and_stops() {
        let h = harness(Vec::new());
        let def = publish(&h, vec![Step::new(1, StepKind::Wait)], utc_settings());
        let e = enroll(&h, &def, "p1", Utc::now() - Duration::minutes(1));
        let scheduler = Arc::new(h.scheduler);
        let pool = SchedulerPool::start(
            scheduler,
            2,
            std::time::Duration::from_millis(10),
            std::time::Duration::from_secs(60),
        );
        assert_eq!(pool.worker_count(), 2);
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        pool.shutdown().await;
        assert_eq!(h.store.get(&e.id).unwrap().status, EnrollmentStatus::Completed);
    }
}
