use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;
use uuid::Uuid;

/// Identifies one immutable published version of a sequence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema,
)]
pub struct SequenceVersionId {
    pub sequence_id: Uuid,
    pub version: u32,
}

impl SequenceVersionId {
    pub fn new(sequence_id: Uuid, version: u32) -> Self {
        Self {
            sequence_id,
            version,
        }
    }
}

impl fmt::Display for SequenceVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@v{}", self.sequence_id, self.version)
    }
}

/// A published, immutable sequence version. Never mutated after publish;
/// edits produce a new version.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SequenceDefinition {
    pub id: Uuid,
    pub version: u32,
    pub name: String,
    pub description: Option<String>,
    pub steps: Vec<Step>,
    pub settings: SequenceSettings,
    /// Hex SHA-256 over name, description, steps and settings.
    pub digest: String,
    pub published_at: DateTime<Utc>,
}

impl SequenceDefinition {
    pub fn version_id(&self) -> SequenceVersionId {
        SequenceVersionId::new(self.id, self.version)
    }

    pub fn step(&self, step_number: u32) -> Option<&Step> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    /// First active step whose number is `>= step_number`.
    pub fn active_step_from(&self, step_number: u32) -> Option<&Step> {
        self.steps
            .iter()
            .filter(|s| s.active && s.step_number >= step_number)
            .min_by_key(|s| s.step_number)
    }

    /// First active step strictly after `step_number`.
    pub fn active_step_after(&self, step_number: u32) -> Option<&Step> {
        self.active_step_from(step_number.saturating_add(1))
    }

    pub fn first_active_step(&self) -> Option<&Step> {
        self.active_step_from(1)
    }
}

/// Operator input for publishing a sequence. `sequence_id` is `None` for a
/// brand new sequence and set when publishing a new version of an existing one.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SequenceDraft {
    #[serde(default)]
    pub sequence_id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub settings: SequenceSettings,
}

/// One ordered unit of a sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Step {
    pub step_number: u32,
    pub kind: StepKind,
    /// Measured from the previous step's completion (or enrollment for step 1).
    #[serde(default)]
    pub delay: Delay,
    /// Preferred local time of day for the touch.
    #[serde(default)]
    pub send_time: Option<ClockTime>,
    /// Overrides the schedule timezone for this step.
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub content: StepContent,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub skip_weekends: bool,
    /// Use the prospect's own timezone when it is known.
    #[serde(default)]
    pub respect_timezone: bool,
}

fn default_true() -> bool {
    true
}

impl Step {
    pub fn new(step_number: u32, kind: StepKind) -> Self {
        Self {
            step_number,
            kind,
            delay: Delay::default(),
            send_time: None,
            timezone: None,
            content: StepContent::default(),
            conditions: Vec::new(),
            active: true,
            skip_weekends: false,
            respect_timezone: false,
        }
    }

    pub fn with_delay(mut self, days: u32, hours: u32) -> Self {
        self.delay = Delay { days, hours };
        self
    }

    pub fn with_condition(mut self, trigger: ConditionTrigger, action: ConditionAction) -> Self {
        self.conditions.push(Condition { trigger, action });
        self
    }

    pub fn with_content(mut self, subject: &str, body: &str) -> Self {
        self.content.subject = Some(subject.to_string());
        self.content.body = Some(body.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Email,
    Linkedin,
    Call,
    ManualTask,
    Wait,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Email => "email",
            StepKind::Linkedin => "linkedin",
            StepKind::Call => "call",
            StepKind::ManualTask => "manual_task",
            StepKind::Wait => "wait",
        }
    }

    /// Outbound touches count against the daily per-sequence cap.
    pub fn consumes_budget(&self) -> bool {
        matches!(self, StepKind::Email | StepKind::Linkedin | StepKind::Call)
    }

    /// Everything except a wait is restricted to sending windows.
    pub fn is_window_gated(&self) -> bool {
        !matches!(self, StepKind::Wait)
    }

    pub fn invokes_sender(&self) -> bool {
        !matches!(self, StepKind::Wait)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Delay {
    #[serde(default)]
    pub days: u32,
    #[serde(default)]
    pub hours: u32,
}

impl Delay {
    pub fn duration(&self) -> Duration {
        Duration::days(i64::from(self.days)) + Duration::hours(i64::from(self.hours))
    }
}

/// Unrendered content handed to the Channel Sender as-is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StepContent {
    #[serde(default)]
    pub template_id: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Trigger/action pair evaluated against an enrollee's recorded events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Condition {
    pub trigger: ConditionTrigger,
    pub action: ConditionAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionTrigger {
    MessageOpened,
    MessageClicked,
    Replied,
    Bounced,
    Connected,
    TaskCompleted,
}

impl ConditionTrigger {
    pub fn matches(&self, kind: EventKind) -> bool {
        matches!(
            (self, kind),
            (ConditionTrigger::MessageOpened, EventKind::Opened)
                | (ConditionTrigger::MessageClicked, EventKind::Clicked)
                | (ConditionTrigger::Replied, EventKind::Replied)
                | (ConditionTrigger::Bounced, EventKind::Bounced)
                | (ConditionTrigger::Connected, EventKind::Connected)
                | (ConditionTrigger::TaskCompleted, EventKind::TaskCompleted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionTrigger::MessageOpened => "message_opened",
            ConditionTrigger::MessageClicked => "message_clicked",
            ConditionTrigger::Replied => "replied",
            ConditionTrigger::Bounced => "bounced",
            ConditionTrigger::Connected => "connected",
            ConditionTrigger::TaskCompleted => "task_completed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConditionAction {
    Continue,
    SkipTo { step: u32 },
    EndSequence,
}

/// Sequence-wide behaviour. Defaults mirror the product's stock settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SequenceSettings {
    #[serde(default = "default_true")]
    pub stop_on_reply: bool,
    #[serde(default = "default_true")]
    pub stop_on_auto_reply: bool,
    #[serde(default)]
    pub stop_on_out_of_office: bool,
    #[serde(default = "default_true")]
    pub respect_unsubscribes: bool,
    #[serde(default = "default_true")]
    pub track_opens: bool,
    #[serde(default = "default_true")]
    pub track_clicks: bool,
    /// Daily cap on outbound touches; `0` means unlimited.
    #[serde(default = "default_max_emails_per_day")]
    pub max_emails_per_day: u32,
    #[serde(default)]
    pub sending_schedule: SendingSchedule,
}

fn default_max_emails_per_day() -> u32 {
    50
}

impl Default for SequenceSettings {
    fn default() -> Self {
        Self {
            stop_on_reply: true,
            stop_on_auto_reply: true,
            stop_on_out_of_office: false,
            respect_unsubscribes: true,
            track_opens: true,
            track_clicks: true,
            max_emails_per_day: default_max_emails_per_day(),
            sending_schedule: SendingSchedule::default(),
        }
    }
}

/// Weekly table of local-time sending windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SendingSchedule {
    #[serde(default)]
    pub monday: Vec<TimeRange>,
    #[serde(default)]
    pub tuesday: Vec<TimeRange>,
    #[serde(default)]
    pub wednesday: Vec<TimeRange>,
    #[serde(default)]
    pub thursday: Vec<TimeRange>,
    #[serde(default)]
    pub friday: Vec<TimeRange>,
    #[serde(default)]
    pub saturday: Vec<TimeRange>,
    #[serde(default)]
    pub sunday: Vec<TimeRange>,
    /// IANA timezone name, e.g. `America/New_York`.
    pub timezone: String,
}

impl SendingSchedule {
    /// Same ranges on every weekday, nothing on weekends.
    pub fn weekdays(range: TimeRange, timezone: &str) -> Self {
        Self {
            monday: vec![range],
            tuesday: vec![range],
            wednesday: vec![range],
            thursday: vec![range],
            friday: vec![range],
            saturday: Vec::new(),
            sunday: Vec::new(),
            timezone: timezone.to_string(),
        }
    }

    /// Open around the clock, every day.
    pub fn always(timezone: &str) -> Self {
        let range = TimeRange::full_day();
        Self {
            saturday: vec![range],
            sunday: vec![range],
            ..Self::weekdays(range, timezone)
        }
    }

    pub fn ranges_for(&self, day: Weekday) -> &[TimeRange] {
        match day {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }

    pub fn days(&self) -> [(Weekday, &[TimeRange]); 7] {
        [
            (Weekday::Mon, &self.monday[..]),
            (Weekday::Tue, &self.tuesday[..]),
            (Weekday::Wed, &self.wednesday[..]),
            (Weekday::Thu, &self.thursday[..]),
            (Weekday::Fri, &self.friday[..]),
            (Weekday::Sat, &self.saturday[..]),
            (Weekday::Sun, &self.sunday[..]),
        ]
    }
}

impl Default for SendingSchedule {
    fn default() -> Self {
        Self::weekdays(
            TimeRange::new(ClockTime::hm(9, 0), ClockTime::hm(17, 0)),
            "America/New_York",
        )
    }
}

/// Local-time range, start inclusive, end exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct TimeRange {
    pub start: ClockTime,
    pub end: ClockTime,
}

impl TimeRange {
    pub fn new(start: ClockTime, end: ClockTime) -> Self {
        Self { start, end }
    }

    pub fn full_day() -> Self {
        Self::new(ClockTime::MIDNIGHT, ClockTime::END_OF_DAY)
    }

    pub fn contains_seconds(&self, seconds_from_midnight: u32) -> bool {
        self.start.seconds() <= seconds_from_midnight && seconds_from_midnight < self.end.seconds()
    }
}

/// Minutes since local midnight, `00:00` through `24:00`. Serialized as `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema)]
#[schema(value_type = String, example = "09:00")]
pub struct ClockTime(u32);

impl ClockTime {
    pub const MIDNIGHT: ClockTime = ClockTime(0);
    pub const END_OF_DAY: ClockTime = ClockTime(24 * 60);

    pub fn hm(hour: u32, minute: u32) -> Self {
        Self((hour * 60 + minute).min(24 * 60))
    }

    pub fn minutes(&self) -> u32 {
        self.0
    }

    pub fn seconds(&self) -> u32 {
        self.0 * 60
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .split_once(':')
            .ok_or_else(|| format!("invalid time '{s}', expected HH:MM"))?;
        let hour: u32 = h
            .trim()
            .parse()
            .map_err(|_| format!("invalid hour in '{s}'"))?;
        let minute: u32 = m
            .trim()
            .parse()
            .map_err(|_| format!("invalid minute in '{s}'"))?;
        if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
            return Err(format!("time '{s}' out of range"));
        }
        Ok(ClockTime(hour * 60 + minute))
    }
}

impl Serialize for ClockTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ClockTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    // Recorded by the engine
    Sent,
    SendFailed,
    WaitElapsed,
    Paused,
    Resumed,
    // Reported by providers
    Opened,
    Clicked,
    Replied,
    AutoReplied,
    OutOfOffice,
    Bounced,
    Unsubscribed,
    Connected,
    TaskCompleted,
}

impl EventKind {
    /// Kinds accepted from the outside world through Event Ingest.
    pub fn is_inbound(&self) -> bool {
        !matches!(
            self,
            EventKind::Sent
                | EventKind::SendFailed
                | EventKind::WaitElapsed
                | EventKind::Paused
                | EventKind::Resumed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Sent => "sent",
            EventKind::SendFailed => "send_failed",
            EventKind::WaitElapsed => "wait_elapsed",
            EventKind::Paused => "paused",
            EventKind::Resumed => "resumed",
            EventKind::Opened => "opened",
            EventKind::Clicked => "clicked",
            EventKind::Replied => "replied",
            EventKind::AutoReplied => "auto_replied",
            EventKind::OutOfOffice => "out_of_office",
            EventKind::Bounced => "bounced",
            EventKind::Unsubscribed => "unsubscribed",
            EventKind::Connected => "connected",
            EventKind::TaskCompleted => "task_completed",
        }
    }
}

/// Immutable fact about an enrollee. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Event {
    pub event_id: String,
    pub kind: EventKind,
    /// When the fact happened, as reported by its origin.
    pub timestamp: DateTime<Utc>,
    /// When the engine appended it.
    pub recorded_at: DateTime<Utc>,
    /// Step the fact originates from. Inbound events inherit the last executed step.
    pub step_number: Option<u32>,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub metadata: serde_json::Value,
}

impl Event {
    /// Engine-generated event with a fresh id.
    pub fn engine(kind: EventKind, step_number: Option<u32>, at: DateTime<Utc>) -> Self {
        Self {
            event_id: format!("engine-{}", Uuid::new_v4()),
            kind,
            timestamp: at,
            recorded_at: at,
            step_number,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

// ─── Enrollment ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Active,
    Waiting,
    Paused,
    Completed,
    EndedByCondition,
    Failed,
}

impl EnrollmentStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EnrollmentStatus::Completed | EnrollmentStatus::EndedByCondition | EnrollmentStatus::Failed
        )
    }

    /// Statuses the scheduler's due-scan considers.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, EnrollmentStatus::Active | EnrollmentStatus::Waiting)
    }

    /// `Active` when already eligible, `Waiting` otherwise.
    pub fn pending(next_eligible_at: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        if next_eligible_at <= now {
            EnrollmentStatus::Active
        } else {
            EnrollmentStatus::Waiting
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Active => "active",
            EnrollmentStatus::Waiting => "waiting",
            EnrollmentStatus::Paused => "paused",
            EnrollmentStatus::Completed => "completed",
            EnrollmentStatus::EndedByCondition => "ended_by_condition",
            EnrollmentStatus::Failed => "failed",
        }
    }
}

/// How to reach a prospect. Only the fields a step kind needs are required.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Contact {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub linkedin_url: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    /// IANA timezone of the prospect.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl Contact {
    pub fn email(address: &str) -> Self {
        Self {
            email: Some(address.to_string()),
            ..Self::default()
        }
    }
}

/// Why an enrollment ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum EndReason {
    Unsubscribed,
    Replied,
    AutoReplied,
    OutOfOffice,
    Condition {
        step: u32,
        trigger: ConditionTrigger,
    },
}

/// Mutable per-(prospect, sequence version) progress record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct Enrollment {
    pub id: Uuid,
    pub prospect_id: String,
    pub contact: Contact,
    pub sequence: SequenceVersionId,
    pub status: EnrollmentStatus,
    /// Next step to execute.
    pub current_step: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub last_completed_step: Option<u32>,
    pub last_completed_at: Option<DateTime<Utc>>,
    /// Consecutive transient send failures on the current step.
    pub send_attempts: u32,
    pub end_reason: Option<EndReason>,
    pub failure_reason: Option<String>,
    pub enrolled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped on every state change.
    pub version: u64,
    /// History index where the last executed step's condition scope starts.
    pub condition_window: usize,
    pub inbound_count: usize,
    /// Inbound events already seen by the condition evaluator.
    pub evaluated_inbound: usize,
    pub lease_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pause_requested: bool,
    pub history: Vec<Event>,
}

impl Enrollment {
    pub fn has_unevaluated_events(&self) -> bool {
        self.inbound_count > self.evaluated_inbound
    }

    pub fn is_leased(&self, now: DateTime<Utc>) -> bool {
        self.lease_until.is_some_and(|until| until > now)
    }

    /// Steps that were actually executed, in execution order.
    pub fn executed_steps(&self) -> Vec<u32> {
        self.history
            .iter()
            .filter(|e| matches!(e.kind, EventKind::Sent | EventKind::WaitElapsed))
            .filter_map(|e| e.step_number)
            .collect()
    }
}

/// Outcome of evaluating a step's conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Continue,
    SkipTo(u32),
    End(EndReason),
}
