//! Operator task queue for touches a human performs: LinkedIn messages,
//! calls and manual tasks. A send succeeds once the task is queued; the
//! operator's completion is reported back as a `task_completed` event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use outreach_sequence::sender::{ChannelSender, SendOutcome, SendRequest};
use outreach_sequence::types::{Contact, SequenceVersionId, StepContent, StepKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OutreachTask {
    pub id: Uuid,
    pub enrollment_id: Uuid,
    pub prospect_id: String,
    pub sequence: SequenceVersionId,
    pub step_number: u32,
    pub kind: StepKind,
    pub contact: Contact,
    pub content: StepContent,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl OutreachTask {
    pub fn is_open(&self) -> bool {
        self.completed_at.is_none()
    }
}

#[derive(Default)]
pub struct TaskQueueSender {
    tasks: DashMap<Uuid, OutreachTask>,
}

impl TaskQueueSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open tasks, oldest first.
    pub fn open_tasks(&self) -> Vec<OutreachTask> {
        let mut open: Vec<OutreachTask> = self
            .tasks
            .iter()
            .filter(|t| t.is_open())
            .map(|t| t.value().clone())
            .collect();
        open.sort_by_key(|t| t.created_at);
        open
    }

    pub fn get(&self, id: &Uuid) -> Option<OutreachTask> {
        self.tasks.get(id).map(|t| t.clone())
    }

    /// Mark a task done. Completing twice keeps the first completion time.
    pub fn complete(&self, id: &Uuid, at: DateTime<Utc>) -> Option<OutreachTask> {
        let mut task = self.tasks.get_mut(id)?;
        if task.completed_at.is_none() {
            task.completed_at = Some(at);
            info!(task_id = %id, enrollment_id = %task.enrollment_id, "Task completed");
            metrics::counter!("tasks.completed", "kind" => task.kind.as_str()).increment(1);
        }
        Some(task.clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Contact detail a human touch needs; `None` means the kind needs nothing.
fn missing_contact(kind: StepKind, contact: &Contact) -> Option<&'static str> {
    let blank = |v: &Option<String>| v.as_deref().map_or(true, |s| s.trim().is_empty());
    match kind {
        StepKind::Linkedin if blank(&contact.linkedin_url) => Some("prospect has no LinkedIn URL"),
        StepKind::Call if blank(&contact.phone) => Some("prospect has no phone number"),
        _ => None,
    }
}

#[async_trait]
impl ChannelSender for TaskQueueSender {
    async fn send(&self, request: &SendRequest) -> SendOutcome {
        match request.kind {
            StepKind::Linkedin | StepKind::Call | StepKind::ManualTask => {}
            other => {
                return SendOutcome::permanent(format!(
                    "task queue cannot deliver {} steps",
                    other.as_str()
                ))
            }
        }
        if let Some(reason) = missing_contact(request.kind, &request.contact) {
            return SendOutcome::permanent(reason);
        }

        // One task per (enrollment, step); a retried send reuses it.
        let existing = self
            .tasks
            .iter()
            .find(|t| t.enrollment_id == request.enrollment_id && t.step_number == request.step_number)
            .map(|t| t.id);
        let id = match existing {
            Some(id) => id,
            None => {
                let task = OutreachTask {
                    id: Uuid::new_v4(),
                    enrollment_id: request.enrollment_id,
                    prospect_id: request.prospect_id.clone(),
                    sequence: request.sequence,
                    step_number: request.step_number,
                    kind: request.kind,
                    contact: request.contact.clone(),
                    content: request.content.clone(),
                    created_at: Utc::now(),
                    completed_at: None,
                };
                let id = task.id;
                self.tasks.insert(id, task);
                metrics::counter!("tasks.created", "kind" => request.kind.as_str()).increment(1);
                id
            }
        };
        debug!(
            task_id = %id,
            enrollment_id = %request.enrollment_id,
            kind = request.kind.as_str(),
            "Task queued"
        );
        SendOutcome::delivered(format!("task-{id}"))
    }

    fn name(&self) -> &str {
        "task_queue"
    }
}
