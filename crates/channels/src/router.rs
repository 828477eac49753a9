//! Per-step-kind dispatch over concrete channel senders.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use outreach_core::config::ChannelsConfig;
use outreach_sequence::sender::{ChannelSender, SendOutcome, SendRequest};
use outreach_sequence::types::StepKind;
use tracing::{info, warn};

use crate::email::SendGridSender;
use crate::tasks::TaskQueueSender;

#[derive(Default)]
pub struct ChannelRouter {
    routes: HashMap<StepKind, Arc<dyn ChannelSender>>,
}

impl ChannelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// SendGrid for email, the operator task queue for everything a human does.
    pub fn standard(config: &ChannelsConfig) -> (Self, Arc<SendGridSender>, Arc<TaskQueueSender>) {
        let email = Arc::new(SendGridSender::new(config.clone()));
        let tasks = Arc::new(TaskQueueSender::new());
        let router = Self::new()
            .route(StepKind::Email, email.clone())
            .route(StepKind::Linkedin, tasks.clone())
            .route(StepKind::Call, tasks.clone())
            .route(StepKind::ManualTask, tasks.clone());
        info!(routes = router.routes.len(), "Channel router configured");
        (router, email, tasks)
    }

    pub fn route(mut self, kind: StepKind, sender: Arc<dyn ChannelSender>) -> Self {
        self.routes.insert(kind, sender);
        self
    }

    pub fn sender_for(&self, kind: StepKind) -> Option<&Arc<dyn ChannelSender>> {
        self.routes.get(&kind)
    }
}

#[async_trait]
impl ChannelSender for ChannelRouter {
    async fn send(&self, request: &SendRequest) -> SendOutcome {
        match self.routes.get(&request.kind) {
            Some(sender) => sender.send(request).await,
            None => {
                warn!(
                    enrollment_id = %request.enrollment_id,
                    kind = request.kind.as_str(),
                    "No channel configured for step kind"
                );
                SendOutcome::permanent(format!("no channel for {} steps", request.kind.as_str()))
            }
        }
    }

    fn name(&self) -> &str {
        "router"
    }
}
