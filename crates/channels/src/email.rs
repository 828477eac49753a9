//! SendGrid email channel.
//!
//! Sends step emails through the SendGrid v3 mail API and translates SendGrid
//! event webhooks back into inbound enrollment events. The enrollment id rides
//! along in `custom_args`, which SendGrid echoes on every webhook event.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use outreach_core::config::ChannelsConfig;
use outreach_sequence::ingest::InboundEvent;
use outreach_sequence::sender::{ChannelSender, SendOutcome, SendRequest};
use outreach_sequence::types::{EventKind, StepKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

/// Per-sequence delivery counters kept by the adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EmailStats {
    pub sent: u64,
    pub rejected: u64,
    pub delivered: u64,
    pub opens: u64,
    pub clicks: u64,
    pub bounces: u64,
    pub unsubscribes: u64,
}

/// Hands a built `mail/send` body to SendGrid.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn submit(&self, payload: serde_json::Value) -> SendOutcome;
}

/// Accepts every message locally and mints a SendGrid-shaped message id.
/// Used when no HTTP client is configured.
#[derive(Debug, Default)]
pub struct LoopbackTransport;

#[async_trait]
impl MailTransport for LoopbackTransport {
    async fn submit(&self, payload: serde_json::Value) -> SendOutcome {
        debug!(
            enrollment_id = %payload["personalizations"][0]["custom_args"]["enrollment_id"],
            "Loopback transport accepted email"
        );
        SendOutcome::delivered(format!("sg-{}", Uuid::new_v4()))
    }
}

pub struct SendGridSender {
    config: ChannelsConfig,
    transport: Arc<dyn MailTransport>,
    stats: DashMap<Uuid, EmailStats>,
    /// provider message id -> sequence id, so webhook events land on the right stats.
    messages: DashMap<String, Uuid>,
}

impl SendGridSender {
    pub fn new(config: ChannelsConfig) -> Self {
        Self::with_transport(config, Arc::new(LoopbackTransport))
    }

    pub fn with_transport(config: ChannelsConfig, transport: Arc<dyn MailTransport>) -> Self {
        info!(
            from = %config.from_email,
            open_tracking = config.open_tracking,
            click_tracking = config.click_tracking,
            "SendGrid sender initialized"
        );
        Self {
            config,
            transport,
            stats: DashMap::new(),
            messages: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ChannelsConfig {
        &self.config
    }

    /// Build the v3 `mail/send` body for one step.
    pub fn payload(&self, request: &SendRequest, to: &str) -> serde_json::Value {
        let mut personalization = serde_json::json!({
            "to": [{ "email": to }],
            "custom_args": {
                "enrollment_id": request.enrollment_id.to_string(),
                "prospect_id": request.prospect_id,
                "sequence_id": request.sequence.sequence_id.to_string(),
                "sequence_version": request.sequence.version.to_string(),
                "step": request.step_number.to_string(),
            }
        });
        if let Some(first_name) = &request.contact.first_name {
            personalization["dynamic_template_data"] = serde_json::json!({ "first_name": first_name });
        }

        let mut body = serde_json::json!({
            "personalizations": [personalization],
            "from": {
                "email": self.config.from_email,
                "name": self.config.from_name,
            },
            "tracking_settings": {
                "open_tracking": { "enable": self.config.open_tracking && request.track_opens },
                "click_tracking": { "enable": self.config.click_tracking && request.track_clicks },
            }
        });
        if let Some(template_id) = &request.content.template_id {
            body["template_id"] = serde_json::Value::String(template_id.clone());
        }
        if let Some(subject) = &request.content.subject {
            body["subject"] = serde_json::Value::String(subject.clone());
        }
        if let Some(html) = &request.content.body {
            body["content"] = serde_json::json!([{ "type": "text/html", "value": html }]);
        }
        body
    }

    /// Fold a webhook event into the delivery counters.
    pub fn process_webhook(&self, event: &SendGridEvent) {
        metrics::counter!("sendgrid.webhook_events", "type" => event.event.clone()).increment(1);
        let sequence_id = event
            .sg_message_id
            .as_deref()
            .and_then(|id| self.messages.get(message_key(id)).map(|s| *s))
            .or_else(|| event.sequence_id.as_deref().and_then(|s| s.parse().ok()));
        let Some(sequence_id) = sequence_id else {
            debug!(event = %event.event, "SendGrid event for unknown message");
            return;
        };

        let mut stats = self.stats.entry(sequence_id).or_default();
        match event.event.as_str() {
            "delivered" => stats.delivered += 1,
            "open" => stats.opens += 1,
            "click" => stats.clicks += 1,
            "bounce" | "dropped" => stats.bounces += 1,
            "unsubscribe" | "group_unsubscribe" | "spamreport" => stats.unsubscribes += 1,
            _ => {}
        }
    }

    pub fn stats(&self, sequence_id: &Uuid) -> EmailStats {
        self.stats
            .get(sequence_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    fn reject(&self, request: &SendRequest, reason: String) -> SendOutcome {
        self.stats
            .entry(request.sequence.sequence_id)
            .or_default()
            .rejected += 1;
        warn!(
            enrollment_id = %request.enrollment_id,
            step = request.step_number,
            reason = %reason,
            "SendGrid rejected email"
        );
        SendOutcome::permanent(reason)
    }
}

#[async_trait]
impl ChannelSender for SendGridSender {
    async fn send(&self, request: &SendRequest) -> SendOutcome {
        if request.kind != StepKind::Email {
            return SendOutcome::permanent(format!(
                "sendgrid cannot deliver {} steps",
                request.kind.as_str()
            ));
        }
        let to = match request.contact.email.as_deref().map(str::trim) {
            Some(address) if is_plausible_address(address) => address.to_string(),
            Some(address) => return self.reject(request, format!("invalid recipient {address:?}")),
            None => return self.reject(request, "prospect has no email address".into()),
        };

        let outcome = self.transport.submit(self.payload(request, &to)).await;
        let SendOutcome::Delivered {
            provider_message_id,
        } = &outcome
        else {
            return outcome;
        };

        if let Some(message_id) = provider_message_id {
            self.messages
                .insert(message_id.clone(), request.sequence.sequence_id);
        }
        self.stats
            .entry(request.sequence.sequence_id)
            .or_default()
            .sent += 1;
        metrics::counter!("sendgrid.emails_sent").increment(1);
        debug!(
            enrollment_id = %request.enrollment_id,
            step = request.step_number,
            to = %to,
            message_id = ?provider_message_id,
            "Email queued with SendGrid"
        );
        outcome
    }

    fn name(&self) -> &str {
        "sendgrid"
    }
}

fn is_plausible_address(address: &str) -> bool {
    match address.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && !address.contains(char::is_whitespace)
        }
        None => false,
    }
}

/// SendGrid suffixes webhook message ids with a filter tag
/// (`<id>.filter0001...`); the part before the first dot is what send returned.
fn message_key(sg_message_id: &str) -> &str {
    sg_message_id.split('.').next().unwrap_or(sg_message_id)
}

// ─── Webhook events ─────────────────────────────────────────────────────────

/// One element of a SendGrid event webhook batch. Custom args are flattened
/// into the event by SendGrid.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SendGridEvent {
    pub email: String,
    pub event: String,
    /// Unix seconds.
    pub timestamp: i64,
    #[serde(default)]
    pub sg_event_id: Option<String>,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub enrollment_id: Option<String>,
    #[serde(default)]
    pub sequence_id: Option<String>,
    #[serde(default)]
    pub step: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "type")]
    pub bounce_type: Option<String>,
}

impl SendGridEvent {
    /// Inbound kind for this event, `None` for delivery-pipeline events the
    /// engine does not act on (processed, deferred, delivered).
    pub fn inbound_kind(&self) -> Option<EventKind> {
        match self.event.as_str() {
            "open" => Some(EventKind::Opened),
            "click" => Some(EventKind::Clicked),
            "bounce" | "dropped" => Some(EventKind::Bounced),
            "unsubscribe" | "group_unsubscribe" | "spamreport" => Some(EventKind::Unsubscribed),
            _ => None,
        }
    }

    /// Map to an inbound event addressed to an enrollment. Events without a
    /// parsable enrollment id or an actionable kind yield `None`.
    pub fn to_inbound(&self) -> Option<(Uuid, InboundEvent)> {
        let kind = self.inbound_kind()?;
        let enrollment_id: Uuid = self.enrollment_id.as_deref()?.parse().ok()?;
        let event_id = match &self.sg_event_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!(
                "sg:{}:{}:{}",
                self.sg_message_id.as_deref().unwrap_or(&self.email),
                self.event,
                self.timestamp
            ),
        };
        let timestamp = DateTime::<Utc>::from_timestamp(self.timestamp, 0).unwrap_or_else(Utc::now);
        let metadata = serde_json::json!({
            "provider": "sendgrid",
            "event": self.event,
            "email": self.email,
            "sg_message_id": self.sg_message_id,
            "reason": self.reason,
            "url": self.url,
            "bounce_type": self.bounce_type,
        });
        Some((
            enrollment_id,
            InboundEvent {
                event_id,
                kind,
                timestamp,
                metadata,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outreach_sequence::types::{Contact, SequenceVersionId, StepContent};

    fn request(kind: StepKind, email: Option<&str>) -> SendRequest {
        SendRequest {
            enrollment_id: Uuid::new_v4(),
            prospect_id: "prospect-1".into(),
            sequence: SequenceVersionId::new(Uuid::new_v4(), 1),
            step_number: 1,
            kind,
            contact: Contact {
                email: email.map(str::to_string),
                first_name: Some("Ada".into()),
                ..Contact::default()
            },
            content: StepContent {
                template_id: None,
                subject: Some("Hello".into()),
                body: Some("<p>Hi</p>".into()),
            },
            attempt: 1,
            track_opens: true,
            track_clicks: false,
        }
    }

    fn sendgrid_event(event: &str, enrollment_id: Option<Uuid>) -> SendGridEvent {
        SendGridEvent {
            email: "ada@example.com".into(),
            event: event.into(),
            timestamp: 1_704_708_000,
            sg_event_id: Some(format!("evt-{event}")),
            sg_message_id: None,
            enrollment_id: enrollment_id.map(|id| id.to_string()),
            sequence_id: None,
            step: Some("1".into()),
            reason: None,
            url: None,
            bounce_type: None,
        }
    }

    #[tokio::test]
    async fn test_send_delivers_with_message_id() {
        let sender = SendGridSender::new(ChannelsConfig::default());
        let req = request(StepKind::Email, Some("ada@example.com"));
        match sender.send(&req).await {
            SendOutcome::Delivered {
                provider_message_id: Some(id),
            } => assert!(id.starts_with("sg-")),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(sender.stats(&req.sequence.sequence_id).sent, 1);
    }

    /// Keeps every payload and answers with a fixed outcome.
    struct CapturingTransport {
        payloads: std::sync::Mutex<Vec<serde_json::Value>>,
        outcome: SendOutcome,
    }

    #[async_trait]
    impl MailTransport for CapturingTransport {
        async fn submit(&self, payload: serde_json::Value) -> SendOutcome {
            self.payloads.lock().unwrap().push(payload);
            self.outcome.clone()
        }
    }

    fn capturing(outcome: SendOutcome) -> Arc<CapturingTransport> {
        Arc::new(CapturingTransport {
            payloads: std::sync::Mutex::new(Vec::new()),
            outcome,
        })
    }

    #[tokio::test]
    async fn test_send_submits_payload_to_transport() {
        let transport = capturing(SendOutcome::delivered("msg-42"));
        let sender = SendGridSender::with_transport(ChannelsConfig::default(), transport.clone());
        let req = request(StepKind::Email, Some(" ada@example.com "));

        let outcome = sender.send(&req).await;
        assert!(matches!(
            outcome,
            SendOutcome::Delivered { provider_message_id: Some(ref id) } if id == "msg-42"
        ));

        let payloads = transport.payloads.lock().unwrap();
        assert_eq!(payloads.len(), 1);
        let personalization = &payloads[0]["personalizations"][0];
        assert_eq!(personalization["to"][0]["email"], "ada@example.com");
        assert_eq!(
            personalization["custom_args"]["enrollment_id"],
            req.enrollment_id.to_string()
        );
        assert_eq!(sender.stats(&req.sequence.sequence_id).sent, 1);
    }

    #[tokio::test]
    async fn test_transport_failure_passes_through_uncounted() {
        let transport = capturing(SendOutcome::transient("429 too many requests"));
        let sender = SendGridSender::with_transport(ChannelsConfig::default(), transport.clone());
        let req = request(StepKind::Email, Some("ada@example.com"));

        let outcome = sender.send(&req).await;
        assert!(matches!(outcome, SendOutcome::TransientFailure { .. }));
        assert_eq!(transport.payloads.lock().unwrap().len(), 1);
        assert_eq!(sender.stats(&req.sequence.sequence_id), EmailStats::default());
    }

    #[tokio::test]
    async fn test_invalid_recipient_is_permanent() {
        let sender = SendGridSender::new(ChannelsConfig::default());
        for email in [None, Some("not-an-address"), Some("a@localhost"), Some("a b@x.io")] {
            let outcome = sender.send(&request(StepKind::Email, email)).await;
            assert!(matches!(outcome, SendOutcome::PermanentFailure { .. }), "{email:?}");
        }
        let outcome = sender
            .send(&request(StepKind::Call, Some("ada@example.com")))
            .await;
        assert!(matches!(outcome, SendOutcome::PermanentFailure { .. }));
    }

    #[test]
    fn test_payload_carries_enrollment_and_tracking() {
        let sender = SendGridSender::new(ChannelsConfig::default());
        let req = request(StepKind::Email, Some("ada@example.com"));
        let payload = sender.payload(&req, "ada@example.com");
        assert_eq!(
            payload["personalizations"][0]["custom_args"]["enrollment_id"],
            req.enrollment_id.to_string()
        );
        assert_eq!(payload["tracking_settings"]["open_tracking"]["enable"], true);
        assert_eq!(payload["tracking_settings"]["click_tracking"]["enable"], false);
        assert_eq!(payload["subject"], "Hello");
    }

    #[test]
    fn test_webhook_mapping() {
        let id = Uuid::new_v4();
        let (target, inbound) = sendgrid_event("open", Some(id)).to_inbound().unwrap();
        assert_eq!(target, id);
        assert_eq!(inbound.kind, EventKind::Opened);
        assert_eq!(inbound.event_id, "evt-open");
        assert_eq!(inbound.timestamp.timestamp(), 1_704_708_000);

        assert_eq!(
            sendgrid_event("dropped", Some(id)).to_inbound().unwrap().1.kind,
            EventKind::Bounced
        );
        assert_eq!(
            sendgrid_event("spamreport", Some(id)).to_inbound().unwrap().1.kind,
            EventKind::Unsubscribed
        );
        assert!(sendgrid_event("delivered", Some(id)).to_inbound().is_none());
        assert!(sendgrid_event("open", None).to_inbound().is_none());
    }

    #[test]
    fn test_webhook_event_id_fallback_is_stable() {
        let id = Uuid::new_v4();
        let mut event = sendgrid_event("click", Some(id));
        event.sg_event_id = None;
        event.sg_message_id = Some("abc.filter0001".into());
        let first = event.to_inbound().unwrap().1.event_id;
        let second = event.to_inbound().unwrap().1.event_id;
        assert_eq!(first, second);
        assert!(first.starts_with("sg:abc.filter0001:click:"));
    }

    #[tokio::test]
    async fn test_webhook_updates_stats_by_message() {
        let sender = SendGridSender::new(ChannelsConfig::default());
        let req = request(StepKind::Email, Some("ada@example.com"));
        let SendOutcome::Delivered {
            provider_message_id: Some(message_id),
        } = sender.send(&req).await
        else {
            panic!("expected delivery");
        };

        let mut event = sendgrid_event("open", Some(req.enrollment_id));
        event.sg_message_id = Some(format!("{message_id}.filter0001"));
        sender.process_webhook(&event);
        event.event = "bounce".into();
        sender.process_webhook(&event);

        let stats = sender.stats(&req.sequence.sequence_id);
        assert_eq!(stats.opens, 1);
        assert_eq!(stats.bounces, 1);
    }
}
