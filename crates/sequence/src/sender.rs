//! Channel Sender capability consumed by the scheduler.

use std::time::Duration;

use async_trait::async_trait;
use outreach_core::config::RetryConfig;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Contact, SequenceVersionId, StepContent, StepKind};

/// Everything a channel needs to perform one touch. Content is unrendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendRequest {
    pub enrollment_id: Uuid,
    pub prospect_id: String,
    pub sequence: SequenceVersionId,
    pub step_number: u32,
    pub kind: StepKind,
    pub contact: Contact,
    pub content: StepContent,
    /// 1-based attempt number for this step.
    pub attempt: u32,
    pub track_opens: bool,
    pub track_clicks: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum SendOutcome {
    Delivered { provider_message_id: Option<String> },
    /// Timeouts, provider 5xx. Retried with backoff.
    TransientFailure { reason: String },
    /// Invalid recipient, hard bounce. Never retried.
    PermanentFailure { reason: String },
}

impl SendOutcome {
    pub fn delivered(id: impl Into<String>) -> Self {
        SendOutcome::Delivered {
            provider_message_id: Some(id.into()),
        }
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        SendOutcome::TransientFailure {
            reason: reason.into(),
        }
    }

    pub fn permanent(reason: impl Into<String>) -> Self {
        SendOutcome::PermanentFailure {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SendOutcome::Delivered { .. } => "delivered",
            SendOutcome::TransientFailure { .. } => "transient",
            SendOutcome::PermanentFailure { .. } => "permanent",
        }
    }
}

#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, request: &SendRequest) -> SendOutcome;

    fn name(&self) -> &str {
        "channel"
    }
}

/// Bounded wait on the sender; running out of time is a transient failure.
pub async fn send_with_timeout(
    sender: &dyn ChannelSender,
    request: &SendRequest,
    timeout: Duration,
) -> SendOutcome {
    match tokio::time::timeout(timeout, sender.send(request)).await {
        Ok(outcome) => outcome,
        Err(_) => SendOutcome::transient(format!(
            "{} did not answer within {}ms",
            sender.name(),
            timeout.as_millis()
        )),
    }
}

/// Exponential backoff for transient send failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Delay before retrying after `attempt` failures: `initial * multiplier^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64()).max(0.0);
        Duration::from_secs_f64(capped)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_secs(config.initial_backoff_secs),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            multiplier: config.multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Slow;

    #[async_trait]
    impl ChannelSender for Slow {
        async fn send(&self, _request: &SendRequest) -> SendOutcome {
            tokio::time::sleep(Duration::from_secs(5)).await;
            SendOutcome::delivered("late")
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn request() -> SendRequest {
        SendRequest {
            enrollment_id: Uuid::new_v4(),
            prospect_id: "p1".into(),
            sequence: SequenceVersionId::new(Uuid::new_v4(), 1),
            step_number: 1,
            kind: StepKind::Email,
            contact: Contact::email("p@example.com"),
            content: StepContent::default(),
            attempt: 1,
            track_opens: true,
            track_clicks: true,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(300),
            multiplier: 2.0,
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(60));
        assert_eq!(policy.backoff(2), Duration::from_secs(120));
        assert_eq!(policy.backoff(3), Duration::from_secs(240));
        assert_eq!(policy.backoff(4), Duration::from_secs(300));
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let outcome = send_with_timeout(&Slow, &request(), Duration::from_millis(10)).await;
        assert!(matches!(outcome, SendOutcome::TransientFailure { ref reason } if reason.contains("slow")));
    }
}
