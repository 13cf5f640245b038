use crate::runner::TaskId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runner task name the scheduler enqueues deliveries under.
pub const DELIVERY_TASK_NAME: &str = "send_message_for_client";

pub(crate) const FLAG_ACTIVE: &str = "active";
pub(crate) const FLAG_CANCELLED: &str = "cancelled";

/// Lifecycle of a scheduled delivery.
///
/// Only `Pending` and `Cancelled` are ever written to the store. An executed
/// delivery has its records removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Pending,
    Cancelled,
    Executed,
}

impl DeliveryState {
    /// Value stored under the task key. `None` for `Executed`, which is
    /// represented by the records being gone.
    pub fn as_flag(self) -> Option<&'static str> {
        match self {
            Self::Pending => Some(FLAG_ACTIVE),
            Self::Cancelled => Some(FLAG_CANCELLED),
            Self::Executed => None,
        }
    }

    pub fn from_flag(flag: &str) -> Option<Self> {
        match flag {
            FLAG_ACTIVE => Some(Self::Pending),
            FLAG_CANCELLED => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A delivery the scheduler has accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDelivery {
    pub recipient_key: String,
    pub task_id: TaskId,
    pub payload: String,
    pub delay: Duration,
    pub state: DeliveryState,
    /// Task this delivery replaced, if one was pending.
    pub superseded: Option<TaskId>,
}

/// Payload carried through the task runner to [`super::DeliveryTask`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub recipient_key: String,
    pub payload: String,
}

/// Builds coordination store keys under a shared prefix.
#[derive(Debug, Clone)]
pub struct DeliveryKeys {
    prefix: String,
}

impl DeliveryKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Key holding the cancellation flag for one task.
    pub fn task(&self, task_id: &TaskId) -> String {
        format!("{}:{}", self.prefix, task_id)
    }

    /// Key holding the pending task id for one recipient.
    pub fn recipient(&self, recipient_key: &str) -> String {
        format!("{}:recipient:{}", self.prefix, recipient_key)
    }
}

/// Outbound side of a delivery: hands the payload to the messaging platform.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver `payload` to `recipient_key`. An `Err` is treated as transient
    /// and retried up to the configured limit.
    async fn send(&self, recipient_key: &str, payload: &str) -> anyhow::Result<()>;
}

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("invalid delivery request: {0}")]
    InvalidRequest(String),
    #[error("failed to schedule delivery for '{recipient}': {source}")]
    SchedulingFailure {
        recipient: String,
        #[source]
        source: anyhow::Error,
    },
}

impl DeliveryError {
    pub(crate) fn scheduling(recipient: &str, source: impl Into<anyhow::Error>) -> Self {
        Self::SchedulingFailure {
            recipient: recipient.to_string(),
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_map_to_states() {
        assert_eq!(DeliveryState::Pending.as_flag(), Some("active"));
        assert_eq!(DeliveryState::Cancelled.as_flag(), Some("cancelled"));
        assert_eq!(DeliveryState::Executed.as_flag(), None);
        assert_eq!(
            DeliveryState::from_flag("cancelled"),
            Some(DeliveryState::Cancelled)
        );
        assert_eq!(
            DeliveryState::from_flag("active"),
            Some(DeliveryState::Pending)
        );
        assert_eq!(DeliveryState::from_flag("bogus"), None);
    }

    #[test]
    fn keys_share_prefix_without_colliding() {
        let keys = DeliveryKeys::new("tg:task");
        let id = TaskId::from("0b6c");
        assert_eq!(keys.task(&id), "tg:task:0b6c");
        assert_eq!(keys.recipient("42"), "tg:task:recipient:42");
        assert_ne!(keys.task(&TaskId::from("recipient")), keys.recipient(""));
    }

    #[test]
    fn job_roundtrips_through_runner_payload() {
        let job = DeliveryJob {
            recipient_key: "chat-1".into(),
            payload: "hello".into(),
        };
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["recipient_key"], "chat-1");
        let back: DeliveryJob = serde_json::from_value(value).unwrap();
        assert_eq!(back, job);
    }

    #[test]
    fn scheduling_failure_names_recipient() {
        let err = DeliveryError::scheduling("chat-9", anyhow::anyhow!("store down"));
        let msg = err.to_string();
        assert!(msg.contains("chat-9"));
        assert!(msg.contains("store down"));
    }
}
