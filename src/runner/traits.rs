use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Opaque identifier assigned by a runner when a task is enqueued.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A named unit of deferred work.
#[derive(Debug, Clone)]
pub struct TaskDescriptor {
    /// Handler name the task is dispatched to.
    pub name: String,
    pub payload: serde_json::Value,
    /// Extra runs allowed after the first one asks for a retry.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl TaskDescriptor {
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
            max_retries: 0,
            retry_delay: Duration::ZERO,
        }
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}

/// Per-run information handed to a [`TaskHandler`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: TaskId,
    /// 1-based run number.
    pub attempt: u32,
    pub max_retries: u32,
}

impl TaskContext {
    /// True when a `Retry` outcome from this run would not be honoured.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt > self.max_retries
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Done,
    /// Run again after the descriptor's retry delay, if retries remain.
    Retry(String),
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, ctx: &TaskContext, payload: &serde_json::Value) -> TaskOutcome;
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("no handler registered for task '{0}'")]
    UnknownTask(String),
    #[error("task runner is shut down")]
    ShutDown,
    #[error("task rejected: {0}")]
    Rejected(String),
}

/// Accepts tasks to be run after a delay and lets callers withdraw them.
#[async_trait]
pub trait DelayedTaskRunner: Send + Sync {
    /// Schedule `descriptor` to run once `delay` has elapsed.
    async fn enqueue(
        &self,
        descriptor: TaskDescriptor,
        delay: Duration,
    ) -> Result<TaskId, RunnerError>;

    /// Best-effort withdrawal of a task that has not started yet.
    ///
    /// Returns `true` when the runner knew the task and stopped it before
    /// its next run. Unknown, started, or finished tasks return `false`.
    async fn revoke(&self, task_id: &TaskId) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_ids_are_unique_and_roundtrip_as_strings() {
        let a = TaskId::new();
        let b = TaskId::new();
        assert_ne!(a, b);

        let parsed = TaskId::from(a.to_string());
        assert_eq!(parsed, a);
        assert_eq!(parsed.as_str(), a.as_str());
    }

    #[test]
    fn task_id_serializes_as_plain_string() {
        let id = TaskId::from("abc-123");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"abc-123\"");
    }

    #[test]
    fn last_attempt_accounts_for_first_run() {
        let ctx = TaskContext {
            task_id: TaskId::new(),
            attempt: 1,
            max_retries: 0,
        };
        assert!(ctx.is_last_attempt());

        let ctx = TaskContext {
            attempt: 3,
            max_retries: 3,
            ..ctx
        };
        assert!(!ctx.is_last_attempt());

        let ctx = TaskContext { attempt: 4, ..ctx };
        assert!(ctx.is_last_attempt());
    }

    #[test]
    fn descriptor_defaults_to_single_run() {
        let d = TaskDescriptor::new("job", serde_json::json!({"k": 1}));
        assert_eq!(d.max_retries, 0);
        assert_eq!(d.retry_delay, Duration::ZERO);

        let d = d.with_retries(2, Duration::from_millis(50));
        assert_eq!(d.max_retries, 2);
        assert_eq!(d.retry_delay, Duration::from_millis(50));
    }
}
