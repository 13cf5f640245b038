use super::types::{
    DeliveryError, DeliveryJob, DeliveryKeys, DeliveryState, ScheduledDelivery, DELIVERY_TASK_NAME,
    FLAG_ACTIVE, FLAG_CANCELLED,
};
use crate::config::DeliveryConfig;
use crate::coordination::{CoordinationStore, StoreError};
use crate::runner::{DelayedTaskRunner, TaskDescriptor, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Keeps at most one pending delivery per recipient.
///
/// Scheduling a new payload for a recipient supersedes whatever was pending
/// for it: the old task is flagged as cancelled in the coordination store and
/// revoked from the runner. The flag is what the delivery task checks before
/// sending, so cancellation holds even when the revoke arrives too late.
pub struct DebounceScheduler {
    store: Arc<dyn CoordinationStore>,
    runner: Arc<dyn DelayedTaskRunner>,
    keys: DeliveryKeys,
    config: DeliveryConfig,
}

impl DebounceScheduler {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        runner: Arc<dyn DelayedTaskRunner>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            store,
            runner,
            keys: DeliveryKeys::new(config.key_prefix.clone()),
            config,
        }
    }

    pub fn keys(&self) -> &DeliveryKeys {
        &self.keys
    }

    /// Schedule `payload` for `recipient_key` after `delay`, replacing any
    /// delivery still pending for that recipient. Returns the new task id.
    pub async fn schedule(
        &self,
        recipient_key: &str,
        payload: &str,
        delay: Duration,
    ) -> Result<TaskId, DeliveryError> {
        self.schedule_delivery(recipient_key, payload, delay)
            .await
            .map(|scheduled| scheduled.task_id)
    }

    /// Like [`Self::schedule`] but returns the full delivery record.
    pub async fn schedule_delivery(
        &self,
        recipient_key: &str,
        payload: &str,
        delay: Duration,
    ) -> Result<ScheduledDelivery, DeliveryError> {
        if recipient_key.trim().is_empty() {
            return Err(DeliveryError::InvalidRequest(
                "recipient key must not be empty".into(),
            ));
        }

        let job = DeliveryJob {
            recipient_key: recipient_key.to_string(),
            payload: payload.to_string(),
        };
        let job = serde_json::to_value(&job)
            .map_err(|e| DeliveryError::scheduling(recipient_key, e))?;
        let descriptor = TaskDescriptor::new(DELIVERY_TASK_NAME, job)
            .with_retries(self.config.send_max_retries, self.config.send_retry_delay());

        let task_id = self
            .runner
            .enqueue(descriptor, delay)
            .await
            .map_err(|e| DeliveryError::scheduling(recipient_key, e))?;

        let ttl = delay.saturating_add(self.config.grace_period());
        let task_key = self.keys.task(&task_id);
        let index_key = self.keys.recipient(recipient_key);

        if let Err(e) = self
            .store
            .set_with_ttl(&task_key, FLAG_ACTIVE, ttl)
            .await
        {
            self.runner.revoke(&task_id).await;
            return Err(DeliveryError::scheduling(recipient_key, e));
        }

        // Swapping the index in one step means every concurrent caller sees a
        // distinct predecessor, so each superseded task gets cancelled by
        // exactly one caller and only the last writer's task survives.
        let previous = match self
            .store
            .get_and_set_with_ttl(&index_key, task_id.as_str(), ttl)
            .await
        {
            Ok(previous) => previous.map(TaskId::from),
            Err(e) => {
                self.runner.revoke(&task_id).await;
                if let Err(cleanup) = self.store.delete(&task_key).await {
                    debug!(task_id = %task_id, error = %cleanup, "delivery.rollback_incomplete");
                }
                return Err(DeliveryError::scheduling(recipient_key, e));
            }
        };

        let superseded = match previous {
            Some(old) if old != task_id => {
                self.cancel_task(recipient_key, &old).await;
                Some(old)
            }
            _ => None,
        };

        info!(
            recipient = %recipient_key,
            task_id = %task_id,
            delay_ms = delay.as_millis() as u64,
            payload_len = payload.len(),
            superseded = superseded.is_some(),
            "delivery.scheduled"
        );

        Ok(ScheduledDelivery {
            recipient_key: recipient_key.to_string(),
            task_id,
            payload: payload.to_string(),
            delay,
            state: DeliveryState::Pending,
            superseded,
        })
    }

    /// Cancel whatever is pending for `recipient_key`.
    ///
    /// Returns `true` if a pending task was found and flagged. Calling this
    /// again for the same recipient returns `false`.
    pub async fn cancel(&self, recipient_key: &str) -> Result<bool, DeliveryError> {
        let index_key = self.keys.recipient(recipient_key);
        let Some(task_id) = self
            .store
            .get(&index_key)
            .await
            .map_err(|e| DeliveryError::scheduling(recipient_key, e))?
            .map(TaskId::from)
        else {
            return Ok(false);
        };

        self.mark_cancelled(&task_id)
            .await
            .map_err(|e| DeliveryError::scheduling(recipient_key, e))?;
        let revoked = self.runner.revoke(&task_id).await;

        // A concurrent schedule may already have replaced the index entry.
        self.store
            .delete_if_equals(&index_key, task_id.as_str())
            .await
            .map_err(|e| DeliveryError::scheduling(recipient_key, e))?;

        info!(
            recipient = %recipient_key,
            task_id = %task_id,
            revoked,
            "delivery.cancelled"
        );
        Ok(true)
    }

    /// Task id currently pending for `recipient_key`, if any.
    pub async fn pending(&self, recipient_key: &str) -> Result<Option<TaskId>, DeliveryError> {
        self.store
            .get(&self.keys.recipient(recipient_key))
            .await
            .map(|v| v.map(TaskId::from))
            .map_err(|e| DeliveryError::scheduling(recipient_key, e))
    }

    /// Stored state of a task. `None` once the task has run or its records expired.
    pub async fn state(&self, task_id: &TaskId) -> Result<Option<DeliveryState>, DeliveryError> {
        let flag = self
            .store
            .get(&self.keys.task(task_id))
            .await
            .map_err(|e| DeliveryError::scheduling(task_id.as_str(), e))?;
        Ok(flag.as_deref().and_then(DeliveryState::from_flag))
    }

    /// Flip the task flag to cancelled. The marker outlives the task's own
    /// "active" flag, so a task that still runs after a lost revoke sees it.
    async fn mark_cancelled(&self, task_id: &TaskId) -> Result<(), StoreError> {
        self.store
            .set_extending_ttl(
                &self.keys.task(task_id),
                FLAG_CANCELLED,
                self.config.cancel_marker_ttl(),
            )
            .await
    }

    async fn cancel_task(&self, recipient_key: &str, task_id: &TaskId) {
        let marked = self.mark_cancelled(task_id).await;
        let revoked = self.runner.revoke(task_id).await;

        match marked {
            Ok(()) => debug!(
                recipient = %recipient_key,
                task_id = %task_id,
                revoked,
                "delivery.superseded"
            ),
            Err(e) => warn!(
                recipient = %recipient_key,
                task_id = %task_id,
                revoked,
                error = %e,
                "delivery.supersede_unflagged"
            ),
        }
    }
}
