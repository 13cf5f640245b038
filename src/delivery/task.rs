use super::types::{DeliveryJob, DeliveryKeys, DeliveryState, Transport};
use crate::config::DeliveryConfig;
use crate::coordination::CoordinationStore;
use crate::runner::{TaskContext, TaskHandler, TaskOutcome};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// How a single delivery run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent,
    /// The cancellation flag was set; nothing was sent.
    Skipped,
    /// Send failed or the flag could not be read; another run is due.
    RetryScheduled,
    /// Retries are exhausted; the payload was dropped.
    Failed,
}

/// Runner-side half of a delivery: checks the cancellation flag and sends.
pub struct DeliveryTask {
    store: Arc<dyn CoordinationStore>,
    transport: Arc<dyn Transport>,
    keys: DeliveryKeys,
}

impl DeliveryTask {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn Transport>,
        config: &DeliveryConfig,
    ) -> Self {
        Self {
            store,
            transport,
            keys: DeliveryKeys::new(config.key_prefix.clone()),
        }
    }

    pub async fn execute(&self, ctx: &TaskContext, job: &DeliveryJob) -> DeliveryOutcome {
        let task_key = self.keys.task(&ctx.task_id);

        // Without a readable flag we cannot rule out a cancellation, so hold off.
        let flag = match self.store.get(&task_key).await {
            Ok(flag) => flag,
            Err(e) => {
                return self.fail_attempt(ctx, job, &format!("cancellation check failed: {e}"))
                    .await;
            }
        };

        if flag.as_deref().and_then(DeliveryState::from_flag) == Some(DeliveryState::Cancelled) {
            info!(
                recipient = %job.recipient_key,
                task_id = %ctx.task_id,
                "delivery.skipped_cancelled"
            );
            self.clear_records(ctx, job).await;
            return DeliveryOutcome::Skipped;
        }

        match self.transport.send(&job.recipient_key, &job.payload).await {
            Ok(()) => {
                info!(
                    recipient = %job.recipient_key,
                    task_id = %ctx.task_id,
                    transport = self.transport.name(),
                    attempt = ctx.attempt,
                    payload_len = job.payload.len(),
                    "delivery.sent"
                );
                self.clear_records(ctx, job).await;
                DeliveryOutcome::Sent
            }
            Err(e) => self.fail_attempt(ctx, job, &format!("{e:#}")).await,
        }
    }

    async fn fail_attempt(
        &self,
        ctx: &TaskContext,
        job: &DeliveryJob,
        reason: &str,
    ) -> DeliveryOutcome {
        if ctx.is_last_attempt() {
            error!(
                recipient = %job.recipient_key,
                task_id = %ctx.task_id,
                attempts = ctx.attempt,
                error = %reason,
                "delivery.failed"
            );
            self.clear_records(ctx, job).await;
            DeliveryOutcome::Failed
        } else {
            warn!(
                recipient = %job.recipient_key,
                task_id = %ctx.task_id,
                attempt = ctx.attempt,
                max_retries = ctx.max_retries,
                error = %reason,
                "delivery.retry"
            );
            DeliveryOutcome::RetryScheduled
        }
    }

    /// Drop the task flag and, if it still points here, the recipient index.
    async fn clear_records(&self, ctx: &TaskContext, job: &DeliveryJob) {
        if let Err(e) = self.store.delete(&self.keys.task(&ctx.task_id)).await {
            debug!(task_id = %ctx.task_id, error = %e, "delivery.cleanup_failed");
        }
        if let Err(e) = self
            .store
            .delete_if_equals(&self.keys.recipient(&job.recipient_key), ctx.task_id.as_str())
            .await
        {
            debug!(task_id = %ctx.task_id, error = %e, "delivery.cleanup_failed");
        }
    }
}

#[async_trait]
impl TaskHandler for DeliveryTask {
    async fn run(&self, ctx: &TaskContext, payload: &serde_json::Value) -> TaskOutcome {
        let job: DeliveryJob = match serde_json::from_value(payload.clone()) {
            Ok(job) => job,
            Err(e) => {
                error!(task_id = %ctx.task_id, error = %e, "delivery.malformed_job");
                return TaskOutcome::Done;
            }
        };

        match self.execute(ctx, &job).await {
            DeliveryOutcome::RetryScheduled => {
                TaskOutcome::Retry(format!("delivery to {} not sent", job.recipient_key))
            }
            DeliveryOutcome::Sent | DeliveryOutcome::Skipped | DeliveryOutcome::Failed => {
                TaskOutcome::Done
            }
        }
    }
}
