//! In-process delayed task runner.
//!
//! Each enqueued task gets its own tokio task that sleeps through the
//! countdown and then dispatches to the registered handler. Revocation
//! cancels the countdown; once a run has claimed the task it can no longer
//! be revoked. Retries re-enter the countdown and become revocable again.

use super::traits::{
    DelayedTaskRunner, RunnerError, TaskContext, TaskDescriptor, TaskHandler, TaskId, TaskOutcome,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type PendingMap = Arc<Mutex<HashMap<TaskId, CancellationToken>>>;

#[derive(Debug, Default)]
struct RunnerCounters {
    enqueued: AtomicU64,
    completed: AtomicU64,
    revoked: AtomicU64,
    retried: AtomicU64,
    exhausted: AtomicU64,
}

/// Snapshot of runner activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunnerStats {
    pub enqueued: u64,
    pub completed: u64,
    pub revoked: u64,
    pub retried: u64,
    pub exhausted: u64,
    pub pending: usize,
}

pub struct LocalTaskRunner {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
    pending: PendingMap,
    shutdown: CancellationToken,
    counters: Arc<RunnerCounters>,
}

impl LocalTaskRunner {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown: CancellationToken::new(),
            counters: Arc::new(RunnerCounters::default()),
        }
    }

    /// Register `handler` under `name`. A later registration replaces it.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        let name = name.into();
        debug!(task = %name, "runner.handler_registered");
        self.handlers.write().insert(name, handler);
    }

    /// Tasks waiting on a countdown (initial delay or retry delay).
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_pending(&self, task_id: &TaskId) -> bool {
        self.pending.lock().contains_key(task_id)
    }

    pub fn stats(&self) -> RunnerStats {
        RunnerStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            revoked: self.counters.revoked.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            exhausted: self.counters.exhausted.load(Ordering::Relaxed),
            pending: self.pending_count(),
        }
    }

    /// Stop accepting work and drop every task still counting down.
    /// Runs already in progress finish but are not retried.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let dropped = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        info!(dropped, "runner.shutdown");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Default for LocalTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalTaskRunner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl DelayedTaskRunner for LocalTaskRunner {
    async fn enqueue(
        &self,
        descriptor: TaskDescriptor,
        delay: Duration,
    ) -> Result<TaskId, RunnerError> {
        if self.shutdown.is_cancelled() {
            return Err(RunnerError::ShutDown);
        }
        let handler = self
            .handlers
            .read()
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| RunnerError::UnknownTask(descriptor.name.clone()))?;

        let task_id = TaskId::new();
        let token = self.shutdown.child_token();
        self.pending.lock().insert(task_id.clone(), token.clone());
        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);

        debug!(
            task_id = %task_id,
            task = %descriptor.name,
            delay_ms = delay.as_millis() as u64,
            "runner.enqueued"
        );

        tokio::spawn(drive(TaskRun {
            task_id: task_id.clone(),
            descriptor,
            handler,
            pending: Arc::clone(&self.pending),
            counters: Arc::clone(&self.counters),
            shutdown: self.shutdown.clone(),
            token,
            countdown: delay,
        }));

        Ok(task_id)
    }

    async fn revoke(&self, task_id: &TaskId) -> bool {
        let removed = self.pending.lock().remove(task_id);
        match removed {
            Some(token) => {
                token.cancel();
                self.counters.revoked.fetch_add(1, Ordering::Relaxed);
                debug!(task_id = %task_id, "runner.revoked");
                true
            }
            None => false,
        }
    }
}

struct TaskRun {
    task_id: TaskId,
    descriptor: TaskDescriptor,
    handler: Arc<dyn TaskHandler>,
    pending: PendingMap,
    counters: Arc<RunnerCounters>,
    shutdown: CancellationToken,
    token: CancellationToken,
    countdown: Duration,
}

async fn drive(mut run: TaskRun) {
    let mut attempt = 1u32;
    loop {
        tokio::select! {
            () = run.token.cancelled() => return,
            () = tokio::time::sleep(run.countdown) => {}
        }

        // Claiming removes the pending entry; a revoke that got there first wins.
        if run.pending.lock().remove(&run.task_id).is_none() {
            return;
        }

        let ctx = TaskContext {
            task_id: run.task_id.clone(),
            attempt,
            max_retries: run.descriptor.max_retries,
        };
        match run.handler.run(&ctx, &run.descriptor.payload).await {
            TaskOutcome::Done => {
                run.counters.completed.fetch_add(1, Ordering::Relaxed);
                return;
            }
            TaskOutcome::Retry(reason) => {
                if ctx.is_last_attempt() {
                    run.counters.exhausted.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        task_id = %run.task_id,
                        task = %run.descriptor.name,
                        attempts = attempt,
                        reason = %reason,
                        "runner.retries_exhausted"
                    );
                    return;
                }
                if run.shutdown.is_cancelled() {
                    return;
                }
                run.counters.retried.fetch_add(1, Ordering::Relaxed);
                debug!(
                    task_id = %run.task_id,
                    attempt,
                    reason = %reason,
                    "runner.retry_scheduled"
                );
                attempt += 1;
                run.countdown = run.descriptor.retry_delay;
                run.token = run.shutdown.child_token();
                run.pending
                    .lock()
                    .insert(run.task_id.clone(), run.token.clone());
            }
        }
    }
}
