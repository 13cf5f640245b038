//! Debounced delayed delivery.
//!
//! [`DebounceScheduler`] accepts payloads for a recipient and keeps only the
//! newest one pending. [`DeliveryTask`] runs inside the task runner once the
//! delay expires, re-checks the cancellation flag, and hands the payload to a
//! [`Transport`].

pub mod scheduler;
pub mod task;
pub mod types;

pub use scheduler::DebounceScheduler;
pub use task::{DeliveryOutcome, DeliveryTask};
pub use types::{
    DeliveryError, DeliveryJob, DeliveryKeys, DeliveryState, ScheduledDelivery, Transport,
    DELIVERY_TASK_NAME,
};

use crate::config::{Config, DeliveryConfig};
use crate::coordination::{self, CoordinationStore};
use crate::runner::LocalTaskRunner;
use std::sync::Arc;

/// Scheduler and in-process runner wired to the same store.
pub struct DeliveryPipeline {
    pub scheduler: DebounceScheduler,
    pub runner: Arc<LocalTaskRunner>,
    pub store: Arc<dyn CoordinationStore>,
}

impl DeliveryPipeline {
    pub fn local(
        store: Arc<dyn CoordinationStore>,
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
    ) -> Self {
        let runner = Arc::new(LocalTaskRunner::new());
        runner.register(
            DELIVERY_TASK_NAME,
            Arc::new(DeliveryTask::new(Arc::clone(&store), transport, &config)),
        );
        let scheduler = DebounceScheduler::new(Arc::clone(&store), runner.clone(), config);
        Self {
            scheduler,
            runner,
            store,
        }
    }

    /// Build from a loaded [`Config`], opening the configured store backend.
    pub fn from_config(config: &Config, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        let store = coordination::create_store(&config.store, &config.workspace_dir)?;
        Ok(Self::local(store, transport, config.delivery.clone()))
    }

    pub fn shutdown(&self) {
        self.runner.shutdown();
    }
}
