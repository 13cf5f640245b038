//! Lazily initialised, concurrency-bounded agent singleton.

use super::retry::{retry_async, RetryPolicy, RetryPolicyError};
use super::role::AgentRole;
use super::classify::ErrorClass;
use crate::concurrency::{Backpressure, BackpressurePermit, BackpressureStats};
use crate::config::GateConfig;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{agent}: initialization failed: {source}")]
    Initialization {
        agent: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("{agent}: non-retryable failure on attempt {attempts}: {source}")]
    Fatal {
        agent: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("{agent}: gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        agent: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },
    #[error("{agent}: all {limit} execution slots are busy")]
    Saturated { agent: String, limit: usize },
}

impl ExecutionError {
    pub fn agent(&self) -> &str {
        match self {
            Self::Initialization { agent, .. }
            | Self::Fatal { agent, .. }
            | Self::RetriesExhausted { agent, .. }
            | Self::Saturated { agent, .. } => agent,
        }
    }

    /// Attempts made at the request itself. Zero when the request never ran.
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Initialization { .. } | Self::Saturated { .. } => 0,
            Self::Fatal { attempts, .. } | Self::RetriesExhausted { attempts, .. } => *attempts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Uninitialized,
    Initializing,
    Ready,
}

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

impl SlotState {
    fn from_u8(v: u8) -> Self {
        match v {
            READY => Self::Ready,
            INITIALIZING => Self::Initializing,
            _ => Self::Uninitialized,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotStats {
    pub state: SlotState,
    pub builds: u64,
    pub executions: u64,
    pub failures: u64,
    pub admission: BackpressureStats,
}

/// One process-wide agent: built on first use, then shared by every caller.
///
/// Initialization is single-flight. Concurrent first callers queue on the
/// init lock and reuse the winner's runnable. A failed build publishes
/// nothing, so the next call tries again. At most `concurrency_limit`
/// requests run the role's pipeline at once; the rest wait for a permit.
pub struct AgentSlot<R: AgentRole> {
    role: R,
    runnable: OnceLock<R::Runnable>,
    init_lock: Mutex<()>,
    state: AtomicU8,
    admission: Backpressure,
    policy: RetryPolicy,
    builds: AtomicU64,
    executions: AtomicU64,
    failures: AtomicU64,
}

impl<R: AgentRole> AgentSlot<R> {
    /// Fails when `policy` does not validate.
    pub fn new(
        role: R,
        concurrency_limit: usize,
        policy: RetryPolicy,
    ) -> Result<Self, RetryPolicyError> {
        policy.validate()?;
        Ok(Self {
            role,
            runnable: OnceLock::new(),
            init_lock: Mutex::new(()),
            state: AtomicU8::new(UNINITIALIZED),
            admission: Backpressure::new(concurrency_limit),
            policy,
            builds: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    pub fn from_config(role: R, config: &GateConfig) -> Result<Self, RetryPolicyError> {
        Self::new(role, config.max_concurrent_execute, config.retry.to_policy()?)
    }

    pub fn name(&self) -> &str {
        self.role.name()
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn concurrency_limit(&self) -> usize {
        self.admission.max_concurrent()
    }

    pub fn state(&self) -> SlotState {
        SlotState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.runnable.get().is_some()
    }

    pub fn stats(&self) -> SlotStats {
        SlotStats {
            state: self.state(),
            builds: self.builds.load(Ordering::Relaxed),
            executions: self.executions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            admission: self.admission.stats(),
        }
    }

    /// Build the runnable now instead of on the first request.
    pub async fn initialize(&self) -> Result<(), ExecutionError> {
        self.ensure_ready().await.map(|_| ())
    }

    /// Run one request through the role, bounded and retried.
    pub async fn execute(&self, request: &R::Request) -> Result<R::Response, ExecutionError> {
        let runnable = self.ensure_ready().await?;
        let permit = self.admission.acquire().await;
        self.run_admitted(runnable, request, permit).await
    }

    /// Like [`Self::execute`] but fails with [`ExecutionError::Saturated`]
    /// instead of waiting when every slot is taken.
    pub async fn try_execute(&self, request: &R::Request) -> Result<R::Response, ExecutionError> {
        let runnable = self.ensure_ready().await?;
        let Some(permit) = self.admission.try_acquire() else {
            debug!(
                agent = self.role.name(),
                limit = self.admission.max_concurrent(),
                rejected = self.admission.rejected_count(),
                "gate.saturated"
            );
            return Err(ExecutionError::Saturated {
                agent: self.role.name().to_string(),
                limit: self.admission.max_concurrent(),
            });
        };
        self.run_admitted(runnable, request, permit).await
    }

    async fn run_admitted(
        &self,
        runnable: &R::Runnable,
        request: &R::Request,
        permit: BackpressurePermit,
    ) -> Result<R::Response, ExecutionError> {
        self.executions.fetch_add(1, Ordering::Relaxed);

        let result = retry_async(
            &self.policy,
            self.role.name(),
            |err| self.role.classify_error(err),
            move |_attempt| self.attempt(runnable, request),
        )
        .await;

        debug!(
            agent = self.role.name(),
            held_ms = permit.held_duration().as_millis() as u64,
            load_pct = self.admission.load_percentage(),
            ok = result.is_ok(),
            "gate.released"
        );
        drop(permit);

        result.map_err(|failure| {
            self.failures.fetch_add(1, Ordering::Relaxed);
            let agent = self.role.name().to_string();
            match failure.class {
                ErrorClass::Fatal => ExecutionError::Fatal {
                    agent,
                    attempts: failure.attempts,
                    source: failure.error,
                },
                ErrorClass::Transient => ExecutionError::RetriesExhausted {
                    agent,
                    attempts: failure.attempts,
                    source: failure.error,
                },
            }
        })
    }

    async fn attempt(
        &self,
        runnable: &R::Runnable,
        request: &R::Request,
    ) -> anyhow::Result<R::Response> {
        let input = self.role.transform(request)?;
        let raw = self.role.invoke(runnable, input).await?;
        self.role.extract_response(raw)
    }

    async fn ensure_ready(&self) -> Result<&R::Runnable, ExecutionError> {
        if let Some(runnable) = self.runnable.get() {
            return Ok(runnable);
        }

        let _guard = self.init_lock.lock().await;
        if let Some(runnable) = self.runnable.get() {
            return Ok(runnable);
        }

        let reset = StateReset::arm(&self.state);
        self.state.store(INITIALIZING, Ordering::Release);
        info!(agent = self.role.name(), "gate.init");
        let started = Instant::now();

        match self.role.build_runnable().await {
            Ok(built) => {
                let runnable = self.runnable.get_or_init(|| built);
                self.state.store(READY, Ordering::Release);
                reset.disarm();
                self.builds.fetch_add(1, Ordering::Relaxed);
                info!(
                    agent = self.role.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "gate.ready"
                );
                Ok(runnable)
            }
            Err(source) => {
                error!(agent = self.role.name(), error = %format!("{source:#}"), "gate.init_failed");
                Err(ExecutionError::Initialization {
                    agent: self.role.name().to_string(),
                    source,
                })
            }
        }
    }
}

/// Puts the slot back to `Uninitialized` unless the build completed, so a
/// failed or abandoned build leaves it retryable.
struct StateReset<'a> {
    state: &'a AtomicU8,
    armed: bool,
}

impl<'a> StateReset<'a> {
    fn arm(state: &'a AtomicU8) -> Self {
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for StateReset<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.state.store(UNINITIALIZED, Ordering::Release);
        }
    }
}
