//! Execution gate: single-flight initialisation, bounded concurrency and
//! classified retries around an [`AgentRole`].

pub mod classify;
pub mod retry;
pub mod role;
pub mod slot;

pub use classify::{classify_error, retry_after_hint, ErrorClass, PermanentFailure};
pub use retry::{retry_async, RetryFailure, RetryPolicy, RetryPolicyError};
pub use role::AgentRole;
pub use slot::{AgentSlot, ExecutionError, SlotState, SlotStats};
