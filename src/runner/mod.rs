//! Delayed task execution with best-effort revocation.

pub mod local;
pub mod traits;

pub use local::{LocalTaskRunner, RunnerStats};
pub use traits::{
    DelayedTaskRunner, RunnerError, TaskContext, TaskDescriptor, TaskHandler, TaskId, TaskOutcome,
};
