#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss
)]

//! Chat backend core: debounced delayed delivery of outbound replies and a
//! concurrency-gated, retrying execution core for LLM-backed agent roles.

pub mod agents;
pub mod concurrency;
pub mod config;
pub mod coordination;
pub mod delivery;
pub mod gate;
pub mod observability;
pub mod providers;
pub mod runner;

pub use config::Config;
pub use delivery::{DebounceScheduler, DeliveryError, DeliveryTask, Transport};
pub use gate::{AgentRole, AgentSlot, ErrorClass, ExecutionError, RetryPolicy};
