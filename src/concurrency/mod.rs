//! Concurrency primitives shared by the execution gate.

pub mod backpressure;

pub use backpressure::{Backpressure, BackpressurePermit, BackpressureStats};

/// Concurrent executions allowed per agent slot when nothing is configured.
pub const DEFAULT_MAX_CONCURRENT_EXECUTE: usize = 4;
