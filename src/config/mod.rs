pub mod schema;

pub use schema::{
    Config, DeliveryConfig, GateConfig, LlmConfig, ObservabilityConfig, RetryConfig, StoreConfig,
};
