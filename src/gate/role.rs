use super::classify::{classify_error, ErrorClass};
use async_trait::async_trait;

/// The pluggable logic behind one gated agent.
///
/// [`super::AgentSlot`] calls `build_runnable` once, then runs
/// `transform`, `invoke` and `extract_response` for every attempt of every
/// request. Errors from any step go through `classify_error`.
#[async_trait]
pub trait AgentRole: Send + Sync + 'static {
    /// Built once and shared read-only by every invocation.
    type Runnable: Send + Sync + 'static;
    type Request: Send + Sync;
    type Input: Send;
    type Raw: Send;
    type Response: Send;

    /// Display name used in logs and errors.
    fn name(&self) -> &str;

    async fn build_runnable(&self) -> anyhow::Result<Self::Runnable>;

    fn transform(&self, request: &Self::Request) -> anyhow::Result<Self::Input>;

    async fn invoke(
        &self,
        runnable: &Self::Runnable,
        input: Self::Input,
    ) -> anyhow::Result<Self::Raw>;

    fn extract_response(&self, raw: Self::Raw) -> anyhow::Result<Self::Response>;

    fn classify_error(&self, error: &anyhow::Error) -> ErrorClass {
        classify_error(error)
    }
}
