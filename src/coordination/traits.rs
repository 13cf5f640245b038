use async_trait::async_trait;
use std::time::Duration;

/// Failure talking to the coordination store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("coordination store unavailable: {0}")]
    Unavailable(String),
    #[error("coordination store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Shared key-value store with expiring entries, used for cross-process
/// signalling between the scheduler and delivery workers.
///
/// Every operation is individually atomic. Expired entries behave exactly
/// like absent ones.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Backend name
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Insert or overwrite `key`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
        -> Result<(), StoreError>;

    /// Remove `key`. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Write `value` under `key` and return what it replaced, as one step.
    ///
    /// Default implementation is a read followed by a write and is not atomic.
    async fn get_and_set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<Option<String>, StoreError> {
        let previous = self.get(key).await?;
        self.set_with_ttl(key, value, ttl).await?;
        Ok(previous)
    }

    /// Overwrite `key` with `value`, keeping any later expiry it already has.
    ///
    /// The entry lives for at least `min_ttl`, and never shorter than the live
    /// entry it replaces. The default cannot see remaining TTLs and simply
    /// writes with `min_ttl`.
    async fn set_extending_ttl(
        &self,
        key: &str,
        value: &str,
        min_ttl: Duration,
    ) -> Result<(), StoreError> {
        self.set_with_ttl(key, value, min_ttl).await
    }

    /// Remove `key` only while it still holds `expected`.
    ///
    /// The default is a read followed by a delete and is not atomic; backends
    /// with a compare-and-delete primitive should override it.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        match self.get(key).await? {
            Some(current) if current == expected => self.delete(key).await,
            _ => Ok(false),
        }
    }
}
