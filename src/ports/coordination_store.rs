use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use thiserror::Error;

/// Errors surfaced by a coordination store backend.
///
/// Every variant means "the store could not answer", never "the answer is no".
/// Callers translate these into fail-closed decisions.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum StoreError {
    /// The backend could not be reached or rejected the command
    #[error("Coordination store unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured bound
    #[error("Coordination store call timed out after {0:?}")]
    Timeout(Duration),

    /// A stored value could not be encoded or decoded
    #[error("Coordination store payload error: {0}")]
    Serialization(String),

    /// Compare-and-swap kept losing to concurrent writers
    #[error("Gave up on '{key}' after {attempts} contended compare-and-swap attempts")]
    Contention { key: String, attempts: u32 },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type alias for coordination store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Stream of messages received on a subscribed channel.
pub type MessageStream = BoxStream<'static, String>;

/// CoordinationStore defines the port for the shared key/value + pub/sub service
/// every gateway instance uses for cross-instance state.
///
/// Implementations must make [`CoordinationStore::compare_and_swap`] atomic with
/// respect to every other writer of the same key, across processes. All other
/// guarantees of the control plane (no over-admission, lock mutual exclusion)
/// are built on that single primitive.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Read the current value of `key`, if present and not expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Unconditionally write `value` under `key`, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Atomically replace the value of `key` if it currently equals `expected`.
    ///
    /// * `expected = None` means "key must be absent (or expired)".
    /// * `new = None` deletes the key on success.
    /// * `ttl` applies to the newly written value.
    ///
    /// Returns `true` when the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Publish a message to every current subscriber of `channel`.
    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()>;

    /// Subscribe to `channel`. Messages published after this call returns are delivered.
    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream>;
}

/// Run a store call with an upper bound on its duration.
///
/// Exhausting the bound surfaces [`StoreError::Timeout`] so that callers never hang on
/// a degraded backend.
pub async fn bounded<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: std::future::Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}
