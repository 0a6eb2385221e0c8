//! Redis-backed coordination store for multi-instance deployments.
//!
//! Compare-and-swap runs as a single Lua script on the server, so concurrent
//! gateway instances can never both observe and overwrite the same value.
//! Every key and channel is namespaced by a configurable prefix.
//!
//! The connection is opened on first use. Until the server answers, every call
//! fails with [`StoreError::Unavailable`] (or the caller's timeout) and the next
//! call tries again.
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{AsyncCommands, Client, RedisError, Script, aio::ConnectionManager};
use tokio::sync::OnceCell;

use crate::ports::coordination_store::{
    CoordinationStore, MessageStream, StoreError, StoreResult,
};

// ARGV: [1] expect-present flag, [2] expected value, [3] write flag, [4] new value, [5] ttl ms
const CAS_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '0' then
    if current then
        return 0
    end
elseif current ~= ARGV[2] then
    return 0
end
if ARGV[3] == '0' then
    redis.call('DEL', KEYS[1])
elseif tonumber(ARGV[5]) > 0 then
    redis.call('SET', KEYS[1], ARGV[4], 'PX', ARGV[5])
else
    redis.call('SET', KEYS[1], ARGV[4])
end
return 1
";

impl From<RedisError> for StoreError {
    fn from(e: RedisError) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Coordination store adapter over a Redis server.
pub struct RedisCoordinationStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    key_prefix: String,
    cas_script: Script,
}

impl RedisCoordinationStore {
    /// Create a store for the server at `url`; all keys are written under
    /// `key_prefix`. Only the URL is checked here, no connection is made.
    pub fn new(url: &str, key_prefix: impl Into<String>) -> StoreResult<Self> {
        let client = Client::open(url)?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            key_prefix: key_prefix.into(),
            cas_script: Script::new(CAS_SCRIPT),
        })
    }

    /// Shared multiplexed connection, opened on first use.
    ///
    /// A failed or cancelled attempt leaves the cell empty for the next caller.
    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let connection = self.client.get_connection_manager().await?;
                tracing::info!(key_prefix = %self.key_prefix, "Connected to Redis coordination store");
                Ok::<_, RedisError>(connection)
            })
            .await?;
        Ok(connection.clone())
    }

    fn namespaced(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = conn.get(self.namespaced(key)).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.namespaced(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let ttl_ms = ttl.map(|ttl| ttl.as_millis().max(1) as u64).unwrap_or(0);
        let swapped: i64 = self
            .cas_script
            .key(self.namespaced(key))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(expected.unwrap_or(""))
            .arg(if new.is_some() { "1" } else { "0" })
            .arg(new.unwrap_or(""))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _receivers: i64 = conn.publish(self.namespaced(channel), message).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        let channel_name = self.namespaced(channel);
        pubsub.subscribe(&channel_name).await?;
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let channel_name = channel_name.clone();
            async move {
                match msg.get_payload::<String>() {
                    Ok(payload) => Some(payload),
                    Err(e) => {
                        tracing::warn!(channel = %channel_name, "Dropping undecodable message: {}", e);
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}
