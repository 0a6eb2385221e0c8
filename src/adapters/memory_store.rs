//! In-process coordination store.
//!
//! Backs single-instance deployments and every test in the crate. Several
//! gateway "instances" inside one process can share a single
//! `MemoryCoordinationStore` to exercise cross-instance behaviour.
//!
//! Atomicity of `compare_and_swap` comes from `scc::HashMap` entry locking: the
//! bucket holding the key stays locked for the whole compare-then-write.
//!
//! Expired entries are dropped when read, swept every [`PURGE_EVERY_WRITES`]
//! writes, and periodically by [`MemoryCoordinationStore::spawn_sweeper`].
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use futures_util::StreamExt;
use scc::{HashMap, hash_map::Entry};
use tokio::{sync::broadcast, task::JoinHandle};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

use crate::ports::{
    clock::{Clock, SystemClock},
    coordination_store::{CoordinationStore, MessageStream, StoreError, StoreResult},
};

const CHANNEL_CAPACITY: usize = 256;

/// Number of writes between two opportunistic sweeps of expired entries.
pub const PURGE_EVERY_WRITES: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// Coordination store held entirely in process memory with TTL and pub/sub support.
pub struct MemoryCoordinationStore {
    entries: HashMap<String, StoredValue>,
    channels: HashMap<String, broadcast::Sender<String>>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
    writes: AtomicU64,
}

impl Default for MemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCoordinationStore {
    /// Create a store that expires entries against the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires entries against the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            channels: HashMap::new(),
            clock,
            available: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Simulate an outage: while unavailable every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Keys currently holding a live (non-expired) value, sorted.
    pub async fn live_keys(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let mut keys = Vec::new();
        self.entries
            .retain_async(|key, stored| {
                if stored.is_live(now) {
                    keys.push(key.clone());
                    true
                } else {
                    false
                }
            })
            .await;
        keys.sort();
        keys
    }

    /// Number of stored entries, expired or not.
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Drop every expired entry. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed = 0;
        self.entries
            .retain_async(|_, stored| {
                let live = stored.is_live(now);
                if !live {
                    removed += 1;
                }
                live
            })
            .await;
        if removed > 0 {
            tracing::debug!(removed, "Purged expired coordination entries");
        }
        removed
    }

    /// Sweep expired entries every `interval` until `cancel` fires.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.purge_expired().await;
                    }
                }
            }
        })
    }

    async fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_EVERY_WRITES == 0 {
            self.purge_expired().await;
        }
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|ttl| {
            let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            self.clock.now_millis().saturating_add(ttl_ms)
        })
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        match self.channels.entry_async(channel.to_string()).await {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
                entry.insert_entry(tx.clone());
                tx
            }
        }
    }
}

#[async_trait]
impl CoordinationStore for MemoryCoordinationStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.ensure_available()?;
        let now = self.clock.now_millis();
        let Some(entry) = self.entries.get_async(key).await else {
            return Ok(None);
        };
        if entry.get().is_live(now) {
            return Ok(Some(entry.get().value.clone()));
        }
        let _ = entry.remove();
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.ensure_available()?;
        let stored = StoredValue {
            value: value.to_string(),
            expires_at: self.expiry(ttl),
        };
        self.entries.upsert_async(key.to_string(), stored).await;
        self.record_write().await;
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: Option<&str>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = self.clock.now_millis();
        let replacement = new.map(|value| StoredValue {
            value: value.to_string(),
            expires_at: self.expiry(ttl),
        });

        let swapped = match self.entries.entry_async(key.to_string()).await {
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                let current_value = current.is_live(now).then_some(current.value.as_str());
                if current_value != expected {
                    return Ok(false);
                }
                match replacement {
                    Some(stored) => *entry.get_mut() = stored,
                    None => {
                        let _ = entry.remove();
                    }
                }
                true
            }
            Entry::Vacant(entry) => {
                if expected.is_some() {
                    return Ok(false);
                }
                if let Some(stored) = replacement {
                    entry.insert_entry(stored);
                }
                true
            }
        };
        self.record_write().await;
        Ok(swapped)
    }

    async fn publish(&self, channel: &str, message: &str) -> StoreResult<()> {
        self.ensure_available()?;
        let tx = self.sender(channel).await;
        // No receivers is not an error: nobody is listening yet.
        let _ = tx.send(message.to_string());
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> StoreResult<MessageStream> {
        self.ensure_available()?;
        let rx = self.sender(channel).await.subscribe();
        let channel_name = channel.to_string();
        let stream = BroadcastStream::new(rx).filter_map(move |message| {
            let channel_name = channel_name.clone();
            async move {
                match message {
                    Ok(message) => Some(message),
                    Err(e) => {
                        tracing::warn!(channel = %channel_name, "Subscriber lagged: {}", e);
                        None
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ports::clock::ManualClock;

    fn store_with_clock() -> (MemoryCoordinationStore, ManualClock) {
        let clock = ManualClock::new(10_000);
        (
            MemoryCoordinationStore::with_clock(Arc::new(clock.clone())),
            clock,
        )
    }

    #[tokio::test]
    async fn test_set_get_and_ttl_expiry() {
        let (store, clock) = store_with_clock();
        store
            .set("k", "v", Some(Duration::from_secs(2)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::from_millis(1_999));
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_swap_semantics() {
        let (store, _) = store_with_clock();

        assert!(store.compare_and_swap("k", None, Some("a"), None).await.unwrap());
        assert!(!store.compare_and_swap("k", None, Some("b"), None).await.unwrap());
        assert!(!store.compare_and_swap("k", Some("x"), Some("b"), None).await.unwrap());
        assert!(store.compare_and_swap("k", Some("a"), Some("b"), None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("b"));

        assert!(store.compare_and_swap("k", Some("b"), None, None).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.live_keys().await.is_empty());
    }

    #[tokio::test]
    async fn test_expired_value_counts_as_absent_for_cas() {
        let (store, clock) = store_with_clock();
        store
            .set("lease", "holder-a", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(!store.compare_and_swap("lease", None, Some("holder-b"), None).await.unwrap());

        clock.advance(Duration::from_secs(1));
        assert!(store.compare_and_swap("lease", None, Some("holder-b"), None).await.unwrap());
        assert_eq!(store.get("lease").await.unwrap().as_deref(), Some("holder-b"));
    }

    #[tokio::test]
    async fn test_concurrent_cas_single_winner() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let mut handles = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .compare_and_swap("slot", None, Some(&format!("writer-{i}")), None)
                    .await
                    .unwrap()
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_dropped_on_read() {
        let (store, clock) = store_with_clock();
        store.set("k", "v", Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(store.entry_count(), 1);
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_buckets_do_not_accumulate() {
        let (store, clock) = store_with_clock();
        for i in 0..10_000 {
            store
                .set(&format!("ratelimit:p:{i}"), "{}", Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        clock.advance(Duration::from_secs(3_600));
        assert_eq!(store.purge_expired().await, 10_000);
        assert_eq!(store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_writes_trigger_periodic_purge() {
        let (store, clock) = store_with_clock();
        // Exactly PURGE_EVERY_WRITES writes in total: the last one sweeps.
        for i in 0..1_000 {
            store.set(&format!("short:{i}"), "x", Some(Duration::from_secs(1))).await.unwrap();
        }
        clock.advance(Duration::from_secs(2));
        for i in 0..(PURGE_EVERY_WRITES - 1_000) {
            store.set(&format!("long:{i}"), "x", None).await.unwrap();
        }
        assert_eq!(store.entry_count() as u64, PURGE_EVERY_WRITES - 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_purges_in_background() {
        let clock = ManualClock::new(0);
        let store = Arc::new(MemoryCoordinationStore::with_clock(Arc::new(clock.clone())));
        store.set("k", "v", Some(Duration::from_millis(10))).await.unwrap();
        clock.advance(Duration::from_secs(1));

        let cancel = CancellationToken::new();
        let sweeper = store.spawn_sweeper(Duration::from_secs(30), cancel.clone());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(store.entry_count(), 0);
        cancel.cancel();
        sweeper.await.unwrap();
    }

    #[tokio::test]
    async fn test_huge_ttl_saturates() {
        let (store, _) = store_with_clock();
        store.set("k", "v", Some(Duration::MAX)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let store = MemoryCoordinationStore::new();
        let mut stream = store.subscribe("changes").await.unwrap();
        store.publish("changes", "v1").await.unwrap();
        store.publish("changes", "v2").await.unwrap();
        assert_eq!(stream.next().await.as_deref(), Some("v1"));
        assert_eq!(stream.next().await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_every_call() {
        let store = MemoryCoordinationStore::new();
        store.set_available(false);
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.compare_and_swap("k", None, Some("v"), None).await.is_err());

        store.set_available(true);
        assert!(store.get("k").await.unwrap().is_none());
    }
}
