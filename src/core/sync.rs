//! Versioned documents shared through the coordination store.
//!
//! Route tables, the admission policy and rate-limit templates are each stored
//! as one JSON document under a single key. Writers modify a document with a
//! read-modify-CAS cycle and announce the new version on a change channel;
//! every instance follows the channel and rebuilds its local immutable
//! snapshot when a newer version appears.
use std::{marker::PhantomData, sync::Arc, time::Duration};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ports::coordination_store::{
    CoordinationStore, MessageStream, StoreError, StoreResult, bounded,
};

/// A document payload together with its monotonically increasing version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Versioned<T> {
    pub version: u64,
    pub data: T,
}

/// Backoff settings used while establishing the initial sync.
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

/// Handle to one shared document in the coordination store.
pub struct SharedDocument<T> {
    store: Arc<dyn CoordinationStore>,
    key: String,
    channel: String,
    op_timeout: Duration,
    max_cas_attempts: u32,
    _payload: PhantomData<fn() -> T>,
}

impl<T> SharedDocument<T>
where
    T: Serialize + DeserializeOwned + Default + Send + 'static,
{
    pub fn new(store: Arc<dyn CoordinationStore>, name: &str, op_timeout: Duration) -> Self {
        Self {
            store,
            key: format!("doc:{name}"),
            channel: format!("doc:{name}:changed"),
            op_timeout,
            max_cas_attempts: 16,
            _payload: PhantomData,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the current document, `None` when nothing has been written yet.
    pub async fn load(&self) -> StoreResult<Option<Versioned<T>>> {
        let raw = bounded(self.op_timeout, self.store.get(&self.key)).await?;
        raw.map(|raw| serde_json::from_str(&raw).map_err(StoreError::from))
            .transpose()
    }

    /// Apply `mutate` to the latest document and write it back atomically.
    ///
    /// `mutate` may run several times if other writers race us; it must be a pure
    /// function of its input. Returns the version that was written.
    pub async fn update<F, E>(&self, mut mutate: F) -> Result<Versioned<T>, E>
    where
        F: FnMut(&mut T) -> Result<(), E>,
        E: From<StoreError>,
    {
        for _ in 0..self.max_cas_attempts {
            let raw = bounded(self.op_timeout, self.store.get(&self.key)).await?;
            let mut doc = match raw.as_deref() {
                Some(raw) => serde_json::from_str::<Versioned<T>>(raw).map_err(StoreError::from)?,
                None => Versioned {
                    version: 0,
                    data: T::default(),
                },
            };

            mutate(&mut doc.data)?;
            doc.version += 1;
            let encoded = serde_json::to_string(&doc).map_err(StoreError::from)?;

            let swapped = bounded(
                self.op_timeout,
                self.store
                    .compare_and_swap(&self.key, raw.as_deref(), Some(&encoded), None),
            )
            .await?;
            if swapped {
                self.announce(doc.version).await;
                return Ok(doc);
            }
            tracing::debug!(key = %self.key, "Concurrent document update detected, retrying");
        }

        Err(StoreError::Contention {
            key: self.key.clone(),
            attempts: self.max_cas_attempts,
        }
        .into())
    }

    /// Write `data` as version 1 unless a document already exists.
    pub async fn seed_if_absent(&self, data: T) -> StoreResult<bool> {
        let doc = Versioned { version: 1, data };
        let encoded = serde_json::to_string(&doc)?;
        let seeded = bounded(
            self.op_timeout,
            self.store
                .compare_and_swap(&self.key, None, Some(&encoded), None),
        )
        .await?;
        if seeded {
            self.announce(doc.version).await;
        }
        Ok(seeded)
    }

    pub async fn subscribe(&self) -> StoreResult<MessageStream> {
        bounded(self.op_timeout, self.store.subscribe(&self.channel)).await
    }

    // The write already succeeded; a lost notification only delays other instances
    // until the next change.
    async fn announce(&self, version: u64) {
        let result = bounded(
            self.op_timeout,
            self.store.publish(&self.channel, &version.to_string()),
        )
        .await;
        if let Err(e) = result {
            tracing::warn!(key = %self.key, version, "Failed to publish change notification: {}", e);
        }
    }
}

/// Follow a shared document: load it, then reload on every change notification.
///
/// Subscribe and load are retried with exponential backoff capped at
/// `settings.max_backoff`. After `settings.max_attempts` consecutive failures the
/// follower logs an error and keeps retrying at the cap; the consumer keeps its
/// last (possibly empty) state meanwhile. A closed change stream is
/// re-subscribed and the document reloaded, so no change is missed for good.
pub fn spawn_follower<T, F>(
    doc: Arc<SharedDocument<T>>,
    settings: SyncSettings,
    cancel: CancellationToken,
    apply: F,
) -> JoinHandle<()>
where
    T: Serialize + DeserializeOwned + Default + Send + Sync + 'static,
    F: Fn(Versioned<T>) + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut retry = Backoff::new(settings);

        loop {
            let mut stream = match doc.subscribe().await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(key = %doc.key(), attempt = retry.failures + 1, "Subscribe failed: {}", e);
                    if !retry.wait(doc.key(), &cancel).await {
                        return;
                    }
                    continue;
                }
            };
            match doc.load().await {
                Ok(Some(versioned)) => apply(versioned),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(key = %doc.key(), attempt = retry.failures + 1, "Load failed: {}", e);
                    if !retry.wait(doc.key(), &cancel).await {
                        return;
                    }
                    continue;
                }
            }
            if retry.failures > 0 {
                tracing::info!(key = %doc.key(), failures = retry.failures, "Document sync recovered");
            }
            retry.reset();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    message = stream.next() => match message {
                        Some(version) => {
                            tracing::debug!(key = %doc.key(), %version, "Change notification received");
                            match doc.load().await {
                                Ok(Some(versioned)) => apply(versioned),
                                Ok(None) => {}
                                Err(e) => tracing::error!(key = %doc.key(), "Reload failed: {}", e),
                            }
                        }
                        None => {
                            tracing::warn!(key = %doc.key(), "Change channel closed, re-subscribing");
                            break;
                        }
                    }
                }
            }

            if !retry.wait(doc.key(), &cancel).await {
                return;
            }
        }
    })
}

struct Backoff {
    settings: SyncSettings,
    next: Duration,
    failures: u32,
}

impl Backoff {
    fn new(settings: SyncSettings) -> Self {
        Self {
            settings,
            next: settings.initial_backoff,
            failures: 0,
        }
    }

    fn reset(&mut self) {
        self.next = self.settings.initial_backoff;
        self.failures = 0;
    }

    /// Sleep for the next delay. Returns `false` if cancelled meanwhile.
    async fn wait(&mut self, key: &str, cancel: &CancellationToken) -> bool {
        self.failures = self.failures.saturating_add(1);
        if self.failures == self.settings.max_attempts.max(1) {
            tracing::error!(
                key,
                attempts = self.failures,
                retry_every = ?self.settings.max_backoff,
                "Document sync still failing; serving last known state and retrying"
            );
            self.next = self.settings.max_backoff;
        }
        let delay = self.next;
        self.next = self.next.saturating_mul(2).min(self.settings.max_backoff);
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
