//! Distributed locks with leases.
//!
//! Modes form a closed set ([`LockMode`]) that differ only in how they use the
//! coordination store:
//!
//! * `Exclusive`, `Write`: the sole holder of `lock:{resource}`.
//! * `Fair`: waiters join a FIFO queue at `lock:{resource}:queue`; only the head
//!   of the queue may attempt the grant.
//! * `Read`: one of any number of readers of `lock:{resource}`.
//! * `Multi`: sole holder of every key in a sorted, de-duplicated set, taken
//!   all or nothing.
//!
//! All modes share one document per resource, so a reader and an exclusive
//! holder of the same resource exclude each other.
//!
//! Every entry carries a per-acquisition token. Release and renewal compare the
//! token before touching the entry, so a holder whose lease ran out can never
//! remove its successor's lock.
use std::{future::Future, sync::Arc, time::Duration};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use uuid::Uuid;

use crate::{
    metrics,
    ports::{
        clock::Clock,
        coordination_store::{CoordinationStore, StoreError, StoreResult, bounded},
    },
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum LockError {
    /// The lock was not acquired within the wait timeout
    #[error("Timed out after {waited:?} waiting for lock on '{resource}'")]
    Timeout { resource: String, waited: Duration },

    /// The caller's lease expired or the lock was taken over
    #[error("Lock on '{resource}' is not held by this handle")]
    NotHolder { resource: String },

    #[error("Lock service unavailable: {0}")]
    Unavailable(#[from] StoreError),

    #[error("Invalid lock request: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Exclusive,
    Fair,
    Read,
    Write,
    Multi,
}

impl LockMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::Exclusive => "exclusive",
            LockMode::Fair => "fair",
            LockMode::Read => "read",
            LockMode::Write => "write",
            LockMode::Multi => "multi",
        }
    }
}

/// Stored form of one holder's grant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockEntry {
    pub holder: String,
    pub token: String,
    pub mode: LockMode,
    pub acquired_at_ms: u64,
    pub lease_expiry_ms: u64,
}

/// Proof of a held lock. Consumed by [`DistributedLock::release`].
#[derive(Debug)]
pub struct LockHandle {
    resources: Vec<String>,
    mode: LockMode,
    holder: String,
    token: String,
    acquired_at_ms: u64,
    lease_expiry_ms: u64,
}

impl LockHandle {
    /// The (first) locked resource.
    pub fn resource(&self) -> &str {
        self.resources.first().map(String::as_str).unwrap_or_default()
    }

    pub fn resources(&self) -> &[String] {
        &self.resources
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Unique per acquisition; usable as a fencing token by downstream writers.
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn acquired_at_ms(&self) -> u64 {
        self.acquired_at_ms
    }

    pub fn lease_expiry_ms(&self) -> u64 {
        self.lease_expiry_ms
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// Base delay between acquisition attempts; up to half again is added as jitter.
    pub poll_interval: Duration,
    pub op_timeout: Duration,
    pub max_cas_attempts: u32,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            op_timeout: Duration::from_secs(1),
            max_cas_attempts: 16,
        }
    }
}

/// Stored state of one resource: a sole holder or a set of readers.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LockState {
    #[serde(default)]
    holder: Option<LockEntry>,
    #[serde(default)]
    readers: Vec<LockEntry>,
}

impl LockState {
    fn prune(&mut self, now_ms: u64) {
        self.readers.retain(|r| r.lease_expiry_ms > now_ms);
        if self.holder.as_ref().is_some_and(|h| h.lease_expiry_ms <= now_ms) {
            self.holder = None;
        }
    }

    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.holder.is_none()
    }

    fn entry_mut(&mut self, token: &str) -> Option<&mut LockEntry> {
        if let Some(holder) = self.holder.as_mut().filter(|h| h.token == token) {
            return Some(holder);
        }
        self.readers.iter_mut().find(|r| r.token == token)
    }

    fn remove(&mut self, token: &str) -> bool {
        if self.holder.as_ref().is_some_and(|h| h.token == token) {
            self.holder = None;
            return true;
        }
        let before = self.readers.len();
        self.readers.retain(|r| r.token != token);
        self.readers.len() != before
    }

    /// Keep the key alive as long as its longest lease.
    fn ttl(&self, now_ms: u64) -> Duration {
        let latest = self
            .readers
            .iter()
            .chain(self.holder.iter())
            .map(|e| e.lease_expiry_ms)
            .max()
            .unwrap_or(now_ms);
        Duration::from_millis(latest.saturating_sub(now_ms).max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Waiter {
    token: String,
    deadline_ms: u64,
}

fn lock_key(resource: &str) -> String {
    format!("lock:{resource}")
}

fn queue_key(resource: &str) -> String {
    format!("lock:{resource}:queue")
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Read-modify-CAS on a fair-lock queue. An emptied queue is deleted.
async fn update_queue<F>(
    store: &dyn CoordinationStore,
    key: &str,
    settings: &LockSettings,
    ttl: Duration,
    mut mutate: F,
) -> StoreResult<()>
where
    F: FnMut(&mut Vec<Waiter>),
{
    for _ in 0..settings.max_cas_attempts {
        let raw = bounded(settings.op_timeout, store.get(key)).await?;
        let mut queue: Vec<Waiter> = match raw.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };
        mutate(&mut queue);
        let encoded = if queue.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&queue)?)
        };
        if raw.is_none() && encoded.is_none() {
            return Ok(());
        }
        let swapped = bounded(
            settings.op_timeout,
            store.compare_and_swap(key, raw.as_deref(), encoded.as_deref(), Some(ttl)),
        )
        .await?;
        if swapped {
            return Ok(());
        }
    }
    Err(StoreError::Contention {
        key: key.to_string(),
        attempts: settings.max_cas_attempts,
    })
}

/// Removes an abandoned waiter from its queue if the acquiring future is dropped.
struct QueueGuard {
    store: Arc<dyn CoordinationStore>,
    key: String,
    token: String,
    settings: LockSettings,
    ttl: Duration,
    armed: bool,
}

impl QueueGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for QueueGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        let settings = self.settings;
        let ttl = self.ttl;
        runtime.spawn(async move {
            let result = update_queue(store.as_ref(), &key, &settings, ttl, |queue| {
                queue.retain(|w| w.token != token)
            })
            .await;
            if let Err(e) = result {
                tracing::warn!(queue = %key, "Failed to remove cancelled waiter: {}", e);
            }
        });
    }
}

/// Lease-based distributed lock service for one holder identity.
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    holder: String,
    settings: LockSettings,
}

impl DistributedLock {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        holder: impl Into<String>,
        settings: LockSettings,
    ) -> Self {
        Self {
            store,
            clock,
            holder: holder.into(),
            settings,
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Acquire `resource` in `mode`, waiting at most `wait`.
    ///
    /// The lock is released automatically once `lease` elapses without renewal.
    /// `LockMode::Multi` on a single resource behaves like [`Self::acquire_multi`]
    /// with one key.
    pub async fn acquire(
        &self,
        resource: &str,
        mode: LockMode,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        let result = match mode {
            LockMode::Multi => return self.acquire_multi(&[resource], wait, lease).await,
            _ => self.acquire_single(resource, mode, wait, lease).await,
        };
        record_outcome(mode, &result);
        result
    }

    async fn acquire_single(
        &self,
        resource: &str,
        mode: LockMode,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        validate(resource, lease)?;
        let token = Uuid::new_v4().to_string();
        let entry = match mode {
            LockMode::Fair => self.acquire_fair(resource, &token, wait, lease).await?,
            LockMode::Exclusive | LockMode::Read | LockMode::Write => {
                self.poll(resource, wait, || self.try_grant(resource, &token, mode, lease))
                    .await?
            }
            LockMode::Multi => {
                return Err(LockError::InvalidRequest("multi locks use acquire_multi".into()));
            }
        };
        tracing::debug!(resource, mode = mode.as_str(), holder = %self.holder, "Lock acquired");
        Ok(LockHandle {
            resources: vec![resource.to_string()],
            mode,
            holder: self.holder.clone(),
            token,
            acquired_at_ms: entry.acquired_at_ms,
            lease_expiry_ms: entry.lease_expiry_ms,
        })
    }

    /// Acquire every resource in `resources` as one unit, or none of them.
    ///
    /// Keys are taken in sorted order so that overlapping multi-locks cannot
    /// deadlock each other.
    pub async fn acquire_multi<S: AsRef<str>>(
        &self,
        resources: &[S],
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        let result = self.acquire_multi_inner(resources, wait, lease).await;
        record_outcome(LockMode::Multi, &result);
        result
    }

    async fn acquire_multi_inner<S: AsRef<str>>(
        &self,
        resources: &[S],
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        let mut keys: Vec<String> = resources.iter().map(|r| r.as_ref().to_string()).collect();
        keys.sort();
        keys.dedup();
        if keys.is_empty() {
            return Err(LockError::InvalidRequest("multi lock needs at least one resource".into()));
        }
        for key in &keys {
            validate(key, lease)?;
        }

        let token = Uuid::new_v4().to_string();
        let label = keys.join(",");
        let entries = self
            .poll(&label, wait, || self.try_multi(&keys, &token, lease))
            .await?;
        let acquired_at_ms = entries.iter().map(|e| e.acquired_at_ms).min().unwrap_or_default();
        let lease_expiry_ms = entries.iter().map(|e| e.lease_expiry_ms).min().unwrap_or_default();
        tracing::debug!(resources = %label, holder = %self.holder, "Multi lock acquired");
        Ok(LockHandle {
            resources: keys,
            mode: LockMode::Multi,
            holder: self.holder.clone(),
            token,
            acquired_at_ms,
            lease_expiry_ms,
        })
    }

    /// Release a held lock. `NotHolder` means the lease had already lapsed; the
    /// current holder's entry is left untouched.
    pub async fn release(&self, handle: LockHandle) -> Result<(), LockError> {
        match handle.mode {
            LockMode::Multi => {
                let mut outcome = Ok(());
                for resource in &handle.resources {
                    if let Err(e) = self.release_grant(resource, &handle.token).await {
                        tracing::warn!(resource = %resource, "Multi lock release incomplete: {}", e);
                        if outcome.is_ok() {
                            outcome = Err(e);
                        }
                    }
                }
                outcome
            }
            _ => self.release_grant(handle.resource(), &handle.token).await,
        }
    }

    /// Extend a held lock's lease to `lease` from now.
    pub async fn renew(&self, handle: &mut LockHandle, lease: Duration) -> Result<(), LockError> {
        validate(handle.resource(), lease)?;
        let mut expiry = u64::MAX;
        for resource in &handle.resources {
            let renewed = self.renew_grant(resource, &handle.token, lease).await?;
            expiry = expiry.min(renewed);
        }
        handle.lease_expiry_ms = expiry;
        Ok(())
    }

    /// Run `f` while holding the lock, releasing it afterwards.
    ///
    /// A lease that lapsed while `f` ran is logged; `f`'s output is still returned.
    pub async fn with_lock<F, Fut, T>(
        &self,
        resource: &str,
        mode: LockMode,
        wait: Duration,
        lease: Duration,
        f: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let handle = self.acquire(resource, mode, wait, lease).await?;
        let value = f().await;
        if let Err(e) = self.release(handle).await {
            tracing::warn!(resource, "Lock lost before release: {}", e);
        }
        Ok(value)
    }

    async fn poll<T, F, Fut>(&self, resource: &str, wait: Duration, mut attempt: F) -> Result<T, LockError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<Option<T>>>,
    {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(acquired) = attempt().await? {
                return Ok(acquired);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    resource: resource.to_string(),
                    waited: wait,
                });
            }
            tokio::time::sleep(self.jittered_pause().min(deadline - now)).await;
        }
    }

    fn jittered_pause(&self) -> Duration {
        let base = millis(self.settings.poll_interval).max(1);
        Duration::from_millis(base + rand::rng().random_range(0..=base / 2))
    }

    fn new_entry(&self, token: &str, mode: LockMode, lease: Duration) -> LockEntry {
        let now = self.clock.now_millis();
        LockEntry {
            holder: self.holder.clone(),
            token: token.to_string(),
            mode,
            acquired_at_ms: now,
            lease_expiry_ms: now.saturating_add(millis(lease)),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        bounded(self.settings.op_timeout, self.store.get(key)).await
    }

    async fn cas(&self, key: &str, expected: Option<&str>, new: Option<&str>, ttl: Option<Duration>) -> StoreResult<bool> {
        bounded(
            self.settings.op_timeout,
            self.store.compare_and_swap(key, expected, new, ttl),
        )
        .await
    }

    /// One attempt at a grant on `resource`. Lapsed entries are pruned first.
    ///
    /// Readers share the resource with each other; every other mode needs it
    /// free of both a holder and live readers.
    async fn try_grant(
        &self,
        resource: &str,
        token: &str,
        mode: LockMode,
        lease: Duration,
    ) -> StoreResult<Option<LockEntry>> {
        let key = lock_key(resource);
        for _ in 0..self.settings.max_cas_attempts {
            let raw = self.get(&key).await?;
            let mut state: LockState = match raw.as_deref() {
                Some(raw) => serde_json::from_str(raw)?,
                None => LockState::default(),
            };
            let now = self.clock.now_millis();
            state.prune(now);

            let grantable = match mode {
                LockMode::Read => state.holder.is_none(),
                _ => state.is_empty(),
            };
            if !grantable {
                return Ok(None);
            }

            let entry = self.new_entry(token, mode, lease);
            if mode == LockMode::Read {
                state.readers.push(entry.clone());
            } else {
                state.holder = Some(entry.clone());
            }
            let encoded = serde_json::to_string(&state)?;
            if self
                .cas(&key, raw.as_deref(), Some(&encoded), Some(state.ttl(now)))
                .await?
            {
                return Ok(Some(entry));
            }
        }
        Err(StoreError::Contention { key, attempts: self.settings.max_cas_attempts })
    }

    async fn release_grant(&self, resource: &str, token: &str) -> Result<(), LockError> {
        let key = lock_key(resource);
        for _ in 0..self.settings.max_cas_attempts {
            let Some(raw) = self.get(&key).await? else {
                return Err(LockError::NotHolder { resource: resource.to_string() });
            };
            let mut state: LockState = serde_json::from_str(&raw).map_err(StoreError::from)?;
            let now = self.clock.now_millis();
            state.prune(now);
            if !state.remove(token) {
                return Err(LockError::NotHolder { resource: resource.to_string() });
            }
            let swapped = if state.is_empty() {
                self.cas(&key, Some(&raw), None, None).await?
            } else {
                let encoded = serde_json::to_string(&state).map_err(StoreError::from)?;
                self.cas(&key, Some(&raw), Some(&encoded), Some(state.ttl(now))).await?
            };
            if swapped {
                tracing::debug!(resource, holder = %self.holder, "Lock released");
                return Ok(());
            }
        }
        Err(StoreError::Contention { key, attempts: self.settings.max_cas_attempts }.into())
    }

    async fn renew_grant(&self, resource: &str, token: &str, lease: Duration) -> Result<u64, LockError> {
        let key = lock_key(resource);
        for _ in 0..self.settings.max_cas_attempts {
            let Some(raw) = self.get(&key).await? else {
                return Err(LockError::NotHolder { resource: resource.to_string() });
            };
            let mut state: LockState = serde_json::from_str(&raw).map_err(StoreError::from)?;
            let now = self.clock.now_millis();
            state.prune(now);
            let expiry = now.saturating_add(millis(lease));
            match state.entry_mut(token) {
                Some(entry) => entry.lease_expiry_ms = expiry,
                None => return Err(LockError::NotHolder { resource: resource.to_string() }),
            }
            let encoded = serde_json::to_string(&state).map_err(StoreError::from)?;
            if self.cas(&key, Some(&raw), Some(&encoded), Some(state.ttl(now))).await? {
                return Ok(expiry);
            }
        }
        Err(StoreError::Contention { key, attempts: self.settings.max_cas_attempts }.into())
    }

    async fn try_multi(&self, resources: &[String], token: &str, lease: Duration) -> StoreResult<Option<Vec<LockEntry>>> {
        let mut taken: Vec<(&str, LockEntry)> = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.try_grant(resource, token, LockMode::Multi, lease).await {
                Ok(Some(entry)) => taken.push((resource, entry)),
                Ok(None) => {
                    self.roll_back(&taken, token).await;
                    return Ok(None);
                }
                Err(e) => {
                    self.roll_back(&taken, token).await;
                    return Err(e);
                }
            }
        }
        Ok(Some(taken.into_iter().map(|(_, entry)| entry).collect()))
    }

    async fn roll_back(&self, taken: &[(&str, LockEntry)], token: &str) {
        for (resource, _) in taken {
            if let Err(e) = self.release_grant(resource, token).await {
                tracing::warn!(resource = %resource, "Failed to roll back partial multi lock: {}", e);
            }
        }
    }


    async fn acquire_fair(
        &self,
        resource: &str,
        token: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockEntry, LockError> {
        let queue = queue_key(resource);
        let queue_ttl = wait + lease + self.settings.poll_interval * 4;
        let deadline_ms = self
            .clock
            .now_millis()
            .saturating_add(millis(wait + self.settings.poll_interval * 4));
        let waiter = Waiter {
            token: token.to_string(),
            deadline_ms,
        };

        update_queue(self.store.as_ref(), &queue, &self.settings, queue_ttl, |q| {
            q.push(waiter.clone())
        })
        .await?;
        let mut guard = QueueGuard {
            store: self.store.clone(),
            key: queue.clone(),
            token: token.to_string(),
            settings: self.settings,
            ttl: queue_ttl,
            armed: true,
        };

        let result = self
            .poll(resource, wait, || self.try_fair(resource, &queue, &waiter, queue_ttl, lease))
            .await;

        let dequeued = update_queue(self.store.as_ref(), &queue, &self.settings, queue_ttl, |q| {
            q.retain(|w| w.token != token)
        })
        .await;
        guard.disarm();
        if let Err(e) = dequeued {
            tracing::warn!(queue = %queue, "Failed to leave fair lock queue: {}", e);
        }
        result
    }

    async fn try_fair(
        &self,
        resource: &str,
        queue: &str,
        waiter: &Waiter,
        queue_ttl: Duration,
        lease: Duration,
    ) -> StoreResult<Option<LockEntry>> {
        let raw = self.get(queue).await?;
        let mut waiters: Vec<Waiter> = match raw.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Vec::new(),
        };

        let now = self.clock.now_millis();
        let before = waiters.len();
        waiters.retain(|w| w.deadline_ms > now || w.token == waiter.token);
        if waiters.len() != before {
            // Abandoned waiters; a lost race here is retried on the next poll.
            let encoded = serde_json::to_string(&waiters)?;
            self.cas(queue, raw.as_deref(), Some(&encoded), Some(queue_ttl)).await?;
        }

        match waiters.first() {
            Some(head) if head.token == waiter.token => {
                self.try_grant(resource, &waiter.token, LockMode::Fair, lease).await
            }
            _ if !waiters.iter().any(|w| w.token == waiter.token) => {
                update_queue(self.store.as_ref(), queue, &self.settings, queue_ttl, |q| {
                    if !q.iter().any(|w| w.token == waiter.token) {
                        q.push(waiter.clone());
                    }
                })
                .await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }
}

fn validate(resource: &str, lease: Duration) -> Result<(), LockError> {
    if resource.trim().is_empty() {
        return Err(LockError::InvalidRequest("resource key must not be empty".into()));
    }
    if lease.is_zero() {
        return Err(LockError::InvalidRequest("lease must be greater than 0".into()));
    }
    Ok(())
}

fn record_outcome(mode: LockMode, result: &Result<LockHandle, LockError>) {
    let outcome = match result {
        Ok(_) => "acquired",
        Err(LockError::Timeout { .. }) => "timeout",
        Err(LockError::Unavailable(e)) => {
            tracing::error!(mode = mode.as_str(), "Lock acquisition failed: {}", e);
            "unavailable"
        }
        Err(_) => "invalid",
    };
    metrics::increment_lock_acquisition(mode.as_str(), outcome);
}
