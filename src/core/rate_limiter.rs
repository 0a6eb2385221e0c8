//! Distributed token-bucket rate limiting.
//!
//! Bucket state lives in the coordination store so every gateway instance
//! enforcing the same key draws from one budget. Each acquisition is a
//! read-refill-CAS cycle: two instances can both read a bucket with capacity,
//! but only one of their compare-and-swap writes lands, and the loser re-reads
//! the decremented state. Refill is lazy; there is no background timer.
use std::{net::IpAddr, sync::Arc, time::Duration};

use http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::{MissingKeyPolicy, duration_serde},
    metrics,
    ports::{
        clock::Clock,
        coordination_store::{CoordinationStore, StoreError, bounded},
    },
};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RateLimitError {
    /// Budget exhausted; the caller should retry after the hinted delay
    #[error("Rate limit exceeded for '{key}', retry after {retry_after_secs}s")]
    LimitExceeded { key: String, retry_after_secs: u64 },

    /// The shared bucket state could not be read or written
    #[error("Rate limiter unavailable: {0}")]
    Unavailable(#[from] StoreError),

    #[error("Invalid rate limit request: {0}")]
    InvalidRequest(String),
}

/// Whether a bucket is shared by the fleet or private to each caller.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BucketScope {
    #[default]
    Global,
    PerClient,
}

/// What identifies a bucket within a policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitKey {
    /// One bucket per route
    #[default]
    Route,
    /// One bucket per resolved client address
    ClientAddress,
    /// One bucket per value of a request header
    Header { name: String },
    /// One bucket per (client address, route) pair
    ClientRoute,
}

impl RateLimitKey {
    /// Derive the bucket key for a request. `None` when the key material is missing.
    pub fn extract(&self, route_id: &str, client: Option<IpAddr>, headers: &HeaderMap) -> Option<String> {
        match self {
            RateLimitKey::Route => Some(route_id.to_string()),
            RateLimitKey::ClientAddress => client.map(|ip| ip.to_string()),
            RateLimitKey::Header { name } => headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            RateLimitKey::ClientRoute => client.map(|ip| format!("{ip}|{route_id}")),
        }
    }
}

/// Token-bucket template: capacity `capacity`, refilled by `refill_tokens` per `window`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketPolicy {
    pub capacity: u64,
    pub refill_tokens: u64,
    #[serde(with = "duration_serde")]
    pub window: Duration,
    #[serde(default)]
    pub scope: BucketScope,
    #[serde(default)]
    pub key_by: RateLimitKey,
    #[serde(default)]
    pub on_missing_key: MissingKeyPolicy,
}

impl BucketPolicy {
    pub fn new(capacity: u64, refill_tokens: u64, window: Duration) -> Self {
        Self {
            capacity,
            refill_tokens,
            window,
            scope: BucketScope::Global,
            key_by: RateLimitKey::Route,
            on_missing_key: MissingKeyPolicy::default(),
        }
    }

    pub fn per_second(requests: u64) -> Self {
        Self::new(requests, requests, Duration::from_secs(1))
    }

    pub fn per_minute(requests: u64) -> Self {
        Self::new(requests, requests, Duration::from_secs(60))
    }

    pub fn per_hour(requests: u64) -> Self {
        Self::new(requests, requests, Duration::from_secs(3_600))
    }

    pub fn per_day(requests: u64) -> Self {
        Self::new(requests, requests, Duration::from_secs(86_400))
    }

    pub fn with_scope(mut self, scope: BucketScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn keyed_by(mut self, key_by: RateLimitKey) -> Self {
        self.key_by = key_by;
        self
    }

    pub fn validate(&self) -> Result<(), RateLimitError> {
        if self.capacity == 0 {
            return Err(RateLimitError::InvalidRequest("capacity must be greater than 0".into()));
        }
        if self.refill_tokens == 0 {
            return Err(RateLimitError::InvalidRequest("refill_tokens must be greater than 0".into()));
        }
        if self.window.is_zero() {
            return Err(RateLimitError::InvalidRequest("window must be greater than 0".into()));
        }
        if let RateLimitKey::Header { name } = &self.key_by {
            if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(RateLimitError::InvalidRequest(format!("invalid header name '{name}'")));
            }
        }
        Ok(())
    }

    fn window_ms(&self) -> f64 {
        self.window.as_millis() as f64
    }

    /// Time for an empty bucket to refill completely, plus one window.
    fn state_ttl(&self) -> Duration {
        let refill_ms = (self.capacity as f64 / self.refill_tokens as f64 * self.window_ms()).ceil();
        // `as` saturates for floats, so an extreme ratio lands on u64::MAX.
        Duration::from_millis(refill_ms as u64).saturating_add(self.window)
    }
}

/// Persisted bucket state. A missing key is a full bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill_ms: u64,
}

impl BucketState {
    fn full(policy: &BucketPolicy, now_ms: u64) -> Self {
        Self {
            tokens: policy.capacity as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Tokens after lazily applying refill up to `now_ms`, clamped to `[0, capacity]`.
    fn refilled(&self, policy: &BucketPolicy, now_ms: u64) -> f64 {
        let elapsed = now_ms.saturating_sub(self.last_refill_ms) as f64;
        let added = elapsed / policy.window_ms() * policy.refill_tokens as f64;
        (self.tokens + added).clamp(0.0, policy.capacity as f64)
    }
}

/// A concrete bucket: storage key plus the policy governing it.
#[derive(Debug, Clone)]
pub struct BucketRef {
    key: String,
    policy: BucketPolicy,
}

impl BucketRef {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }
}

/// Token-bucket limiter backed by the coordination store.
pub struct DistributedRateLimiter {
    store: Arc<dyn CoordinationStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    op_timeout: Duration,
    max_cas_attempts: u32,
}

impl DistributedRateLimiter {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        instance_id: impl Into<String>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            instance_id: instance_id.into(),
            op_timeout,
            max_cas_attempts: 32,
        }
    }

    /// Resolve the storage key for `key` under the named policy.
    ///
    /// Per-client buckets are namespaced by `client` or, when absent, by this
    /// instance's identity.
    pub fn bucket(&self, policy_name: &str, policy: &BucketPolicy, key: &str, client: Option<&str>) -> BucketRef {
        let key = match policy.scope {
            BucketScope::Global => format!("ratelimit:{policy_name}:{key}"),
            BucketScope::PerClient => {
                let owner = client.unwrap_or(&self.instance_id);
                format!("ratelimit:{policy_name}:{owner}:{key}")
            }
        };
        BucketRef {
            key,
            policy: policy.clone(),
        }
    }

    /// Take `permits` tokens from the bucket, or fail without consuming any.
    pub async fn try_acquire(&self, bucket: &BucketRef, permits: u64) -> Result<(), RateLimitError> {
        let result = self.acquire_inner(bucket, permits).await;
        let outcome = match &result {
            Ok(()) => "allowed",
            Err(RateLimitError::LimitExceeded { .. }) => "limited",
            Err(RateLimitError::Unavailable(e)) => {
                tracing::error!(bucket = %bucket.key, "Rate limiter unavailable: {}", e);
                "unavailable"
            }
            Err(_) => "invalid",
        };
        metrics::increment_rate_limit_decision(outcome);
        result
    }

    async fn acquire_inner(&self, bucket: &BucketRef, permits: u64) -> Result<(), RateLimitError> {
        let policy = &bucket.policy;
        policy.validate()?;
        if permits == 0 || permits > policy.capacity {
            return Err(RateLimitError::InvalidRequest(format!(
                "permits must be between 1 and {} (got {permits})",
                policy.capacity
            )));
        }
        let wanted = permits as f64;

        for _ in 0..self.max_cas_attempts {
            let raw = bounded(self.op_timeout, self.store.get(&bucket.key)).await?;
            let now = self.clock.now_millis();
            let state = match raw.as_deref() {
                Some(raw) => serde_json::from_str::<BucketState>(raw).map_err(StoreError::from)?,
                None => BucketState::full(policy, now),
            };

            let tokens = state.refilled(policy, now);
            if tokens < wanted {
                let deficit = wanted - tokens;
                let wait_secs =
                    deficit / policy.refill_tokens as f64 * policy.window.as_secs_f64();
                let retry_after_secs = (wait_secs.ceil() as u64).max(1);
                tracing::debug!(bucket = %bucket.key, tokens, permits, retry_after_secs, "Rate limit exceeded");
                return Err(RateLimitError::LimitExceeded {
                    key: bucket.key.clone(),
                    retry_after_secs,
                });
            }

            let next = BucketState {
                tokens: tokens - wanted,
                last_refill_ms: now.max(state.last_refill_ms),
            };
            let encoded = serde_json::to_string(&next).map_err(StoreError::from)?;
            let swapped = bounded(
                self.op_timeout,
                self.store.compare_and_swap(
                    &bucket.key,
                    raw.as_deref(),
                    Some(&encoded),
                    Some(policy.state_ttl()),
                ),
            )
            .await?;
            if swapped {
                return Ok(());
            }
        }

        Err(StoreError::Contention {
            key: bucket.key.clone(),
            attempts: self.max_cas_attempts,
        }
        .into())
    }

    /// Whole tokens currently available, after refill. Does not consume.
    pub async fn available_permits(&self, bucket: &BucketRef) -> Result<u64, RateLimitError> {
        bucket.policy.validate()?;
        let raw = bounded(self.op_timeout, self.store.get(&bucket.key)).await?;
        let now = self.clock.now_millis();
        let tokens = match raw.as_deref() {
            Some(raw) => serde_json::from_str::<BucketState>(raw)
                .map_err(StoreError::from)?
                .refilled(&bucket.policy, now),
            None => bucket.policy.capacity as f64,
        };
        Ok(tokens.floor() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{adapters::memory_store::MemoryCoordinationStore, ports::clock::ManualClock};

    fn limiter(clock: &ManualClock) -> (Arc<MemoryCoordinationStore>, DistributedRateLimiter) {
        let store = Arc::new(MemoryCoordinationStore::with_clock(Arc::new(clock.clone())));
        let limiter = DistributedRateLimiter::new(
            store.clone(),
            Arc::new(clock.clone()),
            "instance-a",
            Duration::from_secs(1),
        );
        (store, limiter)
    }

    #[tokio::test]
    async fn test_burst_then_refill_scenario() {
        let clock = ManualClock::new(1_000_000);
        let (_store, limiter) = limiter(&clock);
        let policy = BucketPolicy::new(5, 5, Duration::from_secs(1));
        let bucket = limiter.bucket("api", &policy, "k", None);

        for _ in 0..5 {
            limiter.try_acquire(&bucket, 1).await.unwrap();
        }
        match limiter.try_acquire(&bucket, 1).await {
            Err(RateLimitError::LimitExceeded { retry_after_secs, .. }) => assert_eq!(retry_after_secs, 1),
            other => panic!("expected LimitExceeded, got {other:?}"),
        }

        clock.advance(Duration::from_millis(1_100));
        limiter.try_acquire(&bucket, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_tokens_never_exceed_capacity_or_go_negative() {
        let clock = ManualClock::new(0);
        let (_store, limiter) = limiter(&clock);
        let policy = BucketPolicy::new(3, 1, Duration::from_secs(1));
        let bucket = limiter.bucket("p", &policy, "k", None);

        assert_eq!(limiter.available_permits(&bucket).await.unwrap(), 3);
        limiter.try_acquire(&bucket, 3).await.unwrap();
        assert_eq!(limiter.available_permits(&bucket).await.unwrap(), 0);
        assert!(limiter.try_acquire(&bucket, 1).await.is_err());
        assert_eq!(limiter.available_permits(&bucket).await.unwrap(), 0);

        clock.advance(Duration::from_secs(1));
        assert_eq!(limiter.available_permits(&bucket).await.unwrap(), 1);

        // Idle for (capacity / refill) * window and beyond: full, not more.
        clock.advance(Duration::from_secs(60));
        assert_eq!(limiter.available_permits(&bucket).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_acquire_has_no_side_effects() {
        let clock = ManualClock::new(0);
        let (_store, limiter) = limiter(&clock);
        let policy = BucketPolicy::new(4, 4, Duration::from_secs(1));
        let bucket = limiter.bucket("p", &policy, "k", None);

        limiter.try_acquire(&bucket, 3).await.unwrap();
        assert!(matches!(
            limiter.try_acquire(&bucket, 2).await,
            Err(RateLimitError::LimitExceeded { .. })
        ));
        limiter.try_acquire(&bucket, 1).await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_hint_scales_with_window() {
        let clock = ManualClock::new(0);
        let (_store, limiter) = limiter(&clock);
        let policy = BucketPolicy::per_minute(2);
        let bucket = limiter.bucket("p", &policy, "k", None);
        limiter.try_acquire(&bucket, 2).await.unwrap();
        match limiter.try_acquire(&bucket, 1).await {
            Err(RateLimitError::LimitExceeded { retry_after_secs, .. }) => assert_eq!(retry_after_secs, 30),
            other => panic!("expected LimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_permits() {
        let clock = ManualClock::new(0);
        let (_store, limiter) = limiter(&clock);
        let bucket = limiter.bucket("p", &BucketPolicy::per_second(2), "k", None);
        assert!(matches!(limiter.try_acquire(&bucket, 0).await, Err(RateLimitError::InvalidRequest(_))));
        assert!(matches!(limiter.try_acquire(&bucket, 3).await, Err(RateLimitError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let clock = ManualClock::new(0);
        let (store, limiter) = limiter(&clock);
        let bucket = limiter.bucket("p", &BucketPolicy::per_second(10), "k", None);
        store.set_available(false);
        assert!(matches!(
            limiter.try_acquire(&bucket, 1).await,
            Err(RateLimitError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_scopes_namespace_keys() {
        let clock = ManualClock::new(0);
        let (_store, limiter) = limiter(&clock);
        let global = BucketPolicy::per_second(1);
        let per_client = BucketPolicy::per_second(1).with_scope(BucketScope::PerClient);

        assert_eq!(limiter.bucket("g", &global, "r1", Some("c")).key(), "ratelimit:g:r1");
        assert_eq!(limiter.bucket("p", &per_client, "r1", Some("c")).key(), "ratelimit:p:c:r1");
        assert_eq!(limiter.bucket("p", &per_client, "r1", None).key(), "ratelimit:p:instance-a:r1");

        let a = limiter.bucket("p", &per_client, "r1", Some("a"));
        let b = limiter.bucket("p", &per_client, "r1", Some("b"));
        limiter.try_acquire(&a, 1).await.unwrap();
        limiter.try_acquire(&b, 1).await.unwrap();
        assert!(limiter.try_acquire(&a, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_acquires_never_over_admit() {
        let clock = ManualClock::new(0);
        let (_store, limiter) = limiter(&clock);
        let limiter = Arc::new(limiter);
        let bucket = limiter.bucket("p", &BucketPolicy::new(10, 1, Duration::from_secs(3_600)), "k", None);

        let mut handles = Vec::new();
        for _ in 0..40 {
            let limiter = limiter.clone();
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move { limiter.try_acquire(&bucket, 1).await }));
        }
        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[test]
    fn test_state_ttl_saturates_for_extreme_ratios() {
        let policy = BucketPolicy::new(u64::MAX, 1, Duration::MAX);
        assert_eq!(policy.state_ttl(), Duration::MAX);
        assert_eq!(BucketPolicy::per_second(5).state_ttl(), Duration::from_secs(2));
    }

    #[test]
    fn test_key_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "abc".parse().unwrap());
        let client: Option<IpAddr> = Some("203.0.113.9".parse().unwrap());

        assert_eq!(RateLimitKey::Route.extract("r", client, &headers).as_deref(), Some("r"));
        assert_eq!(
            RateLimitKey::ClientAddress.extract("r", client, &headers).as_deref(),
            Some("203.0.113.9")
        );
        assert_eq!(
            RateLimitKey::Header { name: "x-api-key".into() }.extract("r", client, &headers).as_deref(),
            Some("abc")
        );
        assert_eq!(
            RateLimitKey::Header { name: "x-missing".into() }.extract("r", client, &headers),
            None
        );
        assert_eq!(
            RateLimitKey::ClientRoute.extract("r", client, &headers).as_deref(),
            Some("203.0.113.9|r")
        );
    }

    #[test]
    fn test_policy_deserializes_humantime_window() {
        let policy: BucketPolicy = serde_json::from_str(
            r#"{"capacity":5,"refill_tokens":5,"window":"1s","scope":"per_client","key_by":{"type":"header","name":"x-api-key"}}"#,
        )
        .unwrap();
        assert_eq!(policy.window, Duration::from_secs(1));
        assert_eq!(policy.scope, BucketScope::PerClient);
        assert_eq!(policy.key_by, RateLimitKey::Header { name: "x-api-key".into() });
    }
}
