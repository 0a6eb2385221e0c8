//! Configuration data structures for Tollgate.
//!
//! These types map directly to YAML (also TOML / JSON) configuration files and
//! carry defaults so a minimal file only needs routes. Durations are
//! humantime strings.
use std::{collections::BTreeMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    config::duration_serde,
    core::{
        admission::{AdmissionPolicy, ForwardedStrategy},
        lock::LockSettings,
        rate_limiter::BucketPolicy,
        route_table::Route,
        sync::SyncSettings,
    },
};

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Separate listener for the management API.
    #[serde(default)]
    pub admin_listen_addr: Option<String>,
    /// Bearer token required on every management request. Without a separate
    /// listener the API is only mounted on the main listener when this is set.
    #[serde(default)]
    pub admin_token: Option<String>,
    /// Identity used for lock ownership and per-client bucket namespacing.
    /// A UUID is generated at startup when absent.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub route_sync: RouteSyncConfig,
    #[serde(default)]
    pub client_address: ClientAddressConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub locks: LockConfig,
    /// Bootstrap admission policy.
    #[serde(default)]
    pub admission: AdmissionPolicy,
    /// Bootstrap rate-limit templates by name.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, BucketPolicy>,
    /// Templates applied to every request.
    #[serde(default)]
    pub default_rate_limits: Vec<String>,
    /// Bootstrap routes.
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_listen_addr: None,
            admin_token: None,
            instance_id: None,
            coordination: CoordinationConfig::default(),
            route_sync: RouteSyncConfig::default(),
            client_address: ClientAddressConfig::default(),
            telemetry: TelemetryConfig::default(),
            upstream: UpstreamConfig::default(),
            locks: LockConfig::default(),
            admission: AdmissionPolicy::default(),
            rate_limits: BTreeMap::new(),
            default_rate_limits: Vec::new(),
            routes: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationBackend {
    /// In-process store; only correct for a single gateway instance
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinationConfig {
    pub backend: CoordinationBackend,
    pub redis_url: Option<String>,
    /// Prepended to every key and channel so several deployments can share one store.
    pub key_prefix: String,
    /// Upper bound for every individual store call.
    #[serde(with = "duration_serde")]
    pub operation_timeout: Duration,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            backend: CoordinationBackend::Memory,
            redis_url: None,
            key_prefix: "tollgate".to_string(),
            operation_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RouteSyncConfig {
    pub max_attempts: u32,
    #[serde(with = "duration_serde")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_serde")]
    pub max_backoff: Duration,
}

impl Default for RouteSyncConfig {
    fn default() -> Self {
        let defaults = SyncSettings::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_backoff: defaults.initial_backoff,
            max_backoff: defaults.max_backoff,
        }
    }
}

impl RouteSyncConfig {
    pub fn settings(&self) -> SyncSettings {
        SyncSettings {
            max_attempts: self.max_attempts,
            initial_backoff: self.initial_backoff,
            max_backoff: self.max_backoff,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ClientAddressConfig {
    /// Header carrying the proxy chain; `None` trusts only the transport peer.
    pub forwarded_header: Option<String>,
    /// Upper bound on how many header entries are considered.
    pub max_hops: usize,
    pub strategy: ForwardedStrategy,
}

impl Default for ClientAddressConfig {
    fn default() -> Self {
        Self {
            forwarded_header: Some("x-forwarded-for".to_string()),
            max_hops: 1,
            strategy: ForwardedStrategy::LeftMost,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Console,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TelemetryConfig {
    pub correlation_header: String,
    #[serde(with = "duration_serde")]
    pub slow_request_threshold: Duration,
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            correlation_header: "x-correlation-id".to_string(),
            slow_request_threshold: Duration::from_secs(1),
            log_format: LogFormat::Json,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct UpstreamConfig {
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LockConfig {
    #[serde(with = "duration_serde")]
    pub poll_interval: Duration,
    /// How long an instance waits for the bootstrap seeding lock.
    #[serde(with = "duration_serde")]
    pub bootstrap_wait: Duration,
    #[serde(with = "duration_serde")]
    pub bootstrap_lease: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
            bootstrap_wait: Duration::from_secs(10),
            bootstrap_lease: Duration::from_secs(30),
        }
    }
}

impl LockConfig {
    pub fn settings(&self, op_timeout: Duration) -> LockSettings {
        LockSettings {
            poll_interval: self.poll_interval,
            op_timeout,
            ..LockSettings::default()
        }
    }
}

/// Upstream selection strategy for a route with several targets.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    #[default]
    RoundRobin,
    Random,
    /// Always the first upstream; later entries are manual failover targets
    First,
}

/// Behaviour when a request lacks the material a rate-limit key is built from.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingKeyPolicy {
    #[default]
    Allow,
    Deny,
}
