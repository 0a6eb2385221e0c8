//! Tollgate - a traffic-control plane for API gateway fleets.
//!
//! Every gateway instance in a fleet runs the same request pipeline and shares
//! its decisions through a coordination store, so routing changes, admission
//! rules, rate-limit budgets and locks hold across the whole fleet rather than
//! per process.
//!
//! # Features
//! - Hot-reloadable route table: path prefix, host and header predicates with
//!   deterministic specificity ordering and optimistic versioning
//! - IP admission control: allow / deny lists with exact, wildcard and CIDR entries
//! - Distributed token-bucket rate limiting keyed by route, client or header
//! - Lease-based distributed locks: exclusive, fair, read/write and multi-resource
//! - Request correlation ids, slow-request logging and `metrics` counters
//! - JSON management API for routes, admission and rate-limit templates
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use tollgate::{
//!     GatewayService, HttpClientAdapter, MemoryCoordinationStore,
//!     ports::clock::SystemClock,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = tollgate::config::load_config("tollgate.yaml").await?;
//! let client = HttpClientAdapter::new(config.upstream.timeout)?;
//! let gateway = GatewayService::new(
//!     Arc::new(config),
//!     Arc::new(MemoryCoordinationStore::new()),
//!     Arc::new(SystemClock),
//!     Arc::new(client),
//! )?;
//! gateway.bootstrap().await?;
//! # Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters** (implementations) while keeping
//! the control-plane logic inside `core`. The coordination store is a port: the
//! in-memory adapter serves single instances and tests, the Redis adapter serves fleets.
//!
//! # Failure model
//! When the coordination store cannot answer, decisions that depend on it fail
//! closed with a `COORDINATION_UNAVAILABLE` rejection; they never fall back to
//! admitting traffic.
//!
//! # Error Handling
//! Components return `thiserror` domain errors that convert into
//! [`core::rejection::Rejection`]; application wiring uses `eyre::Result` with
//! `WrapErr` context.
pub mod config;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{
        AdminState, HttpClientAdapter, HttpHandler, MemoryCoordinationStore, RedisCoordinationStore,
    },
    core::{GatewayService, Rejection},
    ports::{coordination_store::CoordinationStore, http_client::HttpClient},
    utils::GracefulShutdown,
};
