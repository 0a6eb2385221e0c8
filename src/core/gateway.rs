//! Composition root for one gateway instance.
//!
//! `GatewayService` wires the control-plane components to a shared
//! coordination store: the route table, admission filter, rate-limit registry
//! and limiter behind the request pipeline, plus the lock service used for
//! fleet-wide one-time work such as bootstrap seeding. Several services built
//! over the same store behave as a fleet.
use std::{sync::Arc, time::Duration};

use eyre::{Result, WrapErr};
use http::HeaderName;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::GatewayConfig,
    core::{
        admission::{AdmissionFilter, ClientAddressResolver},
        lock::{DistributedLock, LockError, LockMode},
        pipeline::GatewayPipeline,
        policy_registry::PolicyRegistry,
        rate_limiter::DistributedRateLimiter,
        route_table::RouteTable,
        telemetry::RequestTelemetry,
    },
    ports::{clock::Clock, coordination_store::CoordinationStore, http_client::HttpClient},
};

const BOOTSTRAP_LOCK: &str = "bootstrap";

/// Which shared documents this instance wrote during bootstrap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    pub routes_seeded: bool,
    pub admission_seeded: bool,
    pub rate_limits_seeded: bool,
}

pub struct GatewayService {
    config: Arc<GatewayConfig>,
    instance_id: String,
    pipeline: Arc<GatewayPipeline>,
    locks: Arc<DistributedLock>,
}

impl GatewayService {
    /// Build every component for `config` over `store`.
    ///
    /// The admission filter and policy registry start from the configured
    /// values so the instance is usable before the first sync; the route table
    /// starts empty and refuses traffic until routes are loaded.
    pub fn new(
        config: Arc<GatewayConfig>,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        http_client: Arc<dyn HttpClient>,
    ) -> Result<Self> {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let op_timeout = config.coordination.operation_timeout;

        let forwarded_header = config
            .client_address
            .forwarded_header
            .as_deref()
            .map(|name| HeaderName::from_bytes(name.as_bytes()))
            .transpose()
            .wrap_err("Invalid client_address.forwarded_header")?;
        let resolver = ClientAddressResolver::new(forwarded_header, config.client_address.max_hops)
            .with_strategy(config.client_address.strategy);

        let correlation_header =
            HeaderName::from_bytes(config.telemetry.correlation_header.as_bytes())
                .wrap_err("Invalid telemetry.correlation_header")?;
        let telemetry =
            RequestTelemetry::new(correlation_header, config.telemetry.slow_request_threshold);

        let admission = Arc::new(
            AdmissionFilter::new(store.clone(), op_timeout, resolver, config.admission.clone())
                .wrap_err("Invalid admission policy")?,
        );
        let routes = Arc::new(RouteTable::new(store.clone(), op_timeout));
        let policies = Arc::new(PolicyRegistry::new(
            store.clone(),
            op_timeout,
            config.rate_limits.clone(),
        ));
        let limiter = Arc::new(DistributedRateLimiter::new(
            store.clone(),
            clock.clone(),
            instance_id.clone(),
            op_timeout,
        ));
        let locks = Arc::new(DistributedLock::new(
            store,
            clock,
            instance_id.clone(),
            config.locks.settings(op_timeout),
        ));

        let pipeline = GatewayPipeline::new(telemetry, admission, routes, policies, limiter, http_client)
            .with_default_rate_limits(config.default_rate_limits.clone());

        Ok(Self {
            config,
            instance_id,
            pipeline: Arc::new(pipeline),
            locks,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &Arc<GatewayConfig> {
        &self.config
    }

    pub fn pipeline(&self) -> &Arc<GatewayPipeline> {
        &self.pipeline
    }

    pub fn locks(&self) -> &Arc<DistributedLock> {
        &self.locks
    }

    /// Seed the shared documents from the configuration if the store has none.
    ///
    /// Runs under the fleet-wide `bootstrap` lock so concurrent starts seed once.
    /// Individual seeding failures are logged; the instance stays fail-closed
    /// until the documents become readable.
    pub async fn bootstrap(&self) -> Result<BootstrapReport, LockError> {
        let wait = self.config.locks.bootstrap_wait;
        let lease = self.config.locks.bootstrap_lease;
        self.locks
            .with_lock(BOOTSTRAP_LOCK, LockMode::Exclusive, wait, lease, || self.seed())
            .await
    }

    async fn seed(&self) -> BootstrapReport {
        let mut report = BootstrapReport::default();

        match self.pipeline.routes().seed_if_empty(self.config.routes.clone()).await {
            Ok(seeded) => report.routes_seeded = seeded,
            Err(e) => tracing::error!("Failed to seed routes: {}", e),
        }
        match self
            .pipeline
            .admission()
            .seed_if_empty(self.config.admission.clone())
            .await
        {
            Ok(seeded) => report.admission_seeded = seeded,
            Err(e) => tracing::error!("Failed to seed admission policy: {}", e),
        }
        match self
            .pipeline
            .policies()
            .seed_if_empty(self.config.rate_limits.clone())
            .await
        {
            Ok(seeded) => report.rate_limits_seeded = seeded,
            Err(e) => tracing::error!("Failed to seed rate limits: {}", e),
        }

        tracing::info!(
            instance = %self.instance_id,
            routes = report.routes_seeded,
            admission = report.admission_seeded,
            rate_limits = report.rate_limits_seeded,
            "Bootstrap seeding finished"
        );
        report
    }

    /// Start following every shared document until `cancel` fires.
    pub fn start_sync(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let settings = self.config.route_sync.settings();
        vec![
            self.pipeline.routes().start_sync(settings, cancel.clone()),
            self.pipeline.admission().start_sync(settings, cancel.clone()),
            self.pipeline.policies().start_sync(settings, cancel),
        ]
    }

    /// Wait until the local route table has caught up with `version`.
    pub async fn wait_for_routes(&self, version: u64, limit: Duration) -> bool {
        let mut rx = self.pipeline.routes().subscribe();
        tokio::time::timeout(limit, async {
            loop {
                if rx.borrow_and_update().version() >= version {
                    return;
                }
                if rx.changed().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
        .is_ok()
    }
}
