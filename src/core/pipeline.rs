//! Per-request orchestration of the control-plane stages.
//!
//! Stage order: telemetry begin, admission, rate limiting, route resolution,
//! forwarding, telemetry finish. Each stage returns `Result<_, Rejection>` and
//! `?` short-circuits the rest, so the order is visible in [`GatewayPipeline::run`].
//!
//! The route is looked up before rate limiting (it is a local, non-suspending
//! read) so route-keyed budgets can use the route id, but a missing route is
//! only reported after the rate-limit stage has passed.
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use axum::{body::Body as AxumBody, response::IntoResponse};
use http::{HeaderMap, HeaderValue, Request, Response, Uri, header};
use tracing::Instrument;

use crate::{
    config::MissingKeyPolicy,
    core::{
        admission::AdmissionFilter,
        load_balancer::LoadBalancer,
        policy_registry::PolicyRegistry,
        rate_limiter::DistributedRateLimiter,
        rejection::Rejection,
        route_table::{Route, RouteRequest, RouteTable},
        telemetry::{RequestContext, RequestTelemetry},
    },
    ports::http_client::HttpClient,
};

const UNMATCHED_ROUTE: &str = "~unmatched";

static X_FORWARDED_FOR: header::HeaderName = header::HeaderName::from_static("x-forwarded-for");

pub struct GatewayPipeline {
    telemetry: RequestTelemetry,
    admission: Arc<AdmissionFilter>,
    routes: Arc<RouteTable>,
    policies: Arc<PolicyRegistry>,
    limiter: Arc<DistributedRateLimiter>,
    balancer: LoadBalancer,
    client: Arc<dyn HttpClient>,
    default_rate_limits: Vec<String>,
}

impl GatewayPipeline {
    pub fn new(
        telemetry: RequestTelemetry,
        admission: Arc<AdmissionFilter>,
        routes: Arc<RouteTable>,
        policies: Arc<PolicyRegistry>,
        limiter: Arc<DistributedRateLimiter>,
        client: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            telemetry,
            admission,
            routes,
            policies,
            limiter,
            balancer: LoadBalancer::new(),
            client,
            default_rate_limits: Vec::new(),
        }
    }

    /// Policies applied to every request, before any route-specific policy.
    pub fn with_default_rate_limits(mut self, names: Vec<String>) -> Self {
        self.default_rate_limits = names;
        self
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn admission(&self) -> &Arc<AdmissionFilter> {
        &self.admission
    }

    pub fn policies(&self) -> &Arc<PolicyRegistry> {
        &self.policies
    }

    pub fn limiter(&self) -> &Arc<DistributedRateLimiter> {
        &self.limiter
    }

    /// Handle one inbound request end to end. Never fails: rejections become
    /// structured responses.
    pub async fn handle(&self, request: Request<AxumBody>, peer: Option<SocketAddr>) -> Response<AxumBody> {
        let mut context = self.telemetry.begin(&request);
        let span = context.span.clone();

        let mut response = match self.run(&mut context, request, peer).instrument(span.clone()).await {
            Ok(response) => response,
            Err(rejection) => {
                let _entered = span.enter();
                match &rejection {
                    Rejection::CoordinationUnavailable(reason) => {
                        tracing::error!(code = rejection.code(), "Request refused, coordination unavailable: {}", reason)
                    }
                    Rejection::UpstreamUnavailable(reason) => {
                        tracing::error!(code = rejection.code(), "Upstream call failed: {}", reason)
                    }
                    _ => tracing::info!(code = rejection.code(), "Request rejected: {}", rejection),
                }
                rejection.into_response()
            }
        };

        let status = response.status();
        self.telemetry.finish(context, response.headers_mut(), status);
        response
    }

    async fn run(
        &self,
        context: &mut RequestContext,
        mut request: Request<AxumBody>,
        peer: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>, Rejection> {
        let client = self.admission.check(request.headers(), peer.map(|p| p.ip()))?;
        context.set_client_address(client);

        let host = request
            .uri()
            .host()
            .or_else(|| request.headers().get(header::HOST).and_then(|v| v.to_str().ok()));
        let lookup = self.routes.lookup(&RouteRequest {
            path: request.uri().path(),
            host,
            headers: request.headers(),
        });

        self.enforce_rate_limits(lookup.as_ref().ok(), client, request.headers())
            .await?;

        let route = lookup?;
        context.set_route(route.clone());

        self.balancer.prune(&self.routes.snapshot()).await;
        let upstream = self
            .balancer
            .select(&route.id, route.strategy, &route.upstreams)
            .await
            .ok_or_else(|| Rejection::UpstreamUnavailable(format!("route '{}' has no upstreams", route.id)))?;
        *request.uri_mut() = upstream_uri(upstream, request.uri())?;
        append_forwarded_for(request.headers_mut(), client);
        self.telemetry.stamp(context, request.headers_mut());

        tracing::debug!(route = %route.id, upstream, "Forwarding request");
        Ok(self.client.send_request(request).await?)
    }

    async fn enforce_rate_limits(
        &self,
        route: Option<&Arc<Route>>,
        client: IpAddr,
        headers: &HeaderMap,
    ) -> Result<(), Rejection> {
        let route_id = route.map_or(UNMATCHED_ROUTE, |r| r.id.as_str());
        let route_policy = route.and_then(|r| r.rate_limit.as_deref());
        let client_identity = client.to_string();

        for name in self.default_rate_limits.iter().map(String::as_str).chain(route_policy) {
            let Some(policy) = self.policies.get(name) else {
                tracing::warn!(policy = %name, route = %route_id, "Unknown rate limit policy, skipping");
                continue;
            };
            let Some(key) = policy.key_by.extract(route_id, Some(client), headers) else {
                match policy.on_missing_key {
                    MissingKeyPolicy::Allow => continue,
                    MissingKeyPolicy::Deny => {
                        return Err(Rejection::Invalid(format!(
                            "request is missing the key required by rate limit policy '{name}'"
                        )));
                    }
                }
            };
            let bucket = self.limiter.bucket(name, &policy, &key, Some(&client_identity));
            self.limiter.try_acquire(&bucket, 1).await?;
        }
        Ok(())
    }
}

/// Point the request at `upstream`, keeping the original path and query.
fn upstream_uri(upstream: &str, original: &Uri) -> Result<Uri, Rejection> {
    let path_and_query = original.path_and_query().map_or("/", |pq| pq.as_str());
    let target = format!("{}{}", upstream.trim_end_matches('/'), path_and_query);
    target
        .parse::<Uri>()
        .map_err(|e| Rejection::UpstreamUnavailable(format!("invalid upstream URI '{target}': {e}")))
}

fn append_forwarded_for(headers: &mut HeaderMap, client: IpAddr) {
    let chain = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) if !existing.trim().is_empty() => format!("{existing}, {client}"),
        _ => client.to_string(),
    };
    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
