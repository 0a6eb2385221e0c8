//! Management API for the shared control-plane state.
//!
//! Every write goes through the coordination store, so a change made on one
//! instance reaches the whole fleet through the regular change notifications.
//! Failures use the same JSON envelope as data-plane rejections.
//!
//! Every request first passes the admission filter for its peer address and,
//! when a token is configured, must carry `Authorization: Bearer <token>`.
//!
//! | Method | Path |
//! |--------|------|
//! | `GET`, `POST` | `/admin/routes` |
//! | `GET`, `PUT`, `DELETE` | `/admin/routes/{id}` |
//! | `GET`, `PUT` | `/admin/admission` |
//! | `POST` | `/admin/admission/entries` |
//! | `DELETE` | `/admin/admission/entries/{entry}` (CIDR slashes percent-encoded) |
//! | `GET` | `/admin/rate-limits` |
//! | `GET`, `PUT`, `DELETE` | `/admin/rate-limits/{name}` |
//! | `GET` | `/admin/rate-limits/{name}/buckets/{key}` |
use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{ConnectInfo, Path, Query, Request, State},
    http::{StatusCode, header::AUTHORIZATION},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::core::{
    admission::{AdmissionFilter, AdmissionPolicy},
    pipeline::GatewayPipeline,
    policy_registry::{PolicyMap, PolicyRegistry},
    rate_limiter::{BucketPolicy, DistributedRateLimiter},
    rejection::Rejection,
    route_table::{Route, RouteTable},
};

#[derive(Clone)]
pub struct AdminState {
    routes: Arc<RouteTable>,
    admission: Arc<AdmissionFilter>,
    policies: Arc<PolicyRegistry>,
    limiter: Arc<DistributedRateLimiter>,
    token: Option<Arc<str>>,
}

impl AdminState {
    pub fn from_pipeline(pipeline: &GatewayPipeline) -> Self {
        Self {
            routes: pipeline.routes().clone(),
            admission: pipeline.admission().clone(),
            policies: pipeline.policies().clone(),
            limiter: pipeline.limiter().clone(),
            token: None,
        }
    }

    /// Require this bearer token on every management request.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.map(Arc::from);
        self
    }
}

/// Build the management router. Paths already carry the `/admin` prefix.
///
/// Serve it with connect info so the guard can see the peer address; without
/// one every request is refused.
pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/routes", get(list_routes).post(create_route))
        .route(
            "/admin/routes/{id}",
            get(get_route).put(update_route).delete(delete_route),
        )
        .route("/admin/admission", get(get_admission).put(replace_admission))
        .route("/admin/admission/entries", post(add_admission_entry))
        .route("/admin/admission/entries/{entry}", delete(remove_admission_entry))
        .route("/admin/rate-limits", get(list_rate_limits))
        .route(
            "/admin/rate-limits/{name}",
            get(get_rate_limit).put(put_rate_limit).delete(delete_rate_limit),
        )
        .route("/admin/rate-limits/{name}/buckets/{key}", get(bucket_permits))
        .route_layer(middleware::from_fn_with_state(state.clone(), guard))
        .with_state(state)
}

async fn guard(State(state): State<AdminState>, request: Request, next: Next) -> Result<Response, Rejection> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let address = state.admission.check(request.headers(), peer)?;

    if let Some(expected) = state.token.as_deref() {
        let presented = request
            .headers()
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        if !presented.is_some_and(|token| tokens_match(token.as_bytes(), expected.as_bytes())) {
            tracing::warn!(%address, path = %request.uri().path(), "Rejected management request without valid token");
            return Err(Rejection::Unauthorized("Missing or invalid management token".to_string()));
        }
    }
    Ok(next.run(request).await)
}

/// Length-then-content comparison that does not stop at the first mismatch.
fn tokens_match(presented: &[u8], expected: &[u8]) -> bool {
    presented.len() == expected.len()
        && presented
            .iter()
            .zip(expected)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RouteList {
    pub version: u64,
    pub routes: Vec<Route>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AdmissionView {
    pub version: u64,
    pub policy: AdmissionPolicy,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryRequest {
    pub entry: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EntryChange {
    pub entry: String,
    pub changed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RateLimitList {
    pub version: u64,
    pub policies: PolicyMap,
}

#[derive(Debug, Deserialize)]
pub struct BucketQuery {
    /// Namespace for per-client scoped policies
    pub client: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BucketView {
    pub policy: String,
    pub key: String,
    pub available_permits: u64,
    pub capacity: u64,
}

async fn list_routes(State(state): State<AdminState>) -> Json<RouteList> {
    let snapshot = state.routes.snapshot();
    Json(RouteList {
        version: snapshot.version(),
        routes: snapshot.routes().iter().map(|r| Route::clone(r)).collect(),
    })
}

async fn create_route(
    State(state): State<AdminState>,
    Json(route): Json<Route>,
) -> Result<impl IntoResponse, Rejection> {
    let stored = state.routes.upsert(route).await?;
    Ok((StatusCode::CREATED, Json(stored)))
}

async fn get_route(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<Route>, Rejection> {
    state
        .routes
        .snapshot()
        .routes()
        .iter()
        .find(|r| r.id == id)
        .map(|r| Json(Route::clone(r)))
        .ok_or_else(|| Rejection::NotFound(format!("Route '{id}' does not exist")))
}

async fn update_route(
    State(state): State<AdminState>,
    Path(id): Path<String>,
    Json(route): Json<Route>,
) -> Result<Json<Route>, Rejection> {
    if route.id != id {
        return Err(Rejection::Invalid(format!(
            "Route id '{}' in body does not match path '{id}'",
            route.id
        )));
    }
    Ok(Json(state.routes.upsert(route).await?))
}

async fn delete_route(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, Rejection> {
    state.routes.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_admission(State(state): State<AdminState>) -> Json<AdmissionView> {
    Json(AdmissionView {
        version: state.admission.version(),
        policy: state.admission.policy(),
    })
}

async fn replace_admission(
    State(state): State<AdminState>,
    Json(policy): Json<AdmissionPolicy>,
) -> Result<Json<AdmissionView>, Rejection> {
    let policy = state.admission.replace_policy(policy).await?;
    Ok(Json(AdmissionView {
        version: state.admission.version(),
        policy,
    }))
}

async fn add_admission_entry(
    State(state): State<AdminState>,
    Json(request): Json<EntryRequest>,
) -> Result<impl IntoResponse, Rejection> {
    let changed = state.admission.add_entry(&request.entry).await?;
    let status = if changed { StatusCode::CREATED } else { StatusCode::OK };
    Ok((
        status,
        Json(EntryChange {
            entry: request.entry.trim().to_string(),
            changed,
        }),
    ))
}

async fn remove_admission_entry(
    State(state): State<AdminState>,
    Path(entry): Path<String>,
) -> Result<Json<EntryChange>, Rejection> {
    let changed = state.admission.remove_entry(&entry).await?;
    if !changed {
        return Err(Rejection::NotFound(format!("Admission entry '{entry}' is not listed")));
    }
    Ok(Json(EntryChange { entry, changed }))
}

async fn list_rate_limits(State(state): State<AdminState>) -> Json<RateLimitList> {
    Json(RateLimitList {
        version: state.policies.version(),
        policies: state.policies.list(),
    })
}

async fn get_rate_limit(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<Json<BucketPolicy>, Rejection> {
    state
        .policies
        .get(&name)
        .map(Json)
        .ok_or_else(|| Rejection::NotFound(format!("Rate limit '{name}' does not exist")))
}

async fn put_rate_limit(
    State(state): State<AdminState>,
    Path(name): Path<String>,
    Json(policy): Json<BucketPolicy>,
) -> Result<Json<BucketPolicy>, Rejection> {
    state.policies.put(&name, policy.clone()).await?;
    Ok(Json(policy))
}

async fn delete_rate_limit(
    State(state): State<AdminState>,
    Path(name): Path<String>,
) -> Result<StatusCode, Rejection> {
    if state.policies.remove(&name).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(Rejection::NotFound(format!("Rate limit '{name}' does not exist")))
    }
}

async fn bucket_permits(
    State(state): State<AdminState>,
    Path((name, key)): Path<(String, String)>,
    Query(query): Query<BucketQuery>,
) -> Result<Json<BucketView>, Rejection> {
    let policy = state
        .policies
        .get(&name)
        .ok_or_else(|| Rejection::NotFound(format!("Rate limit '{name}' does not exist")))?;
    let bucket = state
        .limiter
        .bucket(&name, &policy, &key, query.client.as_deref());
    let available_permits = state.limiter.available_permits(&bucket).await?;
    Ok(Json(BucketView {
        policy: name,
        key,
        available_permits,
        capacity: policy.capacity,
    }))
}
