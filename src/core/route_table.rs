//! Route table with hot reload.
//!
//! The authoritative table is a [`SharedDocument`] in the coordination store.
//! Every instance keeps an immutable [`RouteSnapshot`] behind an `ArcSwap`;
//! writers build a complete new snapshot off to the side and publish it with a
//! single pointer swap, so readers never lock and never see a half-built table.
//!
//! Lookup picks the most specific matching route: longest path prefix, then
//! host-qualified over host-agnostic, then more header matchers, then higher
//! weight, then earlier insertion.
use std::{cmp::Reverse, sync::Arc, time::Duration};

use arc_swap::ArcSwap;
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    config::LoadBalanceStrategy,
    core::sync::{SharedDocument, SyncSettings, Versioned, spawn_follower},
    metrics,
    ports::coordination_store::{CoordinationStore, StoreError},
};

const ROUTES_DOCUMENT: &str = "routes";

/// Errors raised by route table operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RouteError {
    /// No enabled route matches the request
    #[error("No route matches path '{path}'")]
    NotFound { path: String },

    /// Management operation referenced a route id that does not exist
    #[error("Route '{id}' does not exist")]
    UnknownRoute { id: String },

    /// Caller edited a stale copy of the route
    #[error("Route '{id}' is at version {stored}, update was based on version {submitted}")]
    VersionConflict {
        id: String,
        stored: u64,
        submitted: u64,
    },

    #[error("Invalid route: {0}")]
    Invalid(String),

    #[error(transparent)]
    Coordination(#[from] StoreError),
}

fn default_enabled() -> bool {
    true
}

/// Header predicate: presence only, or exact value when `value` is set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeaderMatch {
    pub name: String,
    #[serde(default)]
    pub value: Option<String>,
}

/// Conditions a request must satisfy for a route to apply.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct RoutePredicate {
    pub path_prefix: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub headers: Vec<HeaderMatch>,
}

impl RoutePredicate {
    fn matches(&self, request: &RouteRequest<'_>) -> bool {
        if !request.path.starts_with(&self.path_prefix) {
            return false;
        }
        if let Some(expected) = &self.host {
            let Some(host) = request.host else {
                return false;
            };
            let host = host.split(':').next().unwrap_or(host);
            if !host.eq_ignore_ascii_case(expected) {
                return false;
            }
        }
        self.headers.iter().all(|m| match request.headers.get(m.name.as_str()) {
            None => false,
            Some(actual) => match &m.value {
                None => true,
                Some(expected) => actual.to_str().is_ok_and(|v| v == expected),
            },
        })
    }

    fn specificity(&self) -> (usize, bool, usize) {
        (self.path_prefix.len(), self.host.is_some(), self.headers.len())
    }
}

/// A routing rule: predicate, upstream targets and per-route policy references.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Route {
    pub id: String,
    pub predicate: RoutePredicate,
    pub upstreams: Vec<String>,
    #[serde(default)]
    pub strategy: LoadBalanceStrategy,
    #[serde(default)]
    pub weight: i32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Optimistic concurrency token; 0 for a route that has never been stored.
    #[serde(default)]
    pub version: u64,
    /// Name of a rate-limit template applied to requests on this route.
    #[serde(default)]
    pub rate_limit: Option<String>,
}

impl Route {
    /// Create an enabled, never-stored route forwarding `path_prefix` to `upstreams`.
    pub fn new(id: impl Into<String>, path_prefix: impl Into<String>, upstreams: Vec<String>) -> Self {
        Self {
            id: id.into(),
            predicate: RoutePredicate {
                path_prefix: path_prefix.into(),
                ..RoutePredicate::default()
            },
            upstreams,
            strategy: LoadBalanceStrategy::default(),
            weight: 0,
            enabled: true,
            version: 0,
            rate_limit: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.predicate.host = Some(host.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.predicate.headers.push(HeaderMatch {
            name: name.into(),
            value: value.map(str::to_string),
        });
        self
    }

    pub fn with_weight(mut self, weight: i32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_rate_limit(mut self, policy: impl Into<String>) -> Self {
        self.rate_limit = Some(policy.into());
        self
    }

    /// Structural checks shared by config validation and the management API.
    pub fn validate(&self) -> Result<(), RouteError> {
        if self.id.trim().is_empty() {
            return Err(RouteError::Invalid("route id must not be empty".to_string()));
        }
        if !self.predicate.path_prefix.starts_with('/') {
            return Err(RouteError::Invalid(format!(
                "route '{}' path_prefix must start with '/'",
                self.id
            )));
        }
        if self.upstreams.is_empty() {
            return Err(RouteError::Invalid(format!(
                "route '{}' must have at least one upstream",
                self.id
            )));
        }
        if let Some(bad) = self
            .upstreams
            .iter()
            .find(|u| !(u.starts_with("http://") || u.starts_with("https://")))
        {
            return Err(RouteError::Invalid(format!(
                "route '{}' upstream '{bad}' must start with http:// or https://",
                self.id
            )));
        }
        Ok(())
    }
}

/// The parts of an inbound request that route predicates inspect.
#[derive(Debug, Clone, Copy)]
pub struct RouteRequest<'a> {
    pub path: &'a str,
    pub host: Option<&'a str>,
    pub headers: &'a HeaderMap,
}

/// Immutable, fully built routing table.
#[derive(Debug, Default)]
pub struct RouteSnapshot {
    version: u64,
    /// Insertion order.
    routes: Vec<Arc<Route>>,
    /// Enabled routes, most specific first.
    match_order: Vec<Arc<Route>>,
}

impl RouteSnapshot {
    fn build(version: u64, routes: Vec<Route>) -> Self {
        let routes: Vec<Arc<Route>> = routes.into_iter().map(Arc::new).collect();
        let mut match_order: Vec<Arc<Route>> =
            routes.iter().filter(|r| r.enabled).cloned().collect();
        // Stable sort keeps insertion order among equal keys.
        match_order.sort_by_key(|r| Reverse((r.predicate.specificity(), r.weight)));
        Self {
            version,
            routes,
            match_order,
        }
    }

    /// Document version this snapshot was built from; 0 before the first sync.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// All routes in insertion order, including disabled ones.
    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Most specific enabled route matching `request`.
    pub fn lookup(&self, request: &RouteRequest<'_>) -> Option<Arc<Route>> {
        self.match_order
            .iter()
            .find(|route| route.predicate.matches(request))
            .cloned()
    }
}

/// Hot-reloadable route table shared by every request task.
pub struct RouteTable {
    current: ArcSwap<RouteSnapshot>,
    document: Arc<SharedDocument<Vec<Route>>>,
    changes: watch::Sender<Arc<RouteSnapshot>>,
}

impl RouteTable {
    /// Create an empty (fail-closed) table backed by `store`.
    pub fn new(store: Arc<dyn CoordinationStore>, op_timeout: Duration) -> Self {
        let empty = Arc::new(RouteSnapshot::default());
        let (changes, _) = watch::channel(empty.clone());
        Self {
            current: ArcSwap::new(empty),
            document: Arc::new(SharedDocument::new(store, ROUTES_DOCUMENT, op_timeout)),
            changes,
        }
    }

    /// Resolve the route for a request against the current snapshot.
    pub fn lookup(&self, request: &RouteRequest<'_>) -> Result<Arc<Route>, RouteError> {
        self.current
            .load()
            .lookup(request)
            .ok_or_else(|| RouteError::NotFound {
                path: request.path.to_string(),
            })
    }

    /// The current snapshot. Holding it keeps that version alive even across swaps.
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.load_full()
    }

    /// Receive every snapshot installed from now on.
    pub fn subscribe(&self) -> watch::Receiver<Arc<RouteSnapshot>> {
        self.changes.subscribe()
    }

    /// Invoke `callback` with each newly installed snapshot.
    pub fn on_change<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: Fn(Arc<RouteSnapshot>) + Send + Sync + 'static,
    {
        let mut rx = self.subscribe();
        rx.mark_unchanged();
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let snapshot = rx.borrow_and_update().clone();
                callback(snapshot);
            }
        })
    }

    /// Create or replace a route. Returns the stored route with its new version.
    ///
    /// `route.version` must equal the stored version (0 for a new route), otherwise
    /// the update was based on a stale copy and is refused.
    pub async fn upsert(&self, route: Route) -> Result<Route, RouteError> {
        route.validate()?;
        let id = route.id.clone();
        let doc = self
            .document
            .update(|routes| {
                let stored_version = routes
                    .iter()
                    .find(|r| r.id == route.id)
                    .map_or(0, |r| r.version);
                if stored_version != route.version {
                    return Err(RouteError::VersionConflict {
                        id: route.id.clone(),
                        stored: stored_version,
                        submitted: route.version,
                    });
                }
                let mut next = route.clone();
                next.version = stored_version + 1;
                match routes.iter_mut().find(|r| r.id == next.id) {
                    Some(slot) => *slot = next,
                    None => routes.push(next),
                }
                Ok(())
            })
            .await?;

        let stored = doc
            .data
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| RouteError::UnknownRoute { id: id.clone() })?;
        tracing::info!(route = %id, version = stored.version, "Route upserted");
        self.install(doc);
        Ok(stored)
    }

    /// Remove a route by id.
    pub async fn delete(&self, id: &str) -> Result<(), RouteError> {
        let doc = self
            .document
            .update(|routes| {
                let before = routes.len();
                routes.retain(|r| r.id != id);
                if routes.len() == before {
                    return Err(RouteError::UnknownRoute { id: id.to_string() });
                }
                Ok(())
            })
            .await?;
        tracing::info!(route = %id, "Route deleted");
        self.install(doc);
        Ok(())
    }

    /// Write `routes` as the initial table if the store has none yet.
    pub async fn seed_if_empty(&self, routes: Vec<Route>) -> Result<bool, RouteError> {
        for route in &routes {
            route.validate()?;
        }
        let routes: Vec<Route> = routes
            .into_iter()
            .map(|mut r| {
                r.version = 1;
                r
            })
            .collect();
        Ok(self.document.seed_if_absent(routes).await?)
    }

    /// Load the table now and follow change notifications until `cancel` fires.
    pub fn start_sync(
        self: &Arc<Self>,
        settings: SyncSettings,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let table = Arc::clone(self);
        spawn_follower(self.document.clone(), settings, cancel, move |doc| {
            table.install(doc)
        })
    }

    /// Swap in a snapshot built from `doc` unless an equal or newer one is installed.
    fn install(&self, doc: Versioned<Vec<Route>>) {
        let version = doc.version;
        let candidate = Arc::new(RouteSnapshot::build(version, doc.data));
        let previous = self.current.rcu(|current| {
            if current.version >= version {
                Arc::clone(current)
            } else {
                Arc::clone(&candidate)
            }
        });
        if previous.version < version {
            tracing::info!(
                version,
                routes = candidate.len(),
                "Route table snapshot installed"
            );
            metrics::set_route_table_version(version);
            self.changes.send_replace(candidate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::MemoryCoordinationStore;

    fn table() -> RouteTable {
        RouteTable::new(
            Arc::new(MemoryCoordinationStore::new()),
            Duration::from_secs(1),
        )
    }

    fn upstream(name: &str) -> Vec<String> {
        vec![format!("http://{name}:8080")]
    }

    fn request<'a>(path: &'a str, host: Option<&'a str>, headers: &'a HeaderMap) -> RouteRequest<'a> {
        RouteRequest {
            path,
            host,
            headers,
        }
    }

    #[tokio::test]
    async fn test_empty_table_is_fail_closed() {
        let table = table();
        let headers = HeaderMap::new();
        assert!(matches!(
            table.lookup(&request("/anything", None, &headers)),
            Err(RouteError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_longest_prefix_wins() {
        let table = table();
        table.upsert(Route::new("root", "/", upstream("root"))).await.unwrap();
        table.upsert(Route::new("api", "/api", upstream("api"))).await.unwrap();
        table
            .upsert(Route::new("users", "/api/users", upstream("users")))
            .await
            .unwrap();

        let headers = HeaderMap::new();
        assert_eq!(table.lookup(&request("/api/users/7", None, &headers)).unwrap().id, "users");
        assert_eq!(table.lookup(&request("/api/orders", None, &headers)).unwrap().id, "api");
        assert_eq!(table.lookup(&request("/static/x", None, &headers)).unwrap().id, "root");
    }

    #[tokio::test]
    async fn test_host_and_header_specificity() {
        let table = table();
        table.upsert(Route::new("generic", "/api", upstream("g"))).await.unwrap();
        table
            .upsert(Route::new("hosted", "/api", upstream("h")).with_host("api.example.com"))
            .await
            .unwrap();
        table
            .upsert(
                Route::new("canary", "/api", upstream("c"))
                    .with_host("api.example.com")
                    .with_header("x-canary", Some("true")),
            )
            .await
            .unwrap();

        let mut headers = HeaderMap::new();
        assert_eq!(
            table.lookup(&request("/api/x", Some("api.example.com:443"), &headers)).unwrap().id,
            "hosted"
        );
        assert_eq!(table.lookup(&request("/api/x", Some("other"), &headers)).unwrap().id, "generic");

        headers.insert("x-canary", "true".parse().unwrap());
        assert_eq!(
            table.lookup(&request("/api/x", Some("API.example.com"), &headers)).unwrap().id,
            "canary"
        );
    }

    #[tokio::test]
    async fn test_ties_broken_by_weight_then_insertion_order() {
        let table = table();
        table.upsert(Route::new("first", "/svc", upstream("a"))).await.unwrap();
        table.upsert(Route::new("second", "/svc", upstream("b"))).await.unwrap();

        let headers = HeaderMap::new();
        for _ in 0..10 {
            assert_eq!(table.lookup(&request("/svc", None, &headers)).unwrap().id, "first");
        }

        table
            .upsert(Route::new("heavy", "/svc", upstream("c")).with_weight(5))
            .await
            .unwrap();
        assert_eq!(table.lookup(&request("/svc", None, &headers)).unwrap().id, "heavy");
    }

    #[tokio::test]
    async fn test_disabled_routes_never_match() {
        let table = table();
        let mut route = Route::new("off", "/off", upstream("off"));
        route.enabled = false;
        table.upsert(route).await.unwrap();

        let headers = HeaderMap::new();
        assert!(table.lookup(&request("/off", None, &headers)).is_err());
        assert_eq!(table.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_version_conflict_detects_stale_copy() {
        let table = table();
        let stored = table.upsert(Route::new("r", "/r", upstream("a"))).await.unwrap();
        assert_eq!(stored.version, 1);

        let mut fresh = stored.clone();
        fresh.upstreams = upstream("b");
        let updated = table.upsert(fresh).await.unwrap();
        assert_eq!(updated.version, 2);

        let mut stale = stored;
        stale.upstreams = upstream("c");
        assert!(matches!(
            table.upsert(stale).await,
            Err(RouteError::VersionConflict { stored: 2, submitted: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_and_unknown_route() {
        let table = table();
        table.upsert(Route::new("r", "/r", upstream("a"))).await.unwrap();
        table.delete("r").await.unwrap();
        assert!(table.snapshot().is_empty());
        assert!(matches!(
            table.delete("r").await,
            Err(RouteError::UnknownRoute { .. })
        ));
    }

    #[tokio::test]
    async fn test_invalid_route_rejected() {
        let table = table();
        assert!(matches!(
            table.upsert(Route::new("bad", "no-slash", upstream("a"))).await,
            Err(RouteError::Invalid(_))
        ));
        assert!(matches!(
            table.upsert(Route::new("bad", "/x", vec!["ftp://x".into()])).await,
            Err(RouteError::Invalid(_))
        ));
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_coordination_error() {
        let store = Arc::new(MemoryCoordinationStore::new());
        let table = RouteTable::new(store.clone(), Duration::from_secs(1));
        store.set_available(false);
        assert!(matches!(
            table.upsert(Route::new("r", "/r", upstream("a"))).await,
            Err(RouteError::Coordination(_))
        ));
    }

    #[tokio::test]
    async fn test_on_change_receives_snapshots() {
        let table = table();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let _handle = table.on_change(move |snapshot| {
            let _ = tx.send(snapshot.version());
        });
        table.upsert(Route::new("r", "/r", upstream("a"))).await.unwrap();
        let version = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lookups_during_swaps_see_whole_snapshots() {
        let table = Arc::new(table());
        table.upsert(Route::new("api", "/api", upstream("api"))).await.unwrap();

        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut readers = Vec::new();
        for _ in 0..3 {
            let table = table.clone();
            let stop = stop.clone();
            readers.push(tokio::spawn(async move {
                let headers = HeaderMap::new();
                let mut last_version = 0;
                let mut checks = 0u64;
                loop {
                    // Odd versions hold only "api"; even versions also hold "churn".
                    let snapshot = table.snapshot();
                    let expected_len = if snapshot.version() % 2 == 0 { 2 } else { 1 };
                    assert_eq!(snapshot.len(), expected_len, "version {}", snapshot.version());
                    assert!(snapshot.version() >= last_version);
                    last_version = snapshot.version();

                    let routed = snapshot.lookup(&request("/api/churn/x", None, &headers)).unwrap();
                    let churn_present = snapshot.routes().iter().any(|r| r.id == "churn");
                    assert_eq!(routed.id == "churn", churn_present);

                    // The table itself never falls back to NotFound mid-swap.
                    assert!(table.lookup(&request("/api/churn/x", None, &headers)).is_ok());
                    checks += 1;
                    if stop.load(std::sync::atomic::Ordering::Relaxed) {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
                checks
            }));
        }

        for _ in 0..100 {
            table
                .upsert(Route::new("churn", "/api/churn", upstream("churn")))
                .await
                .unwrap();
            table.delete("churn").await.unwrap();
        }
        stop.store(true, std::sync::atomic::Ordering::Relaxed);

        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
        assert_eq!(table.snapshot().version(), 201);
    }
}
