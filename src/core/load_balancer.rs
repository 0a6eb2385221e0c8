use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
};

use rand::Rng;
use scc::{HashMap, hash_map::Entry};

use crate::{config::LoadBalanceStrategy, core::route_table::RouteSnapshot};

/// Trait defining the interface for upstream selection strategies
pub trait LoadBalancingStrategy: Send + Sync + 'static {
    /// Select an upstream from a route's target list
    fn select_target<'a>(&self, targets: &'a [String]) -> Option<&'a str>;
}

/// Round-robin selection
#[derive(Default)]
pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_target<'a>(&self, targets: &'a [String]) -> Option<&'a str> {
        if targets.is_empty() {
            return None;
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed);
        Some(targets[count % targets.len()].as_str())
    }
}

/// Uniformly random selection
pub struct RandomStrategy;

impl LoadBalancingStrategy for RandomStrategy {
    fn select_target<'a>(&self, targets: &'a [String]) -> Option<&'a str> {
        if targets.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..targets.len());
        Some(targets[index].as_str())
    }
}

/// Always the first listed upstream (primary with manual failover).
pub struct FirstStrategy;

impl LoadBalancingStrategy for FirstStrategy {
    fn select_target<'a>(&self, targets: &'a [String]) -> Option<&'a str> {
        targets.first().map(String::as_str)
    }
}

/// Per-route upstream selector.
///
/// Round-robin cursors are kept per route id so that routes do not perturb each
/// other's rotation. Cursors of deleted routes are dropped by [`Self::prune`].
#[derive(Default)]
pub struct LoadBalancer {
    round_robin: HashMap<String, Arc<RoundRobinStrategy>>,
    pruned_version: AtomicU64,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop cursors for routes absent from `snapshot`. Each snapshot version
    /// is scanned at most once.
    pub async fn prune(&self, snapshot: &RouteSnapshot) {
        let version = snapshot.version();
        if self.pruned_version.fetch_max(version, Ordering::AcqRel) >= version {
            return;
        }
        let live: HashSet<&str> = snapshot.routes().iter().map(|r| r.id.as_str()).collect();
        self.round_robin
            .retain_async(|id, _| live.contains(id.as_str()))
            .await;
    }

    /// Number of routes with a round-robin cursor.
    pub fn tracked_routes(&self) -> usize {
        self.round_robin.len()
    }

    /// Pick an upstream for `route_id` out of `targets` using `strategy`.
    pub async fn select<'a>(
        &self,
        route_id: &str,
        strategy: LoadBalanceStrategy,
        targets: &'a [String],
    ) -> Option<&'a str> {
        match strategy {
            LoadBalanceStrategy::RoundRobin => {
                let cursor = match self.round_robin.entry_async(route_id.to_string()).await {
                    Entry::Occupied(entry) => entry.get().clone(),
                    Entry::Vacant(entry) => {
                        let cursor = Arc::new(RoundRobinStrategy::default());
                        entry.insert_entry(cursor.clone());
                        cursor
                    }
                };
                cursor.select_target(targets)
            }
            LoadBalanceStrategy::Random => RandomStrategy.select_target(targets),
            LoadBalanceStrategy::First => FirstStrategy.select_target(targets),
        }
    }
}
