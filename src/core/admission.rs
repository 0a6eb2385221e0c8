//! Admission control by client address.
//!
//! The active [`AdmissionPolicy`] is compiled once per change into an exact
//! address set, anchored wildcard regexes and CIDR ranges, then swapped in
//! atomically. Requests only ever read the compiled form.
use std::{
    collections::HashSet,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use arc_swap::ArcSwap;
use http::{HeaderMap, HeaderName};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        ip_network::{IpRange, canonical, is_internal, parse_client_address},
        sync::{SharedDocument, SyncSettings, Versioned, spawn_follower},
    },
    ports::coordination_store::{CoordinationStore, StoreError},
};

const ADMISSION_DOCUMENT: &str = "admission";

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AdmissionError {
    /// Policy denied the resolved client address
    #[error("Client address {address} is not admitted")]
    Forbidden { address: IpAddr },

    /// Neither forwarding headers nor the transport peer yielded an address
    #[error("Unable to determine the client address")]
    ClientAddressUnresolvable,

    #[error("Invalid admission entry '{entry}': {reason}")]
    InvalidPattern { entry: String, reason: String },

    #[error(transparent)]
    Coordination(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionMode {
    /// Only listed addresses are admitted
    #[serde(alias = "ALLOW_LIST")]
    AllowList,
    /// Everything except listed addresses is admitted
    #[default]
    #[serde(alias = "DENY_LIST")]
    DenyList,
}

/// Operator-facing admission policy.
///
/// Entries are literal addresses (`203.0.113.9`), wildcard patterns
/// (`192.168.*`) or CIDR ranges (`10.0.0.0/8`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AdmissionPolicy {
    #[serde(default)]
    pub mode: AdmissionMode,
    #[serde(default)]
    pub entries: Vec<String>,
    #[serde(default)]
    pub exempt_internal_networks: bool,
}

impl AdmissionPolicy {
    pub fn allow_list<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: AdmissionMode::AllowList,
            entries: entries.into_iter().map(Into::into).collect(),
            exempt_internal_networks: false,
        }
    }

    pub fn deny_list<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            mode: AdmissionMode::DenyList,
            entries: entries.into_iter().map(Into::into).collect(),
            exempt_internal_networks: false,
        }
    }

    pub fn exempting_internal_networks(mut self) -> Self {
        self.exempt_internal_networks = true;
        self
    }
}

/// Policy pre-indexed for per-request evaluation.
#[derive(Debug)]
pub struct CompiledPolicy {
    version: u64,
    policy: AdmissionPolicy,
    exact: HashSet<IpAddr>,
    patterns: Vec<Regex>,
    ranges: Vec<IpRange>,
}

impl CompiledPolicy {
    pub fn compile(policy: AdmissionPolicy) -> Result<Self, AdmissionError> {
        Self::compile_versioned(0, policy)
    }

    fn compile_versioned(version: u64, policy: AdmissionPolicy) -> Result<Self, AdmissionError> {
        let mut exact = HashSet::new();
        let mut patterns = Vec::new();
        let mut ranges = Vec::new();

        for entry in &policy.entries {
            let trimmed = entry.trim();
            let invalid = |reason: String| AdmissionError::InvalidPattern {
                entry: entry.clone(),
                reason,
            };
            if trimmed.is_empty() {
                return Err(invalid("entry is empty".to_string()));
            }
            if trimmed.contains('*') {
                let body = regex::escape(trimmed).replace(r"\*", ".*");
                let regex = Regex::new(&format!("^{body}$")).map_err(|e| invalid(e.to_string()))?;
                patterns.push(regex);
            } else if trimmed.contains('/') {
                ranges.push(trimmed.parse::<IpRange>().map_err(|e| invalid(e.to_string()))?);
            } else {
                let ip = parse_client_address(trimmed)
                    .ok_or_else(|| invalid("not an IP address, wildcard or CIDR range".to_string()))?;
                exact.insert(ip);
            }
        }

        Ok(Self {
            version,
            policy,
            exact,
            patterns,
            ranges,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    fn matches(&self, address: IpAddr) -> bool {
        if self.exact.contains(&address) {
            return true;
        }
        if self.ranges.iter().any(|r| r.contains(address)) {
            return true;
        }
        if self.patterns.is_empty() {
            return false;
        }
        let text = address.to_string();
        self.patterns.iter().any(|p| p.is_match(&text))
    }

    /// A deny-list match always denies; the internal-network exemption only
    /// bypasses allow-list membership.
    pub fn admits(&self, address: IpAddr) -> bool {
        let listed = self.matches(address);
        match self.policy.mode {
            AdmissionMode::DenyList => !listed,
            AdmissionMode::AllowList => {
                listed || (self.policy.exempt_internal_networks && is_internal(address))
            }
        }
    }
}

/// Which entry of a multi-hop forwarding header names the client.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ForwardedStrategy {
    /// The first entry among at most `max_hops` from the left.
    #[default]
    LeftMost,
    /// Only the right-most `max_hops` entries were appended by trusted
    /// proxies; the left-most of those is used.
    RightMostTrusted,
}

/// Resolves the effective client address from a proxy chain.
#[derive(Debug, Clone)]
pub struct ClientAddressResolver {
    forwarded_header: Option<HeaderName>,
    max_hops: usize,
    strategy: ForwardedStrategy,
}

impl Default for ClientAddressResolver {
    fn default() -> Self {
        Self::new(Some(HeaderName::from_static("x-forwarded-for")), 1)
    }
}

impl ClientAddressResolver {
    pub fn new(forwarded_header: Option<HeaderName>, max_hops: usize) -> Self {
        Self {
            forwarded_header,
            max_hops,
            strategy: ForwardedStrategy::default(),
        }
    }

    pub fn with_strategy(mut self, strategy: ForwardedStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Ignore forwarding headers; use only the transport peer.
    pub fn peer_only() -> Self {
        Self::new(None, 0)
    }

    /// Pick the client address from the forwarding header, falling back to
    /// the transport peer. `max_hops` bounds how many entries are considered.
    pub fn resolve(
        &self,
        headers: &HeaderMap,
        peer: Option<IpAddr>,
    ) -> Result<IpAddr, AdmissionError> {
        if let Some(name) = self.forwarded_header.as_ref().filter(|_| self.max_hops > 0) {
            let hops: Vec<&str> = headers
                .get_all(name)
                .iter()
                .filter_map(|v| v.to_str().ok())
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|hop| !hop.is_empty())
                .collect();
            let candidate = match self.strategy {
                ForwardedStrategy::LeftMost => hops
                    .iter()
                    .take(self.max_hops)
                    .find_map(|hop| parse_client_address(hop)),
                ForwardedStrategy::RightMostTrusted => hops[hops.len().saturating_sub(self.max_hops)..]
                    .first()
                    .and_then(|hop| parse_client_address(hop)),
            };
            if let Some(address) = candidate {
                return Ok(address);
            }
            if !hops.is_empty() {
                tracing::debug!(header = %name, "Unparseable forwarded address, using peer address");
            }
        }
        peer.map(canonical)
            .ok_or(AdmissionError::ClientAddressUnresolvable)
    }
}

/// Hot-reloadable admission filter.
pub struct AdmissionFilter {
    current: ArcSwap<CompiledPolicy>,
    document: Arc<SharedDocument<AdmissionPolicy>>,
    resolver: ClientAddressResolver,
}

impl AdmissionFilter {
    /// Start with `initial` as the local policy until the shared one is loaded.
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        op_timeout: Duration,
        resolver: ClientAddressResolver,
        initial: AdmissionPolicy,
    ) -> Result<Self, AdmissionError> {
        Ok(Self {
            current: ArcSwap::from_pointee(CompiledPolicy::compile(initial)?),
            document: Arc::new(SharedDocument::new(store, ADMISSION_DOCUMENT, op_timeout)),
            resolver,
        })
    }

    pub fn is_admitted(&self, address: IpAddr) -> bool {
        self.current.load().admits(address)
    }

    /// Resolve the client address and evaluate the active policy.
    pub fn check(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<IpAddr, AdmissionError> {
        let address = self.resolver.resolve(headers, peer)?;
        if self.is_admitted(address) {
            Ok(address)
        } else {
            tracing::debug!(%address, "Admission denied");
            Err(AdmissionError::Forbidden { address })
        }
    }

    pub fn resolver(&self) -> &ClientAddressResolver {
        &self.resolver
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.current.load().policy().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version()
    }

    /// Replace the shared policy. The policy is compiled before anything is written.
    pub async fn replace_policy(&self, policy: AdmissionPolicy) -> Result<AdmissionPolicy, AdmissionError> {
        CompiledPolicy::compile(policy.clone())?;
        let doc = self
            .document
            .update(|current| {
                *current = policy.clone();
                Ok::<_, AdmissionError>(())
            })
            .await?;
        self.install(doc.clone());
        Ok(doc.data)
    }

    /// Add an entry to the shared policy. Returns `false` if it was already listed.
    pub async fn add_entry(&self, entry: &str) -> Result<bool, AdmissionError> {
        let entry = entry.trim().to_string();
        let candidate = AdmissionPolicy {
            entries: vec![entry.clone()],
            ..AdmissionPolicy::default()
        };
        CompiledPolicy::compile(candidate)?;

        let mut added = false;
        let doc = self
            .document
            .update(|current| {
                added = !current.entries.contains(&entry);
                if added {
                    current.entries.push(entry.clone());
                }
                Ok::<_, AdmissionError>(())
            })
            .await?;
        self.install(doc);
        Ok(added)
    }

    /// Remove an entry from the shared policy. Returns `false` if it was not listed.
    pub async fn remove_entry(&self, entry: &str) -> Result<bool, AdmissionError> {
        let entry = entry.trim();
        let mut removed = false;
        let doc = self
            .document
            .update(|current| {
                let before = current.entries.len();
                current.entries.retain(|e| e != entry);
                removed = current.entries.len() != before;
                Ok::<_, AdmissionError>(())
            })
            .await?;
        self.install(doc);
        Ok(removed)
    }

    pub async fn seed_if_empty(&self, policy: AdmissionPolicy) -> Result<bool, AdmissionError> {
        CompiledPolicy::compile(policy.clone())?;
        Ok(self.document.seed_if_absent(policy).await?)
    }

    pub fn start_sync(self: &Arc<Self>, settings: SyncSettings, cancel: CancellationToken) -> JoinHandle<()> {
        let filter = Arc::clone(self);
        spawn_follower(self.document.clone(), settings, cancel, move |doc| {
            filter.install(doc)
        })
    }

    fn install(&self, doc: Versioned<AdmissionPolicy>) {
        let version = doc.version;
        if self.current.load().version() >= version {
            return;
        }
        let compiled = match CompiledPolicy::compile_versioned(version, doc.data) {
            Ok(compiled) => Arc::new(compiled),
            Err(e) => {
                tracing::error!(version, "Ignoring shared admission policy: {}", e);
                return;
            }
        };
        let previous = self.current.rcu(|current| {
            if current.version() >= version {
                Arc::clone(current)
            } else {
                Arc::clone(&compiled)
            }
        });
        if previous.version() < version {
            tracing::info!(
                version,
                mode = ?compiled.policy().mode,
                entries = compiled.policy().entries.len(),
                "Admission policy installed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;
    use crate::adapters::memory_store::MemoryCoordinationStore;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn compiled(policy: AdmissionPolicy) -> CompiledPolicy {
        CompiledPolicy::compile(policy).unwrap()
    }

    #[test]
    fn test_wildcard_matching_is_anchored() {
        let policy = compiled(AdmissionPolicy::allow_list(["192.168.*"]));
        assert!(policy.admits(ip("192.168.1.5")));
        assert!(!policy.admits(ip("192.169.1.5")));
        assert!(!policy.admits(ip("10.192.168.1")));
    }

    #[test]
    fn test_allow_list_example() {
        let policy = compiled(AdmissionPolicy::allow_list(["10.0.0.*"]));
        assert!(policy.admits(ip("10.0.0.7")));
        assert!(!policy.admits(ip("10.0.1.7")));
    }

    #[test]
    fn test_allow_list_denies_unlisted() {
        let policy = compiled(AdmissionPolicy::allow_list(["203.0.113.9", "198.51.100.0/24"]));
        assert!(policy.admits(ip("203.0.113.9")));
        assert!(policy.admits(ip("198.51.100.77")));
        assert!(!policy.admits(ip("203.0.113.10")));
    }

    #[test]
    fn test_internal_exemption_only_bypasses_allow_list() {
        let allow = compiled(AdmissionPolicy::allow_list(["203.0.113.9"]).exempting_internal_networks());
        assert!(allow.admits(ip("10.1.2.3")));
        assert!(allow.admits(ip("127.0.0.1")));
        assert!(!allow.admits(ip("8.8.8.8")));

        let deny = compiled(AdmissionPolicy::deny_list(["10.*"]).exempting_internal_networks());
        assert!(!deny.admits(ip("10.1.2.3")));
        assert!(deny.admits(ip("192.168.0.1")));
    }

    #[test]
    fn test_deny_list() {
        let policy = compiled(AdmissionPolicy::deny_list(["203.0.113.*", "2001:db8::/32"]));
        assert!(!policy.admits(ip("203.0.113.4")));
        assert!(!policy.admits(ip("2001:db8::1")));
        assert!(policy.admits(ip("198.51.100.1")));
    }

    #[test]
    fn test_invalid_entries_rejected_at_compile() {
        for bad in ["", "not-an-ip", "10.0.0.0/40"] {
            assert!(matches!(
                CompiledPolicy::compile(AdmissionPolicy::allow_list([bad])),
                Err(AdmissionError::InvalidPattern { .. })
            ));
        }
    }

    #[test]
    fn test_default_resolver_takes_client_nearest_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.2"));
        let peer = Some(ip("10.0.0.1"));

        let resolver = ClientAddressResolver::default();
        assert_eq!(resolver.resolve(&headers, peer).unwrap(), ip("203.0.113.9"));

        // The proxy address on the right never reaches the exemption check.
        let filter =
            CompiledPolicy::compile(AdmissionPolicy::allow_list(["192.0.2.1"]).exempting_internal_networks())
                .unwrap();
        assert!(!filter.admits(resolver.resolve(&headers, peer).unwrap()));
    }

    #[test]
    fn test_left_most_skips_unparseable_within_cap() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("unknown, 203.0.113.9, 10.0.0.2"));
        let peer = Some(ip("10.0.0.1"));
        let header = Some(HeaderName::from_static("x-forwarded-for"));

        let one = ClientAddressResolver::new(header.clone(), 1);
        assert_eq!(one.resolve(&headers, peer).unwrap(), ip("10.0.0.1"));
        let two = ClientAddressResolver::new(header, 2);
        assert_eq!(two.resolve(&headers, peer).unwrap(), ip("203.0.113.9"));
    }

    #[test]
    fn test_right_most_trusted_strategy() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("6.6.6.6, 203.0.113.9, 10.0.0.2"),
        );
        let peer = Some(ip("10.0.0.1"));
        let trusted = |hops| {
            ClientAddressResolver::new(Some(HeaderName::from_static("x-forwarded-for")), hops)
                .with_strategy(ForwardedStrategy::RightMostTrusted)
        };

        assert_eq!(trusted(1).resolve(&headers, peer).unwrap(), ip("10.0.0.2"));
        assert_eq!(trusted(2).resolve(&headers, peer).unwrap(), ip("203.0.113.9"));
        assert_eq!(trusted(10).resolve(&headers, peer).unwrap(), ip("6.6.6.6"));
        assert_eq!(ClientAddressResolver::peer_only().resolve(&headers, peer).unwrap(), ip("10.0.0.1"));
    }

    #[test]
    fn test_resolver_falls_back_and_fails_closed() {
        let resolver = ClientAddressResolver::default();
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));

        assert_eq!(resolver.resolve(&headers, Some(ip("198.51.100.2"))).unwrap(), ip("198.51.100.2"));
        assert!(matches!(
            resolver.resolve(&headers, None),
            Err(AdmissionError::ClientAddressUnresolvable)
        ));
        assert!(matches!(
            resolver.resolve(&HeaderMap::new(), None),
            Err(AdmissionError::ClientAddressUnresolvable)
        ));
    }

    #[tokio::test]
    async fn test_filter_entry_management_and_hot_reload() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let writer = AdmissionFilter::new(
            store.clone(),
            Duration::from_secs(1),
            ClientAddressResolver::peer_only(),
            AdmissionPolicy::default(),
        )
        .unwrap();
        let reader = Arc::new(
            AdmissionFilter::new(
                store,
                Duration::from_secs(1),
                ClientAddressResolver::peer_only(),
                AdmissionPolicy::default(),
            )
            .unwrap(),
        );
        let cancel = CancellationToken::new();
        let _sync = reader.start_sync(SyncSettings::default(), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(writer.add_entry("203.0.113.*").await.unwrap());
        assert!(!writer.add_entry("203.0.113.*").await.unwrap());
        assert!(!writer.is_admitted(ip("203.0.113.5")));

        let mut synced = false;
        for _ in 0..50 {
            if !reader.is_admitted(ip("203.0.113.5")) {
                synced = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(synced, "reader never observed the new policy");

        assert!(writer.remove_entry("203.0.113.*").await.unwrap());
        assert!(writer.is_admitted(ip("203.0.113.5")));
        assert!(matches!(
            writer.add_entry("bogus").await,
            Err(AdmissionError::InvalidPattern { .. })
        ));
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_check_returns_forbidden_with_address() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryCoordinationStore::new());
        let filter = AdmissionFilter::new(
            store,
            Duration::from_secs(1),
            ClientAddressResolver::peer_only(),
            AdmissionPolicy::allow_list(["10.0.0.*"]),
        )
        .unwrap();
        let headers = HeaderMap::new();
        assert_eq!(filter.check(&headers, Some(ip("10.0.0.7"))).unwrap(), ip("10.0.0.7"));
        assert!(matches!(
            filter.check(&headers, Some(ip("10.0.1.7"))),
            Err(AdmissionError::Forbidden { .. })
        ));
    }
}
