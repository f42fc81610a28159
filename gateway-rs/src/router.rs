//! Route table for gateway-rs
//!
//! Maps a request's domain to the backend that serves it. The table is
//! published as an immutable [`RouteSnapshot`] behind an [`ArcSwap`]: an
//! update builds a whole new snapshot and swaps the pointer, so readers on
//! the request and handshake paths never lock and never observe a mix of
//! two updates.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{GatewayError, Result};

/// One domain's forwarding rule
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Route {
    /// Opaque identifier, stable across updates
    #[serde(default)]
    pub id: String,
    /// Fully-qualified hostname (e.g., "app.example.com")
    pub domain: String,
    /// Backend host, reached on the gateway's fixed backend port
    pub backend_address: String,
    /// Disabled routes are kept by the control plane but never matched
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Route {
    /// Create an enabled route
    pub fn new(id: impl Into<String>, domain: impl Into<String>, backend_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            backend_address: backend_address.into(),
            enabled: true,
        }
    }

    /// Same route with a different enabled flag
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// What happened to the entries of one update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotReport {
    /// Routes present in the new snapshot
    pub installed: usize,
    /// Entries skipped because they are disabled
    pub disabled: usize,
    /// Entries replaced by a later entry for the same domain
    pub duplicates: usize,
    /// Ids of entries dropped as malformed
    pub malformed: Vec<String>,
}

/// Immutable domain -> route mapping containing only enabled routes
#[derive(Debug, Clone, Default)]
pub struct RouteSnapshot {
    routes: HashMap<String, Arc<Route>>,
}

impl RouteSnapshot {
    /// Build a snapshot from a full route list
    ///
    /// Disabled and malformed entries are left out. When the list holds
    /// several enabled entries for one domain, the last one wins.
    pub fn build(routes: Vec<Route>, backend_port: u16) -> (Self, SnapshotReport) {
        let mut report = SnapshotReport::default();
        let mut table: HashMap<String, Arc<Route>> = HashMap::with_capacity(routes.len());

        for mut route in routes {
            let domain = normalize_domain(&route.domain);
            let backend = route.backend_address.trim().to_string();

            if domain.is_empty() || !backend_is_valid(&backend, backend_port) {
                report.malformed.push(route.id.clone());
                continue;
            }

            if !route.enabled {
                report.disabled += 1;
                continue;
            }

            route.domain = domain.clone();
            route.backend_address = backend;
            if table.insert(domain, Arc::new(route)).is_some() {
                report.duplicates += 1;
            }
        }

        report.installed = table.len();
        (Self { routes: table }, report)
    }

    /// Look up the route for a domain (case-insensitive)
    pub fn get(&self, domain: &str) -> Option<&Arc<Route>> {
        self.routes.get(&normalize_domain(domain))
    }

    /// Whether a domain has an enabled route
    pub fn contains(&self, domain: &str) -> bool {
        self.get(domain).is_some()
    }

    /// Domains currently routed
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Number of routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether the snapshot holds no routes
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// The current route snapshot, replaced wholesale on every update
pub struct RouteTable {
    current: ArcSwap<RouteSnapshot>,
    backend_port: u16,
}

impl RouteTable {
    /// Create an empty table; routes are validated against `backend_port`
    pub fn new(backend_port: u16) -> Self {
        Self {
            current: ArcSwap::from_pointee(RouteSnapshot::default()),
            backend_port,
        }
    }

    /// Replace the whole table with the given routes
    ///
    /// Readers holding the previous snapshot keep seeing it until they
    /// drop it; lookups started after the swap see the new one.
    pub fn replace(&self, routes: Vec<Route>) -> SnapshotReport {
        let (snapshot, report) = RouteSnapshot::build(routes, self.backend_port);
        self.current.store(Arc::new(snapshot));
        report
    }

    /// Point lookup against the current snapshot
    pub fn lookup(&self, domain: &str) -> Option<Arc<Route>> {
        self.current.load().get(domain).cloned()
    }

    /// Like [`lookup`](Self::lookup), with a routing error for unknown hosts
    pub fn resolve(&self, host: &str) -> Result<Arc<Route>> {
        self.lookup(host).ok_or_else(|| GatewayError::RouteNotFound {
            host: host.to_string(),
        })
    }

    /// The current snapshot, valid for as long as the caller holds it
    pub fn snapshot(&self) -> Arc<RouteSnapshot> {
        self.current.load_full()
    }

    /// Port backends are reached on
    pub fn backend_port(&self) -> u16 {
        self.backend_port
    }

    /// Number of routes in the current snapshot
    pub fn len(&self) -> usize {
        self.current.load().len()
    }

    /// Whether the current snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }
}

/// Lowercase, trim, and drop a trailing dot
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Strip the port from a Host header value, keeping IPv6 literals intact
pub fn host_without_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// `host:port` for a backend, bracketing IPv6 literals
pub fn backend_authority(backend: &str, port: u16) -> String {
    if backend.contains(':') && !backend.starts_with('[') {
        format!("[{}]:{}", backend, port)
    } else {
        format!("{}:{}", backend, port)
    }
}

fn backend_is_valid(backend: &str, backend_port: u16) -> bool {
    if backend.is_empty() || backend.contains('/') {
        return false;
    }
    url::Url::parse(&format!("http://{}", backend_authority(backend, backend_port)))
        .map(|u| u.host_str().is_some())
        .unwrap_or(false)
}
