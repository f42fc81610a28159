//! Host policy for automatic certificates
//!
//! The certificate manager asks a [`HostPolicy`] before obtaining or
//! renewing a certificate. The gateway's policy allows exactly the domains
//! that have an enabled route in the current table.

use std::sync::Arc;
use thiserror::Error;

use crate::router::RouteTable;

/// Reason a certificate request was refused
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("domain not configured: {domain}")]
pub struct PolicyDenied {
    /// Requested server name
    pub domain: String,
}

/// Decides whether a certificate may be issued for a server name
///
/// Runs on the TLS handshake path: implementations must be fast and free
/// of side effects.
pub trait HostPolicy: Send + Sync {
    /// `Ok(())` if certificates may be obtained for `server_name`
    fn allow(&self, server_name: &str) -> Result<(), PolicyDenied>;
}

/// Allows a name iff the current route table routes it
pub struct RouteTablePolicy {
    table: Arc<RouteTable>,
}

impl RouteTablePolicy {
    /// Create a policy over a route table
    pub fn new(table: Arc<RouteTable>) -> Self {
        Self { table }
    }
}

impl HostPolicy for RouteTablePolicy {
    fn allow(&self, server_name: &str) -> Result<(), PolicyDenied> {
        // Snapshots only hold enabled routes, so presence is enough.
        if self.table.snapshot().contains(server_name) {
            Ok(())
        } else {
            Err(PolicyDenied {
                domain: server_name.to_string(),
            })
        }
    }
}
