//! gateway-rs: domain-routed reverse proxy with on-demand TLS
//!
//! Forwards each request to the backend registered for its host name and
//! terminates TLS with certificates obtained from Let's Encrypt the first
//! time a routed name is seen.
//!
//! # Features
//!
//! - Host-based routing from an atomically replaced route table
//! - Automatic TLS via ACME HTTP-01, limited to routed domains
//! - On-disk certificate cache with background renewal
//! - HTTP to HTTPS redirect
//! - Graceful shutdown with a deadline
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! http_addr = "0.0.0.0:80"
//! https_addr = "0.0.0.0:443"
//!
//! [acme]
//! enabled = true
//! email = "admin@example.com"
//! cache_dir = "/var/lib/gateway-rs/acme"
//!
//! [[routes]]
//! id = "tenant-1"
//! domain = "app.example.com"
//! backend_address = "10.1.0.100"
//!
//! [[routes]]
//! id = "tenant-2"
//! domain = "shop.example.com"
//! backend_address = "10.1.0.101"
//! enabled = false
//! ```

pub mod acme;
pub mod config;
pub mod error;
pub mod policy;
pub mod proxy;
pub mod router;
pub mod server;
pub mod tls;

pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use router::{Route, RouteTable};
pub use server::{GatewayServer, ListenerState, Listeners, ShutdownReport};
