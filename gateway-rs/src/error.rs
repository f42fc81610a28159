//! Error types for gateway-rs

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Backend connection error
    #[error("Backend connection error: {0}")]
    BackendConnection(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// ACME protocol or certificate storage error
    #[error("ACME error: {0}")]
    Acme(String),

    /// Certificate issuance refused by the host policy
    #[error("Certificate denied: domain not configured: {domain}")]
    CertificateDenied { domain: String },

    /// Route not found
    #[error("No route found for {host}")]
    RouteNotFound { host: String },

    /// Listener shutdown did not complete cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}
