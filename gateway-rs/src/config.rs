//! Configuration for gateway-rs

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, Result};
use crate::router::Route;

/// Environment variable prefix, e.g. `GATEWAY__ACME__EMAIL`
pub const ENV_PREFIX: &str = "GATEWAY";

/// Largest accepted `acme.renew_before_days`
pub const MAX_RENEW_BEFORE_DAYS: u64 = 365;

/// Main gateway configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Automatic certificate configuration
    #[serde(default)]
    pub acme: AcmeConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Initial route table
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Plain HTTP listen address (e.g., "0.0.0.0:80")
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// HTTPS listen address (e.g., "0.0.0.0:443")
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// Port every backend is reached on
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
    /// Grace period for in-flight requests at shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_seconds: u64,
    /// How often certificates are checked for renewal
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_seconds: u64,
    /// Time a client gets to complete the TLS handshake
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_seconds: u64,
}

/// Which certificate authority backs the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IssuerKind {
    /// ACME directory (Let's Encrypt by default)
    Acme,
    /// Local self-signed certificates (development)
    SelfSigned,
}

/// ACME configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AcmeConfig {
    /// Run the HTTPS listener with automatic certificates
    #[serde(default)]
    pub enabled: bool,
    /// ACME account contact email
    #[serde(default)]
    pub email: String,
    /// Use the Let's Encrypt staging directory
    #[serde(default)]
    pub staging: bool,
    /// Certificate cache directory
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    /// Explicit ACME directory URL, overrides `staging`
    pub directory_url: Option<String>,
    /// Renew certificates this many days before expiry
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,
    /// Certificate source
    #[serde(default = "default_issuer")]
    pub issuer: IssuerKind,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// "pretty" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_backend_port() -> u16 {
    80
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_renewal_interval() -> u64 {
    12 * 60 * 60
}

fn default_handshake_timeout() -> u64 {
    10
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./cache/acme")
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_issuer() -> IssuerKind {
    IssuerKind::Acme
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            backend_port: default_backend_port(),
            shutdown_timeout_seconds: default_shutdown_timeout(),
            renewal_interval_seconds: default_renewal_interval(),
            handshake_timeout_seconds: default_handshake_timeout(),
        }
    }
}

impl Default for AcmeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            email: String::new(),
            staging: false,
            cache_dir: default_cache_dir(),
            directory_url: None,
            renew_before_days: default_renew_before_days(),
            issuer: default_issuer(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from an optional TOML file overlaid with
    /// `GATEWAY__*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: Self = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| GatewayError::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Create a default development configuration
    pub fn development() -> Self {
        Self {
            server: ServerConfig {
                http_addr: "127.0.0.1:8080".to_string(),
                https_addr: "127.0.0.1:8443".to_string(),
                ..ServerConfig::default()
            },
            acme: AcmeConfig::default(),
            logging: LoggingConfig::default(),
            routes: vec![Route::new("dev", "localhost", "127.0.0.1")],
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [("http_addr", &self.server.http_addr), ("https_addr", &self.server.https_addr)] {
            addr.parse::<SocketAddr>().map_err(|e| {
                GatewayError::Config(format!("Invalid server.{} '{}': {}", name, addr, e))
            })?;
        }

        if self.server.backend_port == 0 {
            return Err(GatewayError::Config("server.backend_port must not be 0".to_string()));
        }

        if self.acme.enabled && self.acme.issuer == IssuerKind::Acme && self.acme.email.trim().is_empty() {
            return Err(GatewayError::Config(
                "acme.email is required when ACME is enabled".to_string(),
            ));
        }

        if self.server.handshake_timeout_seconds == 0 {
            return Err(GatewayError::Config(
                "server.handshake_timeout_seconds must not be 0".to_string(),
            ));
        }

        if self.acme.renew_before_days > MAX_RENEW_BEFORE_DAYS {
            return Err(GatewayError::Config(format!(
                "acme.renew_before_days must be at most {}, got {}",
                MAX_RENEW_BEFORE_DAYS, self.acme.renew_before_days
            )));
        }

        if let Some(url) = &self.acme.directory_url {
            url::Url::parse(url).map_err(|e| {
                GatewayError::Config(format!("Invalid acme.directory_url '{}': {}", url, e))
            })?;
        }

        Ok(())
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::development()
    }
}
