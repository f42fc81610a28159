//! TLS configuration for the HTTPS listener
//!
//! No certificate is loaded up front. The listener reads each ClientHello,
//! has the [`CertificateManager`] produce a certificate for its server name,
//! and the [`CertificateResolver`] below hands that certificate to rustls.

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::{self, CertifiedKey};
use rustls::{cipher_suite, version, ServerConfig, SupportedCipherSuite};
use rustls_pemfile::Item;
use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use crate::acme::CertificateManager;
use crate::error::{GatewayError, Result};

/// A decoded certificate chain with its signing key and expiry
#[derive(Clone)]
pub struct LoadedCertificate {
    /// Chain and key in rustls form
    pub key: Arc<CertifiedKey>,
    /// Leaf `notAfter`, seconds since the Unix epoch
    pub not_after: i64,
}

impl LoadedCertificate {
    /// Decode a PEM certificate chain and PEM private key
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let mut cert_reader = BufReader::new(cert_pem.as_bytes());
        let certs_der = rustls_pemfile::certs(&mut cert_reader)
            .map_err(|e| GatewayError::Tls(format!("Failed to read certificates: {}", e)))?;

        let Some(leaf) = certs_der.first() else {
            return Err(GatewayError::Tls("No certificates found in PEM".to_string()));
        };
        let not_after = leaf_not_after(leaf)?;

        let mut key_reader = BufReader::new(key_pem.as_bytes());
        let key_der = rustls_pemfile::read_all(&mut key_reader)
            .map_err(|e| GatewayError::Tls(format!("Failed to read private key: {}", e)))?
            .into_iter()
            .find_map(|item| match item {
                Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(key),
                _ => None,
            })
            .ok_or_else(|| GatewayError::Tls("No private key found in PEM".to_string()))?;

        let signing_key = sign::any_supported_type(&rustls::PrivateKey(key_der))
            .map_err(|e| GatewayError::Tls(format!("Unsupported private key: {}", e)))?;

        let chain = certs_der.into_iter().map(rustls::Certificate).collect();

        Ok(Self {
            key: Arc::new(CertifiedKey::new(chain, signing_key)),
            not_after,
        })
    }

    /// Whether the certificate is past its `notAfter`
    pub fn is_expired(&self) -> bool {
        self.not_after <= now()
    }

    /// Whether the certificate expires within `window`
    pub fn expires_within(&self, window: Duration) -> bool {
        self.not_after - now() <= window.as_secs() as i64
    }
}

fn leaf_not_after(der: &[u8]) -> Result<i64> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| GatewayError::Tls(format!("Failed to parse certificate: {}", e)))?;
    Ok(cert.validity().not_after.timestamp())
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Serves certificates the manager has already loaded for a server name
pub struct CertificateResolver {
    manager: Arc<CertificateManager>,
}

impl CertificateResolver {
    /// Create a resolver reading from `manager`
    pub fn new(manager: Arc<CertificateManager>) -> Self {
        Self { manager }
    }
}

impl ResolvesServerCert for CertificateResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?;
        self.manager.cached(name).map(|loaded| loaded.key)
    }
}

/// Modern AEAD suites only; TLS 1.2 is limited to ECDHE key exchange
fn cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        cipher_suite::TLS13_AES_256_GCM_SHA384,
        cipher_suite::TLS13_AES_128_GCM_SHA256,
        cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// Build the rustls server config for the HTTPS listener
pub fn build_server_config(resolver: Arc<dyn ResolvesServerCert>) -> Result<Arc<ServerConfig>> {
    let mut config = ServerConfig::builder()
        .with_cipher_suites(&cipher_suites())
        .with_safe_default_kx_groups()
        .with_protocol_versions(&[&version::TLS13, &version::TLS12])
        .map_err(|e| GatewayError::Tls(format!("TLS config error: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(domain: &str) -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    #[test]
    fn test_load_self_signed() {
        let (cert_pem, key_pem) = self_signed("a.example");
        let loaded = LoadedCertificate::from_pem(&cert_pem, &key_pem).unwrap();

        assert_eq!(loaded.key.cert.len(), 1);
        assert!(!loaded.is_expired());
        assert!(!loaded.expires_within(Duration::from_secs(24 * 60 * 60)));
    }

    #[test]
    fn test_rejects_missing_key() {
        let (cert_pem, _) = self_signed("a.example");
        let result = LoadedCertificate::from_pem(&cert_pem, "");
        assert!(matches!(result, Err(GatewayError::Tls(_))));
    }

    #[test]
    fn test_rejects_missing_certificate() {
        let (_, key_pem) = self_signed("a.example");
        let result = LoadedCertificate::from_pem("", &key_pem);
        assert!(matches!(result, Err(GatewayError::Tls(_))));
    }

    #[test]
    fn test_build_server_config() {
        struct NoCerts;
        impl ResolvesServerCert for NoCerts {
            fn resolve(&self, _: ClientHello) -> Option<Arc<CertifiedKey>> {
                None
            }
        }

        let config = build_server_config(Arc::new(NoCerts)).unwrap();
        assert_eq!(config.alpn_protocols[0], b"h2".to_vec());
    }
}
