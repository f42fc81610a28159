//! ACME (Let's Encrypt) certificate management
//!
//! Certificates are obtained on demand: the first TLS handshake for a
//! server name asks [`CertificateManager::get_certificate`], which checks
//! the host policy, then the in-memory cache, then the on-disk cache, and
//! only then runs an issuance. Issuance goes through a
//! [`CertificateIssuer`], normally [`AcmeIssuer`] answering HTTP-01
//! challenges from the shared [`ChallengeStore`].

use async_trait::async_trait;
use dashmap::DashMap;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, KeyPair};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{AcmeConfig, IssuerKind};
use crate::error::{GatewayError, Result};
use crate::policy::HostPolicy;
use crate::router::normalize_domain;
use crate::tls::LoadedCertificate;

/// Path prefix the certificate authority fetches HTTP-01 responses from
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

/// Upper bound for one issuance, independent of the handshake that asked
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// ACME challenge token storage for HTTP-01 validation
pub struct ChallengeStore {
    /// Map of token -> key authorization
    challenges: DashMap<String, String>,
}

impl ChallengeStore {
    /// Create a new challenge store
    pub fn new() -> Self {
        Self {
            challenges: DashMap::new(),
        }
    }

    /// Add a challenge response
    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        self.challenges.insert(token.to_string(), key_authorization.to_string());
        debug!("Added ACME challenge for token: {}", token);
    }

    /// Get a challenge response
    pub fn get_challenge(&self, token: &str) -> Option<String> {
        self.challenges.get(token).map(|entry| entry.value().clone())
    }

    /// Remove a challenge (after validation)
    pub fn remove_challenge(&self, token: &str) {
        self.challenges.remove(token);
        debug!("Removed ACME challenge for token: {}", token);
    }

    /// Number of published challenges
    pub fn len(&self) -> usize {
        self.challenges.len()
    }

    /// Whether no challenge is published
    pub fn is_empty(&self) -> bool {
        self.challenges.is_empty()
    }
}

impl Default for ChallengeStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Challenge responses published for one order
///
/// Every token published through it is withdrawn when it is dropped, also
/// when the order is abandoned halfway.
pub struct PublishedChallenges {
    store: Arc<ChallengeStore>,
    tokens: Vec<String>,
}

impl PublishedChallenges {
    /// Start publishing into `store`
    pub fn new(store: Arc<ChallengeStore>) -> Self {
        Self {
            store,
            tokens: Vec::new(),
        }
    }

    /// Serve `key_authorization` for `token` until dropped
    pub fn publish(&mut self, token: &str, key_authorization: &str) {
        self.store.add_challenge(token, key_authorization);
        self.tokens.push(token.to_string());
    }
}

impl Drop for PublishedChallenges {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.store.remove_challenge(token);
        }
    }
}

/// PEM material produced by an issuer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    /// Certificate chain, leaf first
    pub cert_pem: String,
    /// Private key
    pub key_pem: String,
}

/// Certificate storage paths
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    /// Directory holding one domain's files
    pub cert_dir: PathBuf,
    /// Certificate file path
    pub cert_path: PathBuf,
    /// Private key file path
    pub key_path: PathBuf,
}

impl CertificatePaths {
    /// Certificate paths for a domain under the cache directory
    pub fn for_domain(base_dir: &Path, domain: &str) -> Self {
        let cert_dir = base_dir.join(domain);
        Self {
            cert_path: cert_dir.join("cert.pem"),
            key_path: cert_dir.join("key.pem"),
            cert_dir,
        }
    }

    /// Check if certificate files exist
    pub fn exists(&self) -> bool {
        self.cert_path.exists() && self.key_path.exists()
    }
}

/// On-disk certificate cache, so restarts do not re-issue
#[derive(Debug, Clone)]
pub struct CertificateStore {
    dir: PathBuf,
}

impl CertificateStore {
    /// Open the cache, creating the directory (mode 0700) if needed
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { dir: dir.into() };
        create_private_dir(&store.dir)?;
        Ok(store)
    }

    /// Cache directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Paths for a domain, refusing names that would escape the cache
    pub fn paths(&self, domain: &str) -> Result<CertificatePaths> {
        if domain.is_empty()
            || domain.starts_with('.')
            || domain.contains(['/', '\\'])
            || domain.contains("..")
        {
            return Err(GatewayError::Acme(format!(
                "Refusing to cache certificate for '{}'",
                domain
            )));
        }
        Ok(CertificatePaths::for_domain(&self.dir, domain))
    }

    /// Load a cached certificate, if present
    pub fn load(&self, domain: &str) -> Result<Option<IssuedCertificate>> {
        let paths = self.paths(domain)?;
        if !paths.exists() {
            return Ok(None);
        }

        let cert_pem = fs::read_to_string(&paths.cert_path)
            .map_err(|e| GatewayError::Acme(format!("Failed to read certificate: {}", e)))?;
        let key_pem = fs::read_to_string(&paths.key_path)
            .map_err(|e| GatewayError::Acme(format!("Failed to read private key: {}", e)))?;

        Ok(Some(IssuedCertificate { cert_pem, key_pem }))
    }

    /// Persist a certificate and key (mode 0600)
    pub fn save(&self, domain: &str, issued: &IssuedCertificate) -> Result<()> {
        let paths = self.paths(domain)?;
        create_private_dir(&paths.cert_dir)?;
        write_private_file(&paths.cert_path, issued.cert_pem.as_bytes())?;
        write_private_file(&paths.key_path, issued.key_pem.as_bytes())?;
        debug!("Certificate for {} written to {:?}", domain, paths.cert_path);
        Ok(())
    }

    fn account_path(&self) -> PathBuf {
        self.dir.join("account.json")
    }

    /// Load saved ACME account credentials
    pub fn load_account(&self) -> Result<Option<AccountCredentials>> {
        let path = self.account_path();
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| GatewayError::Acme(format!("Failed to read account: {}", e)))?;
        let credentials = serde_json::from_str(&content)
            .map_err(|e| GatewayError::Acme(format!("Failed to parse account: {}", e)))?;
        Ok(Some(credentials))
    }

    /// Save ACME account credentials
    pub fn save_account(&self, credentials: &AccountCredentials) -> Result<()> {
        let content = serde_json::to_vec_pretty(credentials)
            .map_err(|e| GatewayError::Acme(format!("Failed to encode account: {}", e)))?;
        write_private_file(&self.account_path(), &content)
    }
}

fn create_private_dir(dir: &Path) -> Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .map_err(|e| GatewayError::Acme(format!("Failed to create cache directory {:?}: {}", dir, e)))
}

fn write_private_file(path: &Path, content: &[u8]) -> Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options
        .open(path)
        .map_err(|e| GatewayError::Acme(format!("Failed to open {:?}: {}", path, e)))?;
    file.write_all(content)
        .map_err(|e| GatewayError::Acme(format!("Failed to write {:?}: {}", path, e)))
}

/// Something that can produce a certificate for a domain
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    /// Obtain a fresh certificate for `domain`
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate>;
}

/// Issues self-signed certificates, for development and tests
#[derive(Debug, Default)]
pub struct SelfSignedIssuer;

#[async_trait]
impl CertificateIssuer for SelfSignedIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate> {
        warn!("Issuing self-signed certificate for {}", domain);
        let cert = rcgen::generate_simple_self_signed(vec![domain.to_string()])
            .map_err(|e| GatewayError::Acme(format!("Failed to generate certificate: {}", e)))?;

        Ok(IssuedCertificate {
            cert_pem: cert.cert.pem(),
            key_pem: cert.key_pair.serialize_pem(),
        })
    }
}

/// ACME v2 client answering HTTP-01 challenges
pub struct AcmeIssuer {
    /// ACME directory URL
    directory_url: String,
    /// Contact email
    email: String,
    /// Account credentials live next to the certificates
    store: CertificateStore,
    /// Challenge store served by the HTTP listener
    challenges: Arc<ChallengeStore>,
    /// Account, created or loaded on first use
    account: Mutex<Option<Account>>,
}

impl AcmeIssuer {
    /// Create a new ACME issuer
    pub fn new(
        directory_url: String,
        email: String,
        store: CertificateStore,
        challenges: Arc<ChallengeStore>,
    ) -> Self {
        Self {
            directory_url,
            email,
            store,
            challenges,
            account: Mutex::new(None),
        }
    }

    /// Create for Let's Encrypt production
    pub fn lets_encrypt_production(email: String, store: CertificateStore, challenges: Arc<ChallengeStore>) -> Self {
        Self::new(LetsEncrypt::Production.url().to_string(), email, store, challenges)
    }

    /// Create for Let's Encrypt staging (testing)
    pub fn lets_encrypt_staging(email: String, store: CertificateStore, challenges: Arc<ChallengeStore>) -> Self {
        Self::new(LETS_ENCRYPT_STAGING.to_string(), email, store, challenges)
    }

    async fn account(&self) -> Result<Account> {
        let mut slot = self.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok(account.clone());
        }

        let account = match self.store.load_account()? {
            Some(credentials) => Account::from_credentials(credentials)
                .await
                .map_err(|e| GatewayError::Acme(format!("Failed to restore account: {}", e)))?,
            None => {
                info!("Creating ACME account for {} at {}", self.email, self.directory_url);
                let contact = format!("mailto:{}", self.email);
                let (account, credentials) = Account::create(
                    &NewAccount {
                        contact: &[contact.as_str()],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    &self.directory_url,
                    None,
                )
                .await
                .map_err(|e| GatewayError::Acme(format!("Failed to create account: {}", e)))?;
                self.store.save_account(&credentials)?;
                account
            }
        };

        *slot = Some(account.clone());
        Ok(account)
    }

    /// Run the HTTP-01 order flow:
    /// 1. Create a new order for the domain
    /// 2. Publish the key authorization for each pending authorization
    /// 3. Tell the ACME server the challenge is ready, then poll
    /// 4. Finalize with a fresh key and download the chain
    async fn run_order(&self, domain: &str, published: &mut PublishedChallenges) -> Result<IssuedCertificate> {
        let account = self.account().await?;
        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await
            .map_err(|e| GatewayError::Acme(format!("Failed to create order: {}", e)))?;

        let authorizations = order
            .authorizations()
            .await
            .map_err(|e| GatewayError::Acme(format!("Failed to fetch authorizations: {}", e)))?;

        for authz in &authorizations {
            match authz.status {
                AuthorizationStatus::Pending => {}
                AuthorizationStatus::Valid => continue,
                status => {
                    return Err(GatewayError::Acme(format!(
                        "Authorization for {} is {:?}",
                        domain, status
                    )))
                }
            }

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| GatewayError::Acme("No HTTP-01 challenge offered".to_string()))?;

            let key_authorization = order.key_authorization(challenge);
            published.publish(&challenge.token, key_authorization.as_str());

            order
                .set_challenge_ready(&challenge.url)
                .await
                .map_err(|e| GatewayError::Acme(format!("Failed to set challenge ready: {}", e)))?;
        }

        let mut delay = Duration::from_millis(250);
        let mut tries = 0u8;
        loop {
            tokio::time::sleep(delay).await;
            let state = order
                .refresh()
                .await
                .map_err(|e| GatewayError::Acme(format!("Failed to refresh order: {}", e)))?;

            match state.status {
                OrderStatus::Ready => break,
                OrderStatus::Invalid => {
                    return Err(GatewayError::Acme(format!("Order for {} is invalid", domain)))
                }
                _ => {}
            }

            tries += 1;
            if tries >= 10 {
                return Err(GatewayError::Acme(format!(
                    "Order for {} not ready after {} attempts",
                    domain, tries
                )));
            }
            delay *= 2;
        }

        let mut params = CertificateParams::new(vec![domain.to_string()])
            .map_err(|e| GatewayError::Acme(format!("Invalid certificate params: {}", e)))?;
        params.distinguished_name = DistinguishedName::new();
        let key_pair = KeyPair::generate()
            .map_err(|e| GatewayError::Acme(format!("Failed to generate key: {}", e)))?;
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| GatewayError::Acme(format!("Failed to build CSR: {}", e)))?;

        order
            .finalize(csr.der())
            .await
            .map_err(|e| GatewayError::Acme(format!("Failed to finalize order: {}", e)))?;

        let cert_pem = loop {
            match order
                .certificate()
                .await
                .map_err(|e| GatewayError::Acme(format!("Failed to download certificate: {}", e)))?
            {
                Some(chain) => break chain,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        Ok(IssuedCertificate {
            cert_pem,
            key_pem: key_pair.serialize_pem(),
        })
    }
}

#[async_trait]
impl CertificateIssuer for AcmeIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate> {
        info!("Requesting ACME certificate for {}", domain);
        let mut published = PublishedChallenges::new(self.challenges.clone());
        let result = self.run_order(domain, &mut published).await;
        drop(published);

        if result.is_ok() {
            info!("Certificate issued for {}", domain);
        }
        result
    }
}

/// On-demand certificate manager bound to a host policy
pub struct CertificateManager {
    /// Decides which names may get certificates
    policy: Arc<dyn HostPolicy>,
    /// Produces new certificates
    issuer: Arc<dyn CertificateIssuer>,
    /// Durable cache
    store: CertificateStore,
    /// HTTP-01 responses served on the plain HTTP listener
    challenges: Arc<ChallengeStore>,
    /// Decoded certificates by domain
    loaded: DashMap<String, LoadedCertificate>,
    /// One issuance at a time per domain
    issuing: DashMap<String, Arc<Mutex<()>>>,
    /// Renew when this close to expiry
    renew_before: Duration,
}

impl CertificateManager {
    /// Create a manager over an already-open store
    pub fn new(
        policy: Arc<dyn HostPolicy>,
        issuer: Arc<dyn CertificateIssuer>,
        store: CertificateStore,
        challenges: Arc<ChallengeStore>,
        renew_before: Duration,
    ) -> Self {
        Self {
            policy,
            issuer,
            store,
            challenges,
            loaded: DashMap::new(),
            issuing: DashMap::new(),
            renew_before,
        }
    }

    /// Build the manager described by the ACME configuration
    ///
    /// Fails if the cache directory cannot be created.
    pub fn from_config(config: &AcmeConfig, policy: Arc<dyn HostPolicy>) -> Result<Self> {
        let store = CertificateStore::open(config.cache_dir.clone())?;
        let challenges = Arc::new(ChallengeStore::new());

        info!(
            "Initializing certificate manager (email: {}, staging: {}, cache: {:?})",
            config.email, config.staging, config.cache_dir
        );

        let issuer: Arc<dyn CertificateIssuer> = match config.issuer {
            IssuerKind::SelfSigned => Arc::new(SelfSignedIssuer),
            IssuerKind::Acme => {
                let issuer = match (&config.directory_url, config.staging) {
                    (Some(url), _) => {
                        AcmeIssuer::new(url.clone(), config.email.clone(), store.clone(), challenges.clone())
                    }
                    (None, true) => {
                        info!("Using Let's Encrypt STAGING environment");
                        AcmeIssuer::lets_encrypt_staging(config.email.clone(), store.clone(), challenges.clone())
                    }
                    (None, false) => {
                        AcmeIssuer::lets_encrypt_production(config.email.clone(), store.clone(), challenges.clone())
                    }
                };
                Arc::new(issuer)
            }
        };

        Ok(Self::new(
            policy,
            issuer,
            store,
            challenges,
            Duration::from_secs(config.renew_before_days.saturating_mul(24 * 60 * 60)),
        ))
    }

    /// Challenge store for the HTTP-01 handler
    pub fn challenge_store(&self) -> Arc<ChallengeStore> {
        self.challenges.clone()
    }

    /// Key authorization for a challenge token
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenges.get_challenge(token)
    }

    /// On-disk cache
    pub fn store(&self) -> &CertificateStore {
        &self.store
    }

    /// Already-loaded, unexpired certificate for a name (no I/O)
    pub fn cached(&self, server_name: &str) -> Option<LoadedCertificate> {
        let domain = normalize_domain(server_name);
        self.loaded
            .get(&domain)
            .map(|entry| entry.value().clone())
            .filter(|loaded| !loaded.is_expired())
    }

    /// Domains with a loaded certificate
    pub fn loaded_domains(&self) -> Vec<String> {
        self.loaded.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Certificate for a TLS server name, obtaining one if needed
    ///
    /// Issuance runs in its own task: a caller that stops waiting, e.g. a
    /// handshake that timed out, leaves it running, and later callers for
    /// the same domain wait for it instead of starting another order.
    pub async fn get_certificate(self: &Arc<Self>, server_name: &str) -> Result<LoadedCertificate> {
        let domain = normalize_domain(server_name);

        if let Err(denied) = self.policy.allow(&domain) {
            warn!("Rejecting certificate request: {}", denied);
            return Err(GatewayError::CertificateDenied { domain });
        }

        if let Some(loaded) = self.cached(&domain) {
            return Ok(loaded);
        }

        let guard = self.issue_lock(&domain).lock_owned().await;

        // Another handshake may have finished while we waited.
        if let Some(loaded) = self.cached(&domain) {
            return Ok(loaded);
        }

        if let Some(loaded) = self.load_from_disk(&domain) {
            if !loaded.is_expired() {
                debug!("Loaded cached certificate for {}", domain);
                self.loaded.insert(domain, loaded.clone());
                return Ok(loaded);
            }
        }

        let manager = Arc::clone(self);
        let issuance = tokio::spawn(async move {
            let _guard = guard;
            match tokio::time::timeout(ISSUANCE_TIMEOUT, manager.issue_and_store(&domain)).await {
                Ok(result) => result,
                Err(_) => {
                    error!("Certificate issuance for {} timed out after {:?}", domain, ISSUANCE_TIMEOUT);
                    Err(GatewayError::Acme(format!("issuance for {} timed out", domain)))
                }
            }
        });

        issuance
            .await
            .map_err(|e| GatewayError::Acme(format!("Certificate issuance task failed: {}", e)))?
    }

    /// Renew loaded certificates close to expiry; drop unrouted ones
    ///
    /// Returns the number of certificates renewed.
    pub async fn renew_due(&self) -> usize {
        let mut renewed = 0;

        for domain in self.loaded_domains() {
            if let Err(denied) = self.policy.allow(&domain) {
                info!("Dropping certificate for {}: {}", domain, denied);
                self.loaded.remove(&domain);
                self.issuing.remove(&domain);
                continue;
            }

            let due = self
                .loaded
                .get(&domain)
                .map(|entry| entry.expires_within(self.renew_before))
                .unwrap_or(false);
            if !due {
                continue;
            }

            let lock = self.issue_lock(&domain);
            let _guard = lock.lock().await;
            info!("Renewing certificate for {}", domain);
            match self.issue_and_store(&domain).await {
                Ok(_) => renewed += 1,
                Err(e) => error!("Certificate renewal failed for {}: {}", domain, e),
            }
        }

        renewed
    }

    /// Start background certificate renewal
    pub fn spawn_renewal(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("Starting certificate renewal task (every {:?})", interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                let renewed = self.renew_due().await;
                if renewed > 0 {
                    info!("Renewed {} certificate(s)", renewed);
                }
            }
            debug!("Certificate renewal task stopped");
        })
    }

    fn issue_lock(&self, domain: &str) -> Arc<Mutex<()>> {
        self.issuing.entry(domain.to_string()).or_default().clone()
    }

    fn load_from_disk(&self, domain: &str) -> Option<LoadedCertificate> {
        match self.store.load(domain) {
            Ok(Some(issued)) => match LoadedCertificate::from_pem(&issued.cert_pem, &issued.key_pem) {
                Ok(loaded) => Some(loaded),
                Err(e) => {
                    warn!("Ignoring unreadable cached certificate for {}: {}", domain, e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!("Certificate cache read failed for {}: {}", domain, e);
                None
            }
        }
    }

    /// Issue, persist and load; keeps serving a still-valid certificate
    /// if issuance fails. Callers hold the domain's issue lock.
    async fn issue_and_store(&self, domain: &str) -> Result<LoadedCertificate> {
        let fresh = async {
            let issued = self.issuer.issue(domain).await?;
            let loaded = LoadedCertificate::from_pem(&issued.cert_pem, &issued.key_pem)?;
            self.store.save(domain, &issued)?;
            Ok::<_, GatewayError>(loaded)
        }
        .await;

        match fresh {
            Ok(loaded) => {
                self.loaded.insert(domain.to_string(), loaded.clone());
                Ok(loaded)
            }
            Err(e) => {
                let fallback = self
                    .loaded
                    .get(domain)
                    .map(|entry| entry.value().clone())
                    .or_else(|| self.load_from_disk(domain))
                    .filter(|loaded| !loaded.is_expired());
                match fallback {
                    Some(loaded) => {
                        warn!("Certificate issuance for {} failed, serving existing certificate: {}", domain, e);
                        self.loaded.insert(domain.to_string(), loaded.clone());
                        Ok(loaded)
                    }
                    None => {
                        error!("Certificate issuance for {} failed: {}", domain, e);
                        Err(e)
                    }
                }
            }
        }
    }
}
