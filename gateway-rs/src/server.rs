//! Listener lifecycle
//!
//! [`GatewayServer`] owns the route table, the dispatcher and, when HTTPS
//! is on, the certificate manager. [`GatewayServer::start`] binds the plain
//! HTTP listener and the HTTPS listener and returns [`Listeners`], which
//! drains both on [`Listeners::shutdown`].
//!
//! With HTTPS on, the plain listener only answers ACME challenges and
//! redirects everything else to HTTPS. Without it, the plain listener
//! proxies directly.

use axum::{routing::any, Router};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use rustls::server::Acceptor;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::server::TlsStream;
use tokio_rustls::LazyConfigAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::acme::{CertificateManager, CHALLENGE_PATH_PREFIX};
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::policy::RouteTablePolicy;
use crate::proxy::{challenge_handler, proxy_handler, redirect_handler, ConnectionInfo, Dispatcher};
use crate::router::{Route, RouteTable, SnapshotReport};
use crate::tls::{build_server_config, CertificateResolver};

/// Pause after a failed accept, e.g. when out of file descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Where the listeners are in their lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Stopped,
    Starting,
    Running,
    Draining,
}

/// Outcome of [`Listeners::shutdown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// The deadline passed before every connection finished
    pub timed_out: bool,
    /// Connections closed without completing
    pub forced: usize,
}

/// The gateway: routes, dispatcher, certificates and listeners
pub struct GatewayServer {
    config: GatewayConfig,
    table: Arc<RouteTable>,
    dispatcher: Arc<Dispatcher>,
    certificates: Option<Arc<CertificateManager>>,
    state: Arc<watch::Sender<ListenerState>>,
}

impl GatewayServer {
    /// Create a gateway and install the configured routes
    ///
    /// If HTTPS is enabled but the certificate cache cannot be prepared,
    /// the gateway runs HTTP-only.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        config.validate()?;

        let table = Arc::new(RouteTable::new(config.server.backend_port));
        let dispatcher = Arc::new(Dispatcher::new(table.clone()));

        let certificates = if config.acme.enabled {
            let policy = Arc::new(RouteTablePolicy::new(table.clone()));
            match CertificateManager::from_config(&config.acme, policy) {
                Ok(manager) => Some(Arc::new(manager)),
                Err(e) => {
                    error!("Certificate manager unavailable, serving HTTP only: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let (state, _) = watch::channel(ListenerState::Stopped);

        let server = Self {
            config,
            table,
            dispatcher,
            certificates,
            state: Arc::new(state),
        };
        server.update_routes(server.config.routes.clone());

        Ok(server)
    }

    /// Serve HTTPS with the given certificate manager
    ///
    /// The manager's policy should be built over [`route_table`](Self::route_table).
    pub fn with_certificate_manager(mut self, manager: Arc<CertificateManager>) -> Self {
        self.certificates = Some(manager);
        self
    }

    /// Route table consulted by the dispatcher and the certificate policy
    pub fn route_table(&self) -> Arc<RouteTable> {
        self.table.clone()
    }

    /// Certificate manager, if HTTPS is on
    pub fn certificate_manager(&self) -> Option<Arc<CertificateManager>> {
        self.certificates.clone()
    }

    /// Whether `start` binds an HTTPS listener
    pub fn https_enabled(&self) -> bool {
        self.certificates.is_some()
    }

    /// Replace all routes, logging entries that were dropped
    pub fn update_routes(&self, routes: Vec<Route>) -> SnapshotReport {
        let report = self.table.replace(routes);

        for id in &report.malformed {
            warn!("Dropped malformed route '{}'", id);
        }
        info!(
            "Route table updated: {} installed, {} disabled, {} duplicate",
            report.installed, report.disabled, report.duplicates
        );

        report
    }

    /// Current lifecycle state
    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<ListenerState> {
        self.state.subscribe()
    }

    /// Bind the listeners and start serving
    pub async fn start(&self, http_addr: &str, https_addr: &str) -> Result<Listeners> {
        self.state.send_replace(ListenerState::Starting);

        match self.spawn_listeners(http_addr, https_addr).await {
            Ok(listeners) => {
                self.state.send_replace(ListenerState::Running);
                Ok(listeners)
            }
            Err(e) => {
                self.state.send_replace(ListenerState::Stopped);
                Err(e)
            }
        }
    }

    /// Serve on the configured addresses until `shutdown_signal` completes
    pub async fn run<F>(&self, shutdown_signal: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let listeners = self
            .start(&self.config.server.http_addr, &self.config.server.https_addr)
            .await?;

        shutdown_signal.await;
        info!("Shutdown signal received");

        let deadline = Duration::from_secs(self.config.server.shutdown_timeout_seconds);
        let report = listeners.shutdown(deadline).await;
        if report.timed_out {
            warn!("Shutdown deadline passed, {} connection(s) force-closed", report.forced);
        }

        info!("Gateway stopped");
        Ok(())
    }

    async fn spawn_listeners(&self, http_addr: &str, https_addr: &str) -> Result<Listeners> {
        let tls = match &self.certificates {
            Some(manager) => {
                let resolver = Arc::new(CertificateResolver::new(manager.clone()));
                Some(TlsContext {
                    manager: manager.clone(),
                    config: build_server_config(resolver)?,
                    handshake_timeout: Duration::from_secs(self.config.server.handshake_timeout_seconds),
                })
            }
            None => None,
        };

        let http = bind(http_addr).await?;
        let https = match tls {
            Some(_) => Some(bind(https_addr).await?),
            None => None,
        };

        let http_local = http.local_addr()?;
        let https_local = https.as_ref().map(TcpListener::local_addr).transpose()?;

        let shared = ConnectionControl {
            cancel: CancellationToken::new(),
            force: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        let proxy_router = self.proxy_router();
        let mut loops = Vec::new();
        let mut renewal = None;

        match (tls, https, https_local) {
            (Some(tls), Some(https), Some(https_local)) => {
                info!("HTTP listening on {} (ACME challenges, redirect to HTTPS)", http_local);
                info!("HTTPS listening on {}", https_local);

                let redirect = redirect_router(tls.manager.clone(), https_local.port());
                loops.push(tokio::spawn(accept_loop(http, redirect, None, shared.clone())));

                renewal = Some(tls.manager.clone().spawn_renewal(
                    Duration::from_secs(self.config.server.renewal_interval_seconds),
                    shared.cancel.child_token(),
                ));
                loops.push(tokio::spawn(accept_loop(https, proxy_router, Some(tls), shared.clone())));
            }
            _ => {
                info!("HTTP listening on {} (TLS disabled)", http_local);
                loops.push(tokio::spawn(accept_loop(http, proxy_router, None, shared.clone())));
            }
        }

        Ok(Listeners {
            http_addr: http_local,
            https_addr: https_local,
            control: shared,
            loops,
            renewal,
            state: self.state.clone(),
        })
    }

    fn proxy_router(&self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .layer(TraceLayer::new_for_http())
            .with_state(self.dispatcher.clone())
    }
}

/// Plain HTTP routing once HTTPS is on
fn redirect_router(manager: Arc<CertificateManager>, https_port: u16) -> Router {
    let challenges: Router = Router::new()
        .route(&format!("{}:token", CHALLENGE_PATH_PREFIX), any(challenge_handler))
        .with_state(manager);
    let redirect: Router = Router::new().fallback(redirect_handler).with_state(https_port);

    challenges.merge(redirect).layer(TraceLayer::new_for_http())
}

async fn bind(addr: &str) -> Result<TcpListener> {
    TcpListener::bind(addr).await.map_err(|source| GatewayError::Bind {
        addr: addr.to_string(),
        source,
    })
}

/// Cancellation and tracking shared by the accept loops and connections
#[derive(Clone)]
struct ConnectionControl {
    /// Stop accepting, drain connections gracefully
    cancel: CancellationToken,
    /// Drop whatever is still open
    force: CancellationToken,
    tracker: TaskTracker,
}

/// Handshake state for the HTTPS listener
#[derive(Clone)]
struct TlsContext {
    manager: Arc<CertificateManager>,
    config: Arc<rustls::ServerConfig>,
    /// Covers the wait for a certificate; the issuance itself keeps running
    handshake_timeout: Duration,
}

impl TlsContext {
    /// Read the ClientHello, make sure its server name has a certificate,
    /// then finish the handshake
    async fn handshake(&self, stream: TcpStream) -> Result<TlsStream<TcpStream>> {
        let start = LazyConfigAcceptor::new(Acceptor::default(), stream)
            .await
            .map_err(|e| GatewayError::Tls(format!("Failed to read ClientHello: {}", e)))?;

        let server_name = start
            .client_hello()
            .server_name()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Tls("Client sent no server name".to_string()))?;

        self.manager.get_certificate(&server_name).await?;

        start
            .into_stream(self.config.clone())
            .await
            .map_err(|e| GatewayError::Tls(format!("Handshake with {} failed: {}", server_name, e)))
    }
}

async fn accept_loop(listener: TcpListener, router: Router, tls: Option<TlsContext>, control: ConnectionControl) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            _ = control.cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };

        let router = router.clone();
        let tls = tls.clone();
        let cancel = control.cancel.clone();
        let force = control.force.clone();

        control.tracker.spawn(async move {
            tokio::select! {
                _ = handle_connection(stream, remote_addr, router, tls, cancel) => {}
                _ = force.cancelled() => debug!("Force-closed connection from {}", remote_addr),
            }
        });
    }

    debug!("Accept loop stopped");
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    router: Router,
    tls: Option<TlsContext>,
    cancel: CancellationToken,
) {
    let Some(tls) = tls else {
        let info = ConnectionInfo {
            remote_addr,
            secure: false,
        };
        serve(TokioIo::new(stream), router, info, cancel).await;
        return;
    };

    let stream = match tokio::time::timeout(tls.handshake_timeout, tls.handshake(stream)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("TLS handshake from {} failed: {}", remote_addr, e);
            return;
        }
        Err(_) => {
            debug!("TLS handshake from {} timed out", remote_addr);
            return;
        }
    };

    let info = ConnectionInfo {
        remote_addr,
        secure: true,
    };
    serve(TokioIo::new(stream), router, info, cancel).await;
}

/// Serve HTTP/1.1 or HTTP/2 on one connection until it closes or the
/// gateway drains
async fn serve<I>(io: I, router: Router, info: ConnectionInfo, cancel: CancellationToken)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |mut req: Request<Incoming>| {
        let router = router.clone();
        req.extensions_mut().insert(info);
        async move { router.oneshot(req).await }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    tokio::select! {
        res = conn.as_mut() => {
            if let Err(e) = res {
                debug!("Error serving connection from {}: {}", info.remote_addr, e);
            }
        }
        _ = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.as_mut().await {
                debug!("Error draining connection from {}: {}", info.remote_addr, e);
            }
        }
    }
}

/// Running listeners returned by [`GatewayServer::start`]
pub struct Listeners {
    http_addr: SocketAddr,
    https_addr: Option<SocketAddr>,
    control: ConnectionControl,
    loops: Vec<JoinHandle<()>>,
    renewal: Option<JoinHandle<()>>,
    state: Arc<watch::Sender<ListenerState>>,
}

impl Listeners {
    /// Bound address of the plain HTTP listener
    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    /// Bound address of the HTTPS listener, if HTTPS is on
    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https_addr
    }

    /// Stop accepting and drain open connections
    ///
    /// Connections still open after `deadline` are closed.
    pub async fn shutdown(self, deadline: Duration) -> ShutdownReport {
        info!("Draining listeners (deadline {:?})", deadline);
        self.state.send_replace(ListenerState::Draining);

        self.control.cancel.cancel();
        self.control.tracker.close();

        for handle in self.loops {
            if let Err(e) = handle.await {
                error!("Accept loop failed: {}", e);
            }
        }

        let mut report = ShutdownReport::default();
        if tokio::time::timeout(deadline, self.control.tracker.wait()).await.is_err() {
            report.timed_out = true;
            report.forced = self.control.tracker.len();
            error!(
                "{}",
                GatewayError::Shutdown(format!(
                    "deadline of {:?} passed with {} connection(s) open",
                    deadline, report.forced
                ))
            );
            self.control.force.cancel();
            self.control.tracker.wait().await;
        }

        if let Some(renewal) = self.renewal {
            // A renewal in progress does not hold up shutdown.
            renewal.abort();
        }

        self.state.send_replace(ListenerState::Stopped);
        info!("Listeners stopped");
        report
    }
}
