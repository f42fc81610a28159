//! End-to-end tests: real listeners, in-process backends, reqwest clients

use async_trait::async_trait;
use axum::{body::Body, http::Request, routing::any, Router};
use gateway_rs::acme::{
    CertificateIssuer, CertificateManager, CertificateStore, ChallengeStore, IssuedCertificate,
    PublishedChallenges, SelfSignedIssuer,
};
use gateway_rs::config::IssuerKind;
use gateway_rs::policy::RouteTablePolicy;
use gateway_rs::{GatewayConfig, GatewayServer, Listeners, Route};
use reqwest::redirect::Policy;
use reqwest::StatusCode;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Backend that answers `name|host|x-forwarded-proto|path`
fn echo_app(name: &'static str) -> Router {
    Router::new().fallback(any(move |req: Request<Body>| async move {
        let header = |n: &str| {
            req.headers()
                .get(n)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("-")
                .to_string()
        };
        format!(
            "{}|{}|{}|{}",
            name,
            header("host"),
            header("x-forwarded-proto"),
            req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/"),
        )
    }))
}

async fn serve_backend(addr: SocketAddr, app: Router) -> SocketAddr {
    let listener = TcpListener::bind(addr).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Two backends on different loopback addresses sharing one port
async fn spawn_backend_pair() -> (SocketAddr, SocketAddr) {
    let a = serve_backend("127.0.0.1:0".parse().unwrap(), echo_app("A")).await;
    let b = serve_backend(SocketAddr::new("127.0.0.2".parse().unwrap(), a.port()), echo_app("B")).await;
    (a, b)
}

fn base_config(backend_port: u16) -> GatewayConfig {
    let mut config = GatewayConfig::development();
    config.server.http_addr = "127.0.0.1:0".to_string();
    config.server.https_addr = "127.0.0.1:0".to_string();
    config.server.backend_port = backend_port;
    config.routes.clear();
    config
}

fn tls_config(backend_port: u16, cache_dir: &std::path::Path) -> GatewayConfig {
    let mut config = base_config(backend_port);
    config.acme.enabled = true;
    config.acme.issuer = IssuerKind::SelfSigned;
    config.acme.cache_dir = cache_dir.to_path_buf();
    config
}

fn routes(a: IpAddr, b: IpAddr) -> Vec<Route> {
    vec![
        Route::new("1", "a.example", a.to_string()),
        Route::new("2", "b.example", b.to_string()),
        Route::new("3", "off.example", a.to_string()).with_enabled(false),
    ]
}

fn http_client() -> reqwest::Client {
    reqwest::Client::builder().redirect(Policy::none()).build().unwrap()
}

fn https_client(domain: &str, addr: SocketAddr) -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(Policy::none())
        .danger_accept_invalid_certs(true)
        .resolve(domain, addr)
        .build()
        .unwrap()
}

async fn get_with_host(listeners: &Listeners, host: &str, path: &str) -> reqwest::Response {
    http_client()
        .get(format!("http://{}{}", listeners.http_addr(), path))
        .header("host", host)
        .send()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_routes_each_domain_to_its_backend() {
    let (a, b) = spawn_backend_pair().await;
    let server = GatewayServer::new(base_config(a.port())).unwrap();
    server.update_routes(routes(a.ip(), b.ip()));
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let body = get_with_host(&listeners, "a.example", "/hello?x=1").await.text().await.unwrap();
    assert_eq!(body, "A|a.example|http|/hello?x=1");

    let body = get_with_host(&listeners, "b.example", "/").await.text().await.unwrap();
    assert_eq!(body, "B|b.example|http|/");

    listeners.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unknown_and_disabled_domains_are_404() {
    let (a, b) = spawn_backend_pair().await;
    let server = GatewayServer::new(base_config(a.port())).unwrap();
    server.update_routes(routes(a.ip(), b.ip()));
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let response = get_with_host(&listeners, "nobody.example", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "no route for domain");

    let response = get_with_host(&listeners, "off.example", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    listeners.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_route_updates_apply_to_new_requests() {
    let (a, b) = spawn_backend_pair().await;
    let server = GatewayServer::new(base_config(a.port())).unwrap();
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let response = get_with_host(&listeners, "a.example", "/").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    server.update_routes(routes(a.ip(), b.ip()));
    let response = get_with_host(&listeners, "a.example", "/").await;
    assert_eq!(response.status(), StatusCode::OK);

    // Swap the backends around
    server.update_routes(routes(b.ip(), a.ip()));
    let body = get_with_host(&listeners, "a.example", "/").await.text().await.unwrap();
    assert!(body.starts_with("B|"));

    listeners.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_unreachable_backend_is_502() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let server = GatewayServer::new(base_config(port)).unwrap();
    server.update_routes(vec![Route::new("1", "a.example", "127.0.0.1")]);
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let response = get_with_host(&listeners, "a.example", "/").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    listeners.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_http_redirects_to_https_when_tls_enabled() {
    let (a, b) = spawn_backend_pair().await;
    let cache = tempfile::tempdir().unwrap();
    let server = GatewayServer::new(tls_config(a.port(), cache.path())).unwrap();
    assert!(server.https_enabled());
    server.update_routes(routes(a.ip(), b.ip()));
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let https_port = listeners.https_addr().unwrap().port();

    let response = get_with_host(&listeners, "a.example", "/some/path?q=1").await;
    assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
    assert_eq!(
        response.headers()["location"],
        format!("https://a.example:{}/some/path?q=1", https_port).as_str()
    );

    listeners.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_challenge_path_served_over_http() {
    let (a, b) = spawn_backend_pair().await;
    let cache = tempfile::tempdir().unwrap();
    let server = GatewayServer::new(tls_config(a.port(), cache.path())).unwrap();
    server.update_routes(routes(a.ip(), b.ip()));
    let manager = server.certificate_manager().unwrap();
    manager.challenge_store().add_challenge("token-1", "token-1.thumbprint");
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();

    let response = get_with_host(&listeners, "a.example", "/.well-known/acme-challenge/token-1").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "token-1.thumbprint");

    let response = get_with_host(&listeners, "a.example", "/.well-known/acme-challenge/other").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Any method under the prefix reaches the challenge responder
    let response = http_client()
        .post(format!("http://{}/.well-known/acme-challenge/token-1", listeners.http_addr()))
        .header("host", "a.example")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "token-1.thumbprint");

    listeners.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_https_serves_routed_domain() {
    let (a, b) = spawn_backend_pair().await;
    let cache = tempfile::tempdir().unwrap();
    let server = GatewayServer::new(tls_config(a.port(), cache.path())).unwrap();
    server.update_routes(routes(a.ip(), b.ip()));
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let https_addr = listeners.https_addr().unwrap();

    let body = https_client("a.example", https_addr)
        .get(format!("https://a.example:{}/secure", https_addr.port()))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, format!("A|a.example:{}|https|/secure", https_addr.port()));

    // Issued once, cached on disk
    assert!(cache.path().join("a.example").join("cert.pem").exists());

    listeners.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_https_handshake_fails_for_unrouted_name() {
    let (a, b) = spawn_backend_pair().await;
    let cache = tempfile::tempdir().unwrap();
    let server = GatewayServer::new(tls_config(a.port(), cache.path())).unwrap();
    server.update_routes(routes(a.ip(), b.ip()));
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let https_addr = listeners.https_addr().unwrap();

    for name in ["nobody.example", "off.example"] {
        let result = https_client(name, https_addr)
            .get(format!("https://{}:{}/", name, https_addr.port()))
            .send()
            .await;
        assert!(result.is_err(), "handshake for {} should fail", name);
        assert!(!cache.path().join(name).exists());
    }

    // Other connections are unaffected
    let response = https_client("b.example", https_addr)
        .get(format!("https://b.example:{}/", https_addr.port()))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    listeners.shutdown(Duration::from_secs(1)).await;
}

/// Backend whose handler signals arrival, then waits `delay` before answering
async fn spawn_slow_backend(delay: Duration) -> (SocketAddr, Arc<Notify>) {
    let arrived = Arc::new(Notify::new());
    let signal = arrived.clone();
    let app = Router::new().fallback(any(move || {
        let signal = signal.clone();
        async move {
            signal.notify_one();
            tokio::time::sleep(delay).await;
            "done"
        }
    }));
    let addr = serve_backend("127.0.0.1:0".parse().unwrap(), app).await;
    (addr, arrived)
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_request() {
    let (backend, arrived) = spawn_slow_backend(Duration::from_millis(300)).await;
    let server = GatewayServer::new(base_config(backend.port())).unwrap();
    server.update_routes(vec![Route::new("1", "a.example", "127.0.0.1")]);
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let http_addr = listeners.http_addr();

    let request = tokio::spawn(async move {
        http_client()
            .get(format!("http://{}/", http_addr))
            .header("host", "a.example")
            .send()
            .await
    });
    arrived.notified().await;

    let report = listeners.shutdown(Duration::from_secs(5)).await;
    assert!(!report.timed_out);
    assert_eq!(report.forced, 0);

    let response = request.await.unwrap().unwrap();
    assert_eq!(response.text().await.unwrap(), "done");

    // Listener is gone
    assert!(TcpStream::connect(http_addr).await.is_err());
}

#[tokio::test]
async fn test_shutdown_deadline_force_closes() {
    let (backend, arrived) = spawn_slow_backend(Duration::from_secs(30)).await;
    let server = GatewayServer::new(base_config(backend.port())).unwrap();
    server.update_routes(vec![Route::new("1", "a.example", "127.0.0.1")]);
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let http_addr = listeners.http_addr();

    let request = tokio::spawn(async move {
        http_client()
            .get(format!("http://{}/", http_addr))
            .header("host", "a.example")
            .send()
            .await
    });
    arrived.notified().await;

    let report = listeners.shutdown(Duration::from_millis(200)).await;
    assert!(report.timed_out);
    assert_eq!(report.forced, 1);

    assert!(request.await.unwrap().is_err());
}

/// Certificate authority that takes longer than a handshake may wait
struct SlowAuthority {
    delay: Duration,
    challenges: Arc<ChallengeStore>,
    started: AtomicUsize,
    finished: AtomicUsize,
}

#[async_trait]
impl CertificateIssuer for SlowAuthority {
    async fn issue(&self, domain: &str) -> gateway_rs::Result<IssuedCertificate> {
        let attempt = self.started.fetch_add(1, Ordering::SeqCst);
        let mut published = PublishedChallenges::new(self.challenges.clone());
        published.publish(&format!("token-{}", attempt), "key-authorization");

        tokio::time::sleep(self.delay).await;

        self.finished.fetch_add(1, Ordering::SeqCst);
        SelfSignedIssuer.issue(domain).await
    }
}

#[tokio::test]
async fn test_slow_issuance_outlives_handshake_timeout() {
    let (a, b) = spawn_backend_pair().await;
    let cache = tempfile::tempdir().unwrap();

    let mut config = base_config(a.port());
    config.server.handshake_timeout_seconds = 1;
    let server = GatewayServer::new(config).unwrap();
    server.update_routes(routes(a.ip(), b.ip()));

    let challenges = Arc::new(ChallengeStore::new());
    let authority = Arc::new(SlowAuthority {
        delay: Duration::from_secs(3),
        challenges: challenges.clone(),
        started: AtomicUsize::new(0),
        finished: AtomicUsize::new(0),
    });
    let manager = Arc::new(CertificateManager::new(
        Arc::new(RouteTablePolicy::new(server.route_table())),
        authority.clone(),
        CertificateStore::open(cache.path()).unwrap(),
        challenges.clone(),
        Duration::from_secs(30 * 24 * 60 * 60),
    ));
    let server = server.with_certificate_manager(manager.clone());
    let listeners = server.start("127.0.0.1:0", "127.0.0.1:0").await.unwrap();
    let https_addr = listeners.https_addr().unwrap();
    let url = format!("https://a.example:{}/", https_addr.port());

    // The handshake gives up before the authority answers
    let first = https_client("a.example", https_addr).get(&url).send().await;
    assert!(first.is_err());
    assert_eq!(authority.started.load(Ordering::SeqCst), 1);
    assert_eq!(challenges.get_challenge("token-0").as_deref(), Some("key-authorization"));

    // ...but the issuance it started runs to completion
    for _ in 0..100 {
        if manager.cached("a.example").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(manager.cached("a.example").is_some());
    assert_eq!(authority.finished.load(Ordering::SeqCst), 1);
    assert!(challenges.is_empty());

    let response = https_client("a.example", https_addr).get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(authority.started.load(Ordering::SeqCst), 1);

    listeners.shutdown(Duration::from_secs(1)).await;
}
