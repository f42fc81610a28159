//! Request dispatch for gateway-rs
//!
//! Resolves a request's host to a route and forwards it to the route's
//! backend. Also holds the two handlers the plain HTTP listener uses once
//! HTTPS is on: the ACME challenge responder and the HTTPS redirect.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderValue, Request, Response, StatusCode, Uri, Version},
    response::IntoResponse,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::acme::CertificateManager;
use crate::error::GatewayError;
use crate::router::{backend_authority, host_without_port, RouteTable};

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpConnector, Body>;

pub const X_FORWARDED_HOST: &str = "x-forwarded-host";
pub const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";
pub const X_REAL_IP: &str = "x-real-ip";

/// Headers that describe one connection and are not forwarded
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Facts about the client connection, attached to each request by the listener
#[derive(Debug, Clone, Copy)]
pub struct ConnectionInfo {
    /// Client address
    pub remote_addr: SocketAddr,
    /// Whether the connection was TLS-terminated here
    pub secure: bool,
}

/// Forwards requests to the backend of the matching route
pub struct Dispatcher {
    /// Current routes
    table: Arc<RouteTable>,
    /// HTTP client for forwarding
    client: HttpClient,
}

impl Dispatcher {
    /// Create a dispatcher reading from `table`
    pub fn new(table: Arc<RouteTable>) -> Self {
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();

        Self { table, client }
    }

    /// Route table the dispatcher reads
    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Handle one request end to end
    pub async fn handle(&self, req: Request<Body>, conn: ConnectionInfo) -> Response<Body> {
        let Some(host) = request_host(&req) else {
            warn!("Request from {} without host", conn.remote_addr);
            return (StatusCode::BAD_REQUEST, "missing host").into_response();
        };
        let domain = host_without_port(&host).to_string();

        debug!("Proxying request: {} {} {}", req.method(), host, req.uri().path());

        let route = match self.table.resolve(&domain) {
            Ok(route) => route,
            Err(e) => {
                warn!("{}", e);
                return (StatusCode::NOT_FOUND, "no route for domain").into_response();
            }
        };

        if !route.enabled {
            warn!("Route for {} is disabled", domain);
            return (StatusCode::SERVICE_UNAVAILABLE, "route disabled").into_response();
        }

        let forward_req = match self.rewrite(req, &host, &route.backend_address, conn) {
            Ok(r) => r,
            Err(e) => {
                error!("Cannot forward request for {}: {}", domain, e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response();
            }
        };

        // Send request to backend
        match self.client.request(forward_req).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                let e = GatewayError::BackendConnection(format!("{} ({}): {}", route.backend_address, domain, e));
                error!("{}", e);
                (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
            }
        }
    }

    /// Point the request at the backend and set the forwarding headers
    fn rewrite(
        &self,
        req: Request<Body>,
        host: &str,
        backend: &str,
        conn: ConnectionInfo,
    ) -> Result<Request<Body>, GatewayError> {
        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let forward_uri = format!(
            "http://{}{}",
            backend_authority(backend, self.table.backend_port()),
            path_and_query
        );
        let uri: Uri = forward_uri
            .parse()
            .map_err(|e| GatewayError::Http(format!("Invalid forward URI '{}': {}", forward_uri, e)))?;
        let host_value = HeaderValue::from_str(host)
            .map_err(|e| GatewayError::Http(format!("Invalid host '{}': {}", host, e)))?;

        let (mut parts, body) = req.into_parts();
        parts.uri = uri;
        parts.version = Version::HTTP_11;

        strip_hop_by_hop(&mut parts.headers);

        // The backend sees the name the client asked for, not its own address.
        parts.headers.insert(header::HOST, host_value.clone());
        parts.headers.insert(X_FORWARDED_HOST, host_value);
        parts.headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if conn.secure { "https" } else { "http" }),
        );

        let client_ip = conn.remote_addr.ip().to_string();
        let prior: Vec<&str> = parts
            .headers
            .get_all(X_FORWARDED_FOR)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();
        let forwarded_for = if prior.is_empty() {
            client_ip.clone()
        } else {
            format!("{}, {}", prior.join(", "), client_ip)
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            parts.headers.insert(X_FORWARDED_FOR, value);
        }

        if !parts.headers.contains_key(X_REAL_IP) {
            if let Ok(ip) = HeaderValue::from_str(&client_ip) {
                parts.headers.insert(X_REAL_IP, ip);
            }
        }

        Ok(Request::from_parts(parts, body))
    }
}

/// Host from the Host header, or the URI authority for HTTP/2
pub fn request_host<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| req.uri().authority().map(|a| a.as_str().to_string()))
        .filter(|h| !h.is_empty())
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in Connection are hop-by-hop too.
    let named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(named.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

/// Main proxy handler - forwards requests to backends
pub async fn proxy_handler(State(dispatcher): State<Arc<Dispatcher>>, req: Request<Body>) -> Response<Body> {
    let Some(conn) = req.extensions().get::<ConnectionInfo>().copied() else {
        error!("Request reached the dispatcher without connection info");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response();
    };
    dispatcher.handle(req, conn).await
}

/// HTTP-01 challenge responder, mounted under the challenge path prefix
pub async fn challenge_handler(
    State(manager): State<Arc<CertificateManager>>,
    Path(token): Path<String>,
) -> Response<Body> {
    match manager.challenge_response(&token) {
        Some(key_authorization) => {
            debug!("Answering ACME challenge {}", token);
            (StatusCode::OK, key_authorization).into_response()
        }
        None => {
            debug!("Unknown ACME challenge token {}", token);
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}

/// Location for the HTTPS equivalent of a plain HTTP request
pub fn https_redirect_location(host: &str, https_port: u16, uri: &Uri) -> String {
    let name = host_without_port(host);
    let name = if name.contains(':') { format!("[{}]", name) } else { name.to_string() };
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    if https_port == 443 {
        format!("https://{}{}", name, path)
    } else {
        format!("https://{}:{}{}", name, https_port, path)
    }
}

/// Redirects every request to HTTPS
pub async fn redirect_handler(State(https_port): State<u16>, req: Request<Body>) -> Response<Body> {
    let Some(host) = request_host(&req) else {
        return (StatusCode::BAD_REQUEST, "missing host").into_response();
    };

    let location = https_redirect_location(&host, https_port, req.uri());
    debug!("Redirecting HTTP to HTTPS: {} -> {}", req.uri(), location);

    match HeaderValue::from_str(&location) {
        Ok(location) => (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "invalid host").into_response(),
    }
}
