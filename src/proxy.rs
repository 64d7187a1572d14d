use crate::body::{SpaRequest, SpaResponse};
use crate::error::SpaError;
use crate::fallback::starts_with_segments;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::signal::Signal;
use hyper::header::HeaderValue;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Header name for request ID
pub const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Round-trip limit applied to routes that don't choose one
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(100);

/// Peer address of the client, stored in request extensions by the server
#[derive(Debug, Clone, Copy)]
pub struct ClientAddr(pub SocketAddr);

/// One path prefix forwarded to a backend whose port may still be pending
#[derive(Debug, Clone)]
pub struct BackendRoute {
    path_prefix: String,
    scheme: String,
    host: String,
    port: Signal<u16>,
    request_timeout: Option<Duration>,
}

impl BackendRoute {
    /// Route `path_prefix` to `http://localhost:<port>` once `port` resolves
    pub fn new(path_prefix: impl Into<String>, port: Signal<u16>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port,
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// No round-trip limit, for long-lived streaming endpoints
    pub fn without_timeout(mut self) -> Self {
        self.request_timeout = None;
        self
    }

    pub fn path_prefix(&self) -> &str {
        &self.path_prefix
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn port(&self) -> &Signal<u16> {
        &self.port
    }

    pub fn matches(&self, path: &str) -> bool {
        starts_with_segments(path, &self.path_prefix)
    }

    fn base_url(&self, port: u16) -> String {
        format!("{}://{}:{}", self.scheme, self.host, port)
    }
}

/// Forwards requests under registered prefixes to their backends
pub struct ConditionalProxy {
    /// Longest prefix first
    routes: Vec<BackendRoute>,
    pool: ConnectionPool,
    /// Operator-imposed limit on waiting for a pending port; unbounded if unset
    resolution_timeout: Option<Duration>,
}

impl Default for ConditionalProxy {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

impl ConditionalProxy {
    pub fn new(pool_config: PoolConfig) -> Self {
        Self {
            routes: Vec::new(),
            pool: ConnectionPool::new(pool_config),
            resolution_timeout: None,
        }
    }

    pub fn with_resolution_timeout(mut self, timeout: Duration) -> Self {
        self.resolution_timeout = Some(timeout);
        self
    }

    pub fn set_resolution_timeout(&mut self, timeout: Option<Duration>) {
        self.resolution_timeout = timeout;
    }

    pub fn resolution_timeout(&self) -> Option<Duration> {
        self.resolution_timeout
    }

    pub fn add_route(&mut self, route: BackendRoute) {
        debug!(
            prefix = %route.path_prefix,
            host = %route.host,
            timeout_secs = route.request_timeout.map(|t| t.as_secs()),
            "Proxy route registered"
        );
        self.routes.push(route);
        // Stable, so equal-length prefixes keep registration order
        self.routes
            .sort_by(|a, b| b.path_prefix.len().cmp(&a.path_prefix.len()));
    }

    pub fn routes(&self) -> &[BackendRoute] {
        &self.routes
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The most specific route whose prefix covers `path`
    pub fn match_route(&self, path: &str) -> Option<&BackendRoute> {
        self.routes.iter().find(|route| route.matches(path))
    }

    /// Proxy `req` if a route matches, otherwise hand it back untouched
    pub async fn handle(&self, req: SpaRequest) -> Result<Result<SpaResponse, SpaError>, SpaRequest> {
        match self.match_route(req.uri().path()) {
            Some(route) => Ok(self.forward(route, req).await),
            None => Err(req),
        }
    }

    /// Forward `req` to `route`'s backend, waiting for its port if needed
    pub async fn forward(&self, route: &BackendRoute, mut req: SpaRequest) -> Result<SpaResponse, SpaError> {
        let port = match self.resolution_timeout {
            Some(timeout) => {
                route
                    .port
                    .wait_timeout(timeout, &format!("backend port for {}", route.path_prefix))
                    .await?
            }
            None => route.port.wait().await?,
        };

        set_proxy_headers(&mut req);

        let base = route.base_url(port);
        debug!(method = %req.method(), uri = %req.uri(), backend = %base, "Proxying request");

        let round_trip = self.pool.send_request(req, &base);
        let result = match route.request_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, round_trip).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(backend = %base, timeout_secs = timeout.as_secs(), "Request timed out");
                    return Err(SpaError::ProxyTimeout(timeout));
                }
            },
            None => round_trip.await,
        };

        result.map_err(|e| {
            error!(backend = %base, error = %e, "Failed to forward request");
            SpaError::Proxy(format!("failed to reach {}: {}", base, e))
        })
    }
}

/// Security: X-Forwarded-* values are overwritten rather than appended, this
/// router being the first trusted hop.
fn set_proxy_headers(req: &mut SpaRequest) {
    let client_ip = req.extensions().get::<ClientAddr>().map(|addr| addr.0.ip());
    let is_tls = req.uri().scheme_str() == Some("https");
    let headers = req.headers_mut();

    if !headers.contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            headers.insert(X_REQUEST_ID, value);
        }
    }

    if let Some(ip) = client_ip {
        if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    let proto = if is_tls { "https" } else { "http" };
    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
}
