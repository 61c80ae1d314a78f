//! Forwarding handles for backend servers.
//!
//! Every [`Upstream`] pairs a core [`Backend`] with a clone of its pool's
//! keep-alive HTTP client. Clones share one connection pool, so requests
//! to the same backend reuse idle connections regardless of which task
//! sends them.

use hyper::body::Incoming;
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use meridian_core::{Backend, BackendId, SharedBackend};
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::{empty, ProxyBody};

/// Pooled HTTP/1.1 client shared by the backends of one route.
pub type HttpClient = Client<HttpConnector, ProxyBody>;

/// Build a keep-alive client with the configured connect deadline.
pub fn http_client(connect_timeout: Duration, keep_alive: Duration) -> HttpClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(connect_timeout));
    connector.set_keepalive(Some(keep_alive));
    connector.set_nodelay(true);

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(100)
        .build(connector)
}

/// What a health probe asks of a backend.
#[derive(Debug, Clone)]
pub struct ProbeSpec {
    /// Path requested on the backend.
    pub path: String,
    /// Status code that counts as healthy.
    pub expected: StatusCode,
    /// Deadline for the whole probe.
    pub timeout: Duration,
}

/// One backend plus the handle used to reach it.
#[derive(Debug)]
pub struct Upstream {
    backend: SharedBackend,
    authority: Authority,
    base_path: String,
    client: HttpClient,
}

impl Upstream {
    /// Parse a configured address (`http://host:port/base` or `host:port`).
    ///
    /// Only plain HTTP backends are supported.
    pub fn parse(id: BackendId, address: &str, healthy: bool, client: HttpClient) -> Result<Self> {
        let invalid = |reason: &str| ProxyError::InvalidBackend {
            address: address.to_string(),
            reason: reason.to_string(),
        };

        let address = address.trim();
        let uri: Uri = if address.contains("://") {
            address.parse()
        } else {
            format!("http://{address}").parse()
        }
        .map_err(|_| invalid("not a valid URI"))?;

        if uri.scheme() != Some(&Scheme::HTTP) {
            return Err(invalid("only http:// backends are supported"));
        }
        let authority = uri.authority().cloned().ok_or_else(|| invalid("missing host"))?;
        let base_path = uri.path().trim_end_matches('/').to_string();

        Ok(Self {
            backend: Arc::new(Backend::new(id, authority.as_str(), healthy)),
            authority,
            base_path,
            client,
        })
    }

    /// The backend's shared health and latency state.
    pub fn backend(&self) -> &SharedBackend {
        &self.backend
    }

    /// Shorthand for the backend's `host:port`.
    pub fn address(&self) -> &str {
        self.backend.address()
    }

    /// Target URI for `path_and_query` on this backend.
    pub fn target(&self, path_and_query: Option<&PathAndQuery>) -> Result<Uri> {
        let tail = path_and_query.map(PathAndQuery::as_str).unwrap_or("/");
        Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(format!("{}{}", self.base_path, tail))
            .build()
            .map_err(|err| ProxyError::InvalidBackend {
                address: self.address().to_string(),
                reason: err.to_string(),
            })
    }

    /// Send `req` to this backend. The request URI is rewritten to point at it.
    ///
    /// Transport failures are returned as [`ProxyError::Upstream`] and never retried.
    pub async fn forward(&self, mut req: Request<ProxyBody>) -> Result<Response<Incoming>> {
        *req.uri_mut() = self.target(req.uri().path_and_query())?;

        self.client
            .request(req)
            .await
            .map_err(|source| ProxyError::Upstream {
                backend: self.address().to_string(),
                source,
            })
    }

    /// Probe the backend and record the outcome in its health flag.
    ///
    /// Failures are absorbed; the returned value is the new health state.
    pub async fn probe(&self, spec: &ProbeSpec) -> bool {
        let healthy = match self.probe_status(spec).await {
            Ok(status) if status == spec.expected => true,
            Ok(status) => {
                debug!(backend = self.address(), %status, "probe returned unexpected status");
                false
            }
            Err(reason) => {
                debug!(backend = self.address(), %reason, "probe failed");
                false
            }
        };

        let was_healthy = self.backend.set_healthy(healthy);
        if healthy != was_healthy {
            if healthy {
                info!(backend = self.address(), "backend is healthy");
            } else {
                warn!(backend = self.address(), "backend is unhealthy");
            }
        }
        healthy
    }

    async fn probe_status(&self, spec: &ProbeSpec) -> std::result::Result<StatusCode, String> {
        let path = if spec.path.starts_with('/') {
            spec.path.clone()
        } else {
            format!("/{}", spec.path)
        };
        let uri = Uri::builder()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path)
            .build()
            .map_err(|err| err.to_string())?;
        let req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(empty())
            .map_err(|err| err.to_string())?;

        match time::timeout(spec.timeout, self.client.request(req)).await {
            Ok(Ok(response)) => Ok(response.status()),
            Ok(Err(err)) => Err(err.to_string()),
            Err(_) => Err(format!("timed out after {:?}", spec.timeout)),
        }
    }
}

impl AsRef<Backend> for Upstream {
    fn as_ref(&self) -> &Backend {
        &self.backend
    }
}
