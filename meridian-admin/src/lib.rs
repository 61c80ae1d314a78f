//! Meridian Admin Endpoint
//!
//! A small HTTP listener answering liveness checks and serving a JSON
//! snapshot of route and backend health. It is read-only: nothing here can
//! change routing state.

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Response, StatusCode};
use hyper_util::rt::TokioIo;
use meridian_core::config::AdminConfig;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

/// Anything able to describe the current routing state.
pub trait StatusSource: Send + Sync {
    /// One entry per registered route, in registration order.
    fn snapshot(&self) -> Vec<RouteStatus>;
}

/// Health summary of one route.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteStatus {
    /// Route key.
    pub id: String,
    /// Balancing strategy name.
    pub strategy: String,
    /// Whether sticky sessions are enabled.
    pub sticky: bool,
    /// Whether the route is actively probed.
    pub health_checked: bool,
    /// Backends in configuration order.
    pub backends: Vec<BackendStatus>,
}

/// Health summary of one backend.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendStatus {
    /// `host:port` of the backend.
    pub address: String,
    /// Current health flag.
    pub healthy: bool,
    /// Requests currently outstanding.
    pub in_flight: u64,
    /// Peak EWMA round-trip latency.
    pub latency_ms: f64,
}

#[derive(Serialize)]
struct Snapshot {
    routes: Vec<RouteStatus>,
    healthy_backends: usize,
    total_backends: usize,
}

/// Request handler behind the admin listener.
#[derive(Clone)]
pub struct AdminService {
    health_path: String,
    metric_path: String,
    source: Arc<dyn StatusSource>,
}

impl AdminService {
    /// Create a handler for the configured endpoint paths.
    pub fn new(config: &AdminConfig, source: Arc<dyn StatusSource>) -> Self {
        Self {
            health_path: config.health_endpoint.clone(),
            metric_path: config.metric_endpoint.clone(),
            source,
        }
    }

    /// Answer one admin request.
    pub fn respond(&self, method: &Method, path: &str) -> Response<Full<Bytes>> {
        if method != Method::GET && method != Method::HEAD {
            return plain(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
        }

        if path == self.health_path {
            plain(StatusCode::OK, "ok")
        } else if path == self.metric_path {
            self.metrics()
        } else {
            plain(StatusCode::NOT_FOUND, "not found")
        }
    }

    fn metrics(&self) -> Response<Full<Bytes>> {
        let routes = self.source.snapshot();
        let backends = routes.iter().flat_map(|route| route.backends.iter());
        let snapshot = Snapshot {
            healthy_backends: backends.clone().filter(|backend| backend.healthy).count(),
            total_backends: backends.count(),
            routes,
        };

        match serde_json::to_vec(&snapshot) {
            Ok(body) => {
                let mut response = Response::new(Full::new(Bytes::from(body)));
                response
                    .headers_mut()
                    .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
                response
            }
            Err(err) => plain(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
        }
    }
}

fn plain(status: StatusCode, text: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(text.to_string())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

/// Serve admin requests on `listener` until the task is dropped.
pub async fn serve(
    listener: TcpListener,
    config: &AdminConfig,
    source: Arc<dyn StatusSource>,
) -> std::io::Result<()> {
    let admin = AdminService::new(config, source);
    info!(addr = %listener.local_addr()?, "admin endpoint listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        let admin = admin.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req: hyper::Request<hyper::body::Incoming>| {
                let response = admin.respond(req.method(), req.uri().path());
                async move { Ok::<_, Infallible>(response) }
            });
            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, error = %err, "admin connection closed with error");
            }
        });
    }
}
