//! Request dispatch: match, select, pin, forward, record.

use chrono::Utc;
use http_body_util::BodyExt;
use hyper::header::{self, HeaderValue};
use hyper::{Request, Response};
use meridian_admin::{BackendStatus, RouteStatus, StatusSource};
use meridian_core::config::Config;
use meridian_core::{Router, SharedRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time;
use tracing::{debug, warn};

use crate::error::{ProxyError, Result};
use crate::headers::{append_forwarded, strip_hop_by_hop};
use crate::logging::{AccessLog, AccessRecord};
use crate::pool::BackendPool;
use crate::upstream::Upstream;
use crate::ProxyBody;

/// The request-handling entry point.
///
/// Holds an explicitly constructed [`Router`]; several dispatchers can
/// coexist in one process.
pub struct Dispatcher {
    router: SharedRouter<BackendPool>,
    access_log: Arc<dyn AccessLog>,
    backend_timeout: Duration,
    response_timeout: Option<Duration>,
    tls: bool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.router.len())
            .field("backend_timeout", &self.backend_timeout)
            .field("response_timeout", &self.response_timeout)
            .field("tls", &self.tls)
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher over an existing router.
    pub fn new(router: SharedRouter<BackendPool>, access_log: Arc<dyn AccessLog>, backend_timeout: Duration) -> Self {
        Self {
            router,
            access_log,
            backend_timeout,
            response_timeout: None,
            tls: false,
        }
    }

    /// Bound the time from receiving a request to sending its response head.
    ///
    /// The backend round-trip deadline still applies inside this one.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = Some(timeout);
        self
    }

    /// Build every route in `config`, in order, and register it.
    ///
    /// Any failure aborts construction; there is no partial start.
    pub fn from_config(config: &Config, access_log: Arc<dyn AccessLog>) -> Result<Self> {
        let router = Arc::new(Router::new());
        for (index, route) in config.routes.iter().enumerate() {
            let key = route.key(index);
            let pool = BackendPool::from_route(key.clone(), route, config)?;
            router.add_route(key, Arc::new(pool))?;
        }

        let mut dispatcher = Self::new(router, access_log, config.defaults.backend_read_timeout()?)
            .with_response_timeout(config.defaults.write_timeout()?);
        dispatcher.tls = config.tls.as_ref().is_some_and(|tls| tls.enabled);
        Ok(dispatcher)
    }

    /// The route registry.
    pub fn router(&self) -> &SharedRouter<BackendPool> {
        &self.router
    }

    /// Handle one request. Always produces a response and exactly one access record.
    pub async fn dispatch(&self, req: Request<ProxyBody>, client: Option<SocketAddr>) -> Response<ProxyBody> {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        let (backend, outcome) = match self.response_timeout {
            Some(timeout) => match time::timeout(timeout, self.handle(req, client)).await {
                Ok(handled) => handled,
                Err(_) => (None, Err(ProxyError::ResponseTimeout { timeout })),
            },
            None => self.handle(req, client).await,
        };
        let response = match outcome {
            Ok(response) => response,
            Err(err) => {
                let response = err.to_response();
                if response.status().is_server_error() {
                    warn!(%method, %path, backend = backend.as_deref(), error = %err, "request failed");
                } else {
                    debug!(%method, %path, error = %err, "request rejected");
                }
                response
            }
        };

        self.access_log.record(&AccessRecord {
            method,
            path,
            status: response.status(),
            elapsed: start.elapsed(),
            backend,
            client,
        });
        response
    }

    /// Stop every route's background work.
    pub fn shutdown(&self) {
        for (_, pool) in self.router.routes() {
            pool.shutdown();
        }
    }

    async fn handle(
        &self,
        mut req: Request<ProxyBody>,
        client: Option<SocketAddr>,
    ) -> (Option<String>, Result<Response<ProxyBody>>) {
        let host = request_host(&req);
        let path = req.uri().path();
        let method = req.method().as_str();

        let Some(pool) = self.router.first_match(|pool| pool.matches(&host, path, method)) else {
            let err = ProxyError::NoRouteMatch {
                method: method.to_string(),
                host,
                path: path.to_string(),
            };
            return (None, Err(err));
        };

        let upstream = match choose(&pool, &req) {
            Ok(upstream) => upstream,
            Err(err) => return (None, Err(err)),
        };
        let address = upstream.address().to_string();

        strip_hop_by_hop(req.headers_mut());
        append_forwarded(req.headers_mut(), client, &host, self.tls);

        let outcome = self.forward(upstream, req).await.map(|mut response| {
            if let Some(sticky) = pool.sticky() {
                match sticky.set_cookie(&address, Utc::now()) {
                    Ok(cookie) => {
                        response.headers_mut().append(header::SET_COOKIE, cookie);
                    }
                    Err(err) => warn!(route = pool.key(), error = %err, "cannot encode affinity cookie"),
                }
            }
            response
        });
        (Some(address), outcome)
    }

    async fn forward(&self, upstream: &Upstream, req: Request<ProxyBody>) -> Result<Response<ProxyBody>> {
        let ewma = upstream.backend().ewma();
        let _in_flight = ewma.start_request();
        let sent = Instant::now();

        let response = match time::timeout(self.backend_timeout, upstream.forward(req)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ProxyError::Timeout {
                    backend: upstream.address().to_string(),
                    timeout: self.backend_timeout,
                })
            }
        };
        ewma.observe(sent.elapsed().as_secs_f64() * 1000.0);

        let mut response = response.map(|body| body.boxed());
        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }
}

impl StatusSource for Dispatcher {
    fn snapshot(&self) -> Vec<RouteStatus> {
        self.router
            .routes()
            .into_iter()
            .map(|(key, pool)| RouteStatus {
                id: key,
                strategy: pool.balancer().name().to_string(),
                sticky: pool.sticky().is_some(),
                health_checked: pool.health().is_some(),
                backends: pool
                    .upstreams()
                    .iter()
                    .map(|upstream| {
                        let backend = upstream.backend();
                        BackendStatus {
                            address: upstream.address().to_string(),
                            healthy: backend.is_healthy(),
                            in_flight: backend.ewma().in_flight(),
                            latency_ms: backend.ewma().latency_ms(),
                        }
                    })
                    .collect(),
            })
            .collect()
    }
}

/// Sticky affinity first, then the balancer.
fn choose<'p>(pool: &'p BackendPool, req: &Request<ProxyBody>) -> Result<&'p Upstream> {
    if let Some(pinned) = pool
        .sticky()
        .and_then(|sticky| sticky.affinity(req.headers()))
        .and_then(|address| pool.healthy_by_address(address))
    {
        return Ok(pinned);
    }
    pool.select()
}

fn request_host(req: &Request<ProxyBody>) -> String {
    req.headers()
        .get(header::HOST)
        .and_then(|value: &HeaderValue| value.to_str().ok())
        .or_else(|| req.uri().authority().map(|authority| authority.as_str()))
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::testing::MemoryAccessLog;
    use crate::sticky::StickyPolicy;
    use crate::upstream::http_client;
    use crate::{empty, full};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::TokioIo;
    use meridian_core::config::MatchConfig;
    use meridian_core::{BackendId, RoundRobin, RouteMatcher};
    use std::convert::Infallible;
    use tokio::net::TcpListener;

    /// A backend answering every request with its own tag.
    async fn tagged_backend(tag: &'static str) -> SocketAddr {
        slow_backend(tag, Duration::ZERO).await
    }

    /// A backend that waits `delay` before answering with its tag.
    async fn slow_backend(tag: &'static str, delay: Duration) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let service = service_fn(move |_req: Request<hyper::body::Incoming>| async move {
                        time::sleep(delay).await;
                        Ok::<_, Infallible>(Response::new(full(tag)))
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn pool(key: &str, path: &str, backends: &[SocketAddr], sticky: Option<StickyPolicy>) -> Arc<BackendPool> {
        let client = http_client(Duration::from_millis(500), Duration::from_secs(30));
        let upstreams = backends
            .iter()
            .enumerate()
            .map(|(i, addr)| Upstream::parse(BackendId(i as u32), &addr.to_string(), true, client.clone()).unwrap())
            .collect();
        let matcher = RouteMatcher::new(&MatchConfig {
            path: path.to_string(),
            ..MatchConfig::default()
        });
        Arc::new(BackendPool::new(key, matcher, upstreams, Box::new(RoundRobin::default()), sticky).unwrap())
    }

    fn dispatcher(pools: Vec<Arc<BackendPool>>) -> (Dispatcher, Arc<MemoryAccessLog>) {
        let router = Arc::new(Router::new());
        for pool in pools {
            router.add_route(pool.key().to_string(), pool).unwrap();
        }
        let log = Arc::new(MemoryAccessLog::default());
        let dispatcher = Dispatcher::new(router, log.clone(), Duration::from_secs(2));
        (dispatcher, log)
    }

    fn get(path: &str) -> Request<ProxyBody> {
        Request::builder()
            .uri(path)
            .header(header::HOST, "lb.local")
            .body(empty())
            .unwrap()
    }

    async fn body_text(response: Response<ProxyBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn alternates_between_backends_and_skips_unhealthy() {
        let a = tagged_backend("A").await;
        let b = tagged_backend("B").await;
        let root = pool("root", "/", &[a, b], None);
        let (dispatcher, _) = dispatcher(vec![Arc::clone(&root)]);

        let mut tags = Vec::new();
        for _ in 0..4 {
            tags.push(body_text(dispatcher.dispatch(get("/"), None).await).await);
        }
        assert_eq!(tags, ["A", "B", "A", "B"]);

        root.upstreams()[0].backend().set_healthy(false);
        for _ in 0..3 {
            assert_eq!(body_text(dispatcher.dispatch(get("/x"), None).await).await, "B");
        }

        root.upstreams()[0].backend().set_healthy(true);
        let mut recovered = Vec::new();
        for _ in 0..2 {
            recovered.push(body_text(dispatcher.dispatch(get("/"), None).await).await);
        }
        recovered.sort();
        assert_eq!(recovered, ["A", "B"]);
    }

    #[tokio::test]
    async fn first_registered_route_wins() {
        let a = tagged_backend("A").await;
        let b = tagged_backend("B").await;
        let (dispatcher, _) = dispatcher(vec![pool("wide", "/", &[a], None), pool("api", "/api", &[b], None)]);

        let response = dispatcher.dispatch(get("/api/users"), None).await;
        assert_eq!(body_text(response).await, "A");
    }

    #[tokio::test]
    async fn unmatched_request_is_404_and_recorded() {
        let a = tagged_backend("A").await;
        let (dispatcher, log) = dispatcher(vec![pool("api", "/api", &[a], None)]);

        let response = dispatcher.dispatch(get("/apix"), None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StatusCode::NOT_FOUND);
        assert_eq!(records[0].path, "/apix");
        assert_eq!(records[0].backend, None);
    }

    #[tokio::test]
    async fn all_unhealthy_is_503() {
        let a = tagged_backend("A").await;
        let root = pool("root", "/", &[a], None);
        root.upstreams()[0].backend().set_healthy(false);
        let (dispatcher, log) = dispatcher(vec![root]);

        let response = dispatcher.dispatch(get("/"), None).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(log.records()[0].status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn refused_backend_is_502_without_health_change() {
        let closed = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let root = pool("root", "/", &[closed], None);
        let (dispatcher, log) = dispatcher(vec![Arc::clone(&root)]);

        let response = dispatcher.dispatch(get("/"), None).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert!(root.upstreams()[0].backend().is_healthy());

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].backend.as_deref(), Some(closed.to_string().as_str()));
    }

    #[tokio::test]
    async fn response_deadline_bounds_slow_backend() {
        let slow = slow_backend("S", Duration::from_millis(800)).await;
        let router = Arc::new(Router::new());
        router.add_route("root", pool("root", "/", &[slow], None)).unwrap();
        let log = Arc::new(MemoryAccessLog::default());
        let dispatcher = Dispatcher::new(router, log.clone(), Duration::from_secs(5))
            .with_response_timeout(Duration::from_millis(100));

        let start = Instant::now();
        let response = dispatcher.dispatch(get("/"), None).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(start.elapsed() < Duration::from_millis(600), "{:?}", start.elapsed());

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn backend_deadline_applies_inside_response_deadline() {
        let slow = slow_backend("S", Duration::from_millis(800)).await;
        let router = Arc::new(Router::new());
        router.add_route("root", pool("root", "/", &[slow], None)).unwrap();
        let dispatcher = Dispatcher::new(router, Arc::new(MemoryAccessLog::default()), Duration::from_millis(100))
            .with_response_timeout(Duration::from_secs(5));

        let response = dispatcher.dispatch(get("/"), None).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[tokio::test]
    async fn write_timeout_is_the_response_deadline() {
        let slow = slow_backend("S", Duration::from_millis(800)).await;
        let config = Config::from_yaml(&format!(
            "defaults:\n  write_timeout: 100ms\n  backend_read_timeout: 5s\nroutes:\n  - backend: \"{slow}\"\n"
        ))
        .unwrap();
        let dispatcher = Dispatcher::from_config(&config, Arc::new(MemoryAccessLog::default())).unwrap();

        let start = Instant::now();
        let response = dispatcher.dispatch(get("/"), None).await;
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(start.elapsed() < Duration::from_millis(600), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn success_is_recorded_once_with_backend() {
        let a = tagged_backend("A").await;
        let (dispatcher, log) = dispatcher(vec![pool("root", "/", &[a], None)]);

        let response = dispatcher.dispatch(get("/hello?x=1"), None).await;
        assert_eq!(response.status(), StatusCode::OK);

        let records = log.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method, hyper::Method::GET);
        assert_eq!(records[0].path, "/hello");
        assert_eq!(records[0].backend.as_deref(), Some(a.to_string().as_str()));
    }

    #[tokio::test]
    async fn sticky_cookie_names_chosen_backend() {
        let a = tagged_backend("A").await;
        let b = tagged_backend("B").await;
        let sticky = StickyPolicy::new("X", Duration::from_secs(3600));
        let (dispatcher, _) = dispatcher(vec![pool("root", "/", &[a, b], Some(sticky))]);

        let response = dispatcher.dispatch(get("/"), None).await;
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with(&format!("X={a};")), "{cookie}");
        assert!(cookie.contains("Max-Age=3600"), "{cookie}");
        assert_eq!(body_text(response).await, "A");
    }

    #[tokio::test]
    async fn affinity_cookie_pins_healthy_backend() {
        let a = tagged_backend("A").await;
        let b = tagged_backend("B").await;
        let sticky = StickyPolicy::new("X", Duration::from_secs(60));
        let root = pool("root", "/", &[a, b], Some(sticky));
        let (dispatcher, _) = dispatcher(vec![Arc::clone(&root)]);

        let pinned = || {
            let mut req = get("/");
            req.headers_mut()
                .insert(header::COOKIE, HeaderValue::from_str(&format!("X={b}")).unwrap());
            req
        };
        for _ in 0..3 {
            assert_eq!(body_text(dispatcher.dispatch(pinned(), None).await).await, "B");
        }

        // A pinned backend that went down falls back to the balancer.
        root.upstreams()[1].backend().set_healthy(false);
        assert_eq!(body_text(dispatcher.dispatch(pinned(), None).await).await, "A");
    }

    #[tokio::test]
    async fn snapshot_reports_routes_in_order() {
        let a = tagged_backend("A").await;
        let b = tagged_backend("B").await;
        let api = pool("api", "/api", &[a, b], Some(StickyPolicy::new("X", Duration::from_secs(60))));
        api.upstreams()[1].backend().set_healthy(false);
        let (dispatcher, _) = dispatcher(vec![api, pool("root", "/", &[a], None)]);

        let snapshot = dispatcher.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].id, "api");
        assert_eq!(snapshot[0].strategy, "round-robin");
        assert!(snapshot[0].sticky);
        assert!(!snapshot[0].health_checked);
        assert_eq!(snapshot[0].backends[0].address, a.to_string());
        assert!(snapshot[0].backends[0].healthy);
        assert!(!snapshot[0].backends[1].healthy);
        assert_eq!(snapshot[1].id, "root");
        assert!(!snapshot[1].sticky);
    }

    #[tokio::test]
    async fn no_cookie_without_sticky_policy() {
        let a = tagged_backend("A").await;
        let (dispatcher, _) = dispatcher(vec![pool("root", "/", &[a], None)]);
        let response = dispatcher.dispatch(get("/"), None).await;
        assert!(!response.headers().contains_key(header::SET_COOKIE));
    }
}
