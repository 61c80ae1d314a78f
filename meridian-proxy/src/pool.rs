//! Per-route backend pools.

use meridian_core::config::{Config, Route};
use meridian_core::{select, strategy, Balancer, BackendId, RouteMatcher};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{ProxyError, Result};
use crate::health_check::prober::HealthChecker;
use crate::sticky::StickyPolicy;
use crate::upstream::{http_client, Upstream};

/// The backends, balancing strategy and policies serving one route.
///
/// The backend list is fixed at construction and shared read-only with the
/// health checker, so iterating it never takes a lock.
#[derive(Debug)]
pub struct BackendPool {
    key: String,
    matcher: RouteMatcher,
    upstreams: Arc<[Upstream]>,
    balancer: Box<dyn Balancer>,
    health: Option<HealthChecker>,
    sticky: Option<StickyPolicy>,
}

impl BackendPool {
    /// Assemble a pool from parts. Fails if `upstreams` is empty.
    pub fn new(
        key: impl Into<String>,
        matcher: RouteMatcher,
        upstreams: Vec<Upstream>,
        balancer: Box<dyn Balancer>,
        sticky: Option<StickyPolicy>,
    ) -> Result<Self> {
        let key = key.into();
        if upstreams.is_empty() {
            return Err(meridian_core::Error::Config(format!(
                "no backend(s) configured for route: {key}"
            ))
            .into());
        }

        Ok(Self {
            key,
            matcher,
            upstreams: upstreams.into(),
            balancer,
            health: None,
            sticky,
        })
    }

    /// Build the pool for `route` and start its health checks.
    ///
    /// Without a health section every backend starts healthy and is never
    /// probed; with one, backends start unhealthy until their first probe.
    /// Must be called within a Tokio runtime when health checks are configured.
    pub fn from_route(key: impl Into<String>, route: &Route, config: &Config) -> Result<Self> {
        let key = key.into();
        let addresses = route.resolve_backends(&config.backends);

        let client = http_client(
            config.defaults.backend_connect_timeout()?,
            config.defaults.connection_keep_alive()?,
        );
        let checked = route.health.is_some();
        let mut upstreams: Vec<Upstream> = Vec::with_capacity(addresses.len());
        for address in &addresses {
            let id = BackendId(upstreams.len() as u32);
            let upstream = Upstream::parse(id, address, !checked, client.clone())?;
            // Spellings such as `http://h:80` and `h:80` name the same backend.
            if upstreams.iter().any(|known| known.address() == upstream.address()) {
                debug!(route = %key, backend = upstream.address(), "duplicate backend ignored");
                continue;
            }
            upstreams.push(upstream);
        }

        if route.retry.as_ref().is_some_and(|retry| retry.enabled) {
            warn!(route = %key, "retry policy is configured but not enforced");
        }
        if route.rate_limit.as_ref().is_some_and(|limit| limit.enabled) {
            warn!(route = %key, "rate limit is configured but not enforced");
        }

        let mut pool = Self::new(
            key,
            RouteMatcher::new(&route.matcher),
            upstreams,
            strategy(&route.lb),
            route.sticky().map(StickyPolicy::from_config),
        )?;

        if let Some(health) = &route.health {
            let checker = HealthChecker::from_config(pool.key.clone(), Arc::clone(&pool.upstreams), health)?;
            checker.start();
            pool.health = Some(checker);
        }

        info!(
            route = %pool.key,
            backends = pool.upstreams.len(),
            strategy = pool.balancer.name(),
            sticky = pool.sticky.is_some(),
            health_checked = pool.health.is_some(),
            "route ready"
        );
        Ok(pool)
    }

    /// Registry key of the route.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Whether the request belongs to this route.
    pub fn matches(&self, host: &str, path: &str, method: &str) -> bool {
        self.matcher.matches(host, path, method)
    }

    /// All backends, healthy or not, in configuration order.
    pub fn upstreams(&self) -> &[Upstream] {
        &self.upstreams
    }

    /// The route's balancing strategy.
    pub fn balancer(&self) -> &dyn Balancer {
        self.balancer.as_ref()
    }

    /// Affinity policy, when sticky sessions are enabled.
    pub fn sticky(&self) -> Option<&StickyPolicy> {
        self.sticky.as_ref()
    }

    /// The route's health checker, when health checks are configured.
    pub fn health(&self) -> Option<&HealthChecker> {
        self.health.as_ref()
    }

    /// Let the balancer choose among the healthy backends.
    pub fn select(&self) -> Result<&Upstream> {
        select(self.balancer.as_ref(), &self.upstreams[..]).map_err(ProxyError::from)
    }

    /// The backend at `address`, if it belongs to this pool and is healthy.
    pub fn healthy_by_address(&self, address: &str) -> Option<&Upstream> {
        self.upstreams
            .iter()
            .find(|upstream| upstream.address() == address && upstream.backend().is_healthy())
    }

    /// Stop background health checks.
    pub fn shutdown(&self) {
        if let Some(health) = &self.health {
            health.stop();
        }
    }
}
