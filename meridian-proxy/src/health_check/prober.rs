//! Background prober for active HTTP health checks.

use hyper::StatusCode;
use meridian_core::config::HealthConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info};

use crate::error::{ProxyError, Result};
use crate::upstream::{ProbeSpec, Upstream};

/// Periodically probes every backend of one pool and updates its health flag.
///
/// The checker is the only writer of those flags once the pool is built.
/// Each tick spawns one probe task per backend, so a slow backend never
/// delays the verdict on the others. A backend whose previous check is still
/// outstanding is skipped for that tick, so results are recorded in the
/// order the checks were issued. [`HealthChecker::stop`] cancels future
/// ticks; probes already in flight still complete and record their result.
#[derive(Debug)]
pub struct HealthChecker {
    route: String,
    upstreams: Arc<[Upstream]>,
    spec: Arc<ProbeSpec>,
    in_flight: Arc<[AtomicBool]>,
    interval: Duration,
    ticker: Mutex<Option<JoinHandle<()>>>,
}

impl HealthChecker {
    /// Create a stopped checker for `upstreams`.
    pub fn new(route: impl Into<String>, upstreams: Arc<[Upstream]>, spec: ProbeSpec, interval: Duration) -> Self {
        let in_flight = upstreams.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            route: route.into(),
            upstreams,
            spec: Arc::new(spec),
            in_flight,
            interval,
            ticker: Mutex::new(None),
        }
    }

    /// Create a stopped checker from a route's health configuration.
    ///
    /// The check timeout may not exceed the interval.
    pub fn from_config(route: impl Into<String>, upstreams: Arc<[Upstream]>, config: &HealthConfig) -> Result<Self> {
        let expected = StatusCode::from_u16(config.expected_status).map_err(|_| {
            ProxyError::Core(meridian_core::Error::Config(format!(
                "invalid health expected_status {}",
                config.expected_status
            )))
        })?;
        let interval = config.interval()?;
        let timeout = config.timeout()?;
        if timeout > interval {
            return Err(ProxyError::Core(meridian_core::Error::Config(format!(
                "health timeout {timeout:?} exceeds interval {interval:?}"
            ))));
        }
        let spec = ProbeSpec {
            path: config.path.clone(),
            expected,
            timeout,
        };
        Ok(Self::new(route, upstreams, spec, interval))
    }

    /// Time between probe cycles.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start ticking. The first probe cycle runs immediately.
    ///
    /// Must be called within a Tokio runtime. Calling it on a running
    /// checker has no effect.
    pub fn start(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let route = self.route.clone();
        let upstreams = Arc::clone(&self.upstreams);
        let spec = Arc::clone(&self.spec);
        let in_flight = Arc::clone(&self.in_flight);
        let period = self.interval;

        info!(route = %route, interval = ?period, backends = upstreams.len(), "starting health checks");

        *ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                debug!(route = %route, "running probe cycle");
                probe_all(&route, &upstreams, &in_flight, &spec);
            }
        }));
    }

    /// Stop ticking. In-flight probes are left to finish.
    pub fn stop(&self) {
        if let Some(task) = self.ticker.lock().take() {
            task.abort();
            info!(route = %self.route, "stopped health checks");
        }
    }

    /// Whether the ticker is active.
    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl Drop for HealthChecker {
    fn drop(&mut self) {
        if let Some(task) = self.ticker.get_mut().take() {
            task.abort();
        }
    }
}

fn probe_all(route: &str, upstreams: &Arc<[Upstream]>, in_flight: &Arc<[AtomicBool]>, spec: &Arc<ProbeSpec>) {
    for index in 0..upstreams.len() {
        if in_flight[index]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(route, backend = upstreams[index].address(), "previous check still running, skipping");
            continue;
        }

        let upstreams = Arc::clone(upstreams);
        let in_flight = Arc::clone(in_flight);
        let spec = Arc::clone(spec);
        tokio::spawn(async move {
            let _slot = CheckSlot {
                in_flight: &in_flight[index],
            };
            upstreams[index].probe(&spec).await;
        });
    }
}

/// Releases a backend's slot when its check finishes or is cancelled.
struct CheckSlot<'a> {
    in_flight: &'a AtomicBool,
}

impl Drop for CheckSlot<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}
