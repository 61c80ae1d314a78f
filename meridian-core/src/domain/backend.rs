//! Backend server models.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::load_balancer::ewma::PeakEwma;

/// Position of a backend inside its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendId(pub u32);

/// Represents a single upstream backend server.
///
/// The health flag is the only mutable eligibility state and is read
/// without holding any pool-level lock.
#[derive(Debug)]
pub struct Backend {
    /// The position of the backend within its pool
    pub id: BackendId,
    address: String,
    healthy: AtomicBool,
    ewma: PeakEwma,
}

impl Backend {
    /// Create a backend for `address` (`host:port`) with the given initial health.
    pub fn new(id: BackendId, address: impl Into<String>, healthy: bool) -> Self {
        Self {
            id,
            address: address.into(),
            healthy: AtomicBool::new(healthy),
            ewma: PeakEwma::default(),
        }
    }

    /// The `host:port` this backend forwards to.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Check if the backend is marked healthy
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Update the health flag, returning the previous value.
    pub fn set_healthy(&self, is_healthy: bool) -> bool {
        self.healthy.swap(is_healthy, Ordering::AcqRel)
    }

    /// Latency tracker fed by the dispatcher and read by latency-aware strategies.
    pub fn ewma(&self) -> &PeakEwma {
        &self.ewma
    }
}

impl AsRef<Backend> for Backend {
    fn as_ref(&self) -> &Backend {
        self
    }
}

/// A thread-safe reference to a Backend.
pub type SharedBackend = Arc<Backend>;
