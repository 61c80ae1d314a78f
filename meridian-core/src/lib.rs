//! Meridian Core functionality.
//!
//! This crate contains the configuration model, the backend and routing
//! primitives, and the balancing strategies that power the Meridian load
//! balancer. It performs no network I/O of its own.

pub mod config;
pub mod error;

/// Backends, request matching and the route registry.
pub mod domain {
    pub mod backend;
    pub mod router;
    pub mod routing;
}

/// Selection strategies over a pool's healthy backends.
pub mod load_balancer {
    pub mod ewma;
    pub mod selector;
}

pub use config::Config;
pub use domain::backend::{Backend, BackendId, SharedBackend};
pub use domain::router::{Router, SharedRouter};
pub use domain::routing::RouteMatcher;
pub use error::{Error, Result};
pub use load_balancer::selector::{select, strategy, Balancer, LeastLatency, RoundRobin};
