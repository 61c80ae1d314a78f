//! Route registry.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Concurrency-safe registry of route keys to pools.
///
/// Entries keep their registration order, which is the order requests are
/// matched in. Readers share the lock; `add_route` and `delete_route` take
/// it exclusively, so a reader never observes a half-inserted route.
#[derive(Debug)]
pub struct Router<P> {
    routes: RwLock<Vec<(String, Arc<P>)>>,
}

impl<P> Default for Router<P> {
    fn default() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }
}

impl<P> Router<P> {
    /// Create an empty router.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pool` under `key`. Fails if the key is already taken.
    pub fn add_route(&self, key: impl Into<String>, pool: Arc<P>) -> Result<()> {
        let key = key.into();
        let mut routes = self.routes.write();
        if routes.iter().any(|(existing, _)| *existing == key) {
            return Err(Error::RouteExists(key));
        }
        routes.push((key, pool));
        Ok(())
    }

    /// Look up the pool registered under `key`.
    pub fn find_route(&self, key: &str) -> Result<Arc<P>> {
        self.routes
            .read()
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, pool)| Arc::clone(pool))
            .ok_or_else(|| Error::NoSuchRoute(key.to_string()))
    }

    /// Remove the pool registered under `key`, if any.
    pub fn delete_route(&self, key: &str) {
        self.routes.write().retain(|(existing, _)| existing != key);
    }

    /// The first pool, in registration order, accepted by `predicate`.
    pub fn first_match<F>(&self, mut predicate: F) -> Option<Arc<P>>
    where
        F: FnMut(&P) -> bool,
    {
        self.routes
            .read()
            .iter()
            .find(|(_, pool)| predicate(&**pool))
            .map(|(_, pool)| Arc::clone(pool))
    }

    /// Snapshot of every registered route, in registration order.
    pub fn routes(&self) -> Vec<(String, Arc<P>)> {
        self.routes.read().clone()
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    /// Whether no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

/// A shared reference to a router.
pub type SharedRouter<P> = Arc<Router<P>>;
