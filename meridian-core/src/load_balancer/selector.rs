//! Load Balancing Selector logic
//!
//! A [`Balancer`] only ever sees the healthy subset of a pool; filtering on
//! the health flag happens once, in [`select`], so every strategy gets the
//! same eligibility rules.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::warn;

use crate::domain::backend::Backend;
use crate::error::{Error, Result};

/// A selection policy over the healthy backends of one pool.
pub trait Balancer: Send + Sync + fmt::Debug {
    /// Strategy name as written in configuration.
    fn name(&self) -> &'static str;

    /// Choose one of `healthy`, which is never empty. Returns an index into it.
    fn pick(&self, healthy: &[&Backend]) -> usize;
}

/// Filters `candidates` down to healthy backends and lets `balancer` choose one.
///
/// Fails with [`Error::NoHealthyBackend`] when no candidate is healthy.
pub fn select<'a, T: AsRef<Backend>>(balancer: &dyn Balancer, candidates: &'a [T]) -> Result<&'a T> {
    let (positions, healthy): (Vec<usize>, Vec<&Backend>) = candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| (position, candidate.as_ref()))
        .filter(|(_, backend)| backend.is_healthy())
        .unzip();

    if healthy.is_empty() {
        return Err(Error::NoHealthyBackend);
    }

    let chosen = balancer.pick(&healthy) % healthy.len();
    Ok(&candidates[positions[chosen]])
}

/// Builds the strategy named in a route's `lb` setting.
///
/// Unknown names fall back to round-robin.
pub fn strategy(name: &str) -> Box<dyn Balancer> {
    match name {
        "" | RoundRobin::NAME => Box::new(RoundRobin::default()),
        LeastLatency::NAME => Box::new(LeastLatency::default()),
        other => {
            warn!(strategy = other, "unknown balancing strategy, using round-robin");
            Box::new(RoundRobin::default())
        }
    }
}

/// Cycles through the healthy backends in pool order.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Configuration name of this strategy.
    pub const NAME: &'static str = "round-robin";
}

impl Balancer for RoundRobin {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn pick(&self, healthy: &[&Backend]) -> usize {
        // The returned value is the position; never reload the counter.
        self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len()
    }
}

/// Picks the healthy backend with the lowest Peak EWMA score.
///
/// Ties are broken by a rotating start position so idle backends share load.
#[derive(Debug, Default)]
pub struct LeastLatency {
    counter: AtomicUsize,
}

impl LeastLatency {
    /// Configuration name of this strategy.
    pub const NAME: &'static str = "least-latency";
}

impl Balancer for LeastLatency {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn pick(&self, healthy: &[&Backend]) -> usize {
        let len = healthy.len();
        let start = self.counter.fetch_add(1, Ordering::Relaxed) % len;

        let mut best = start;
        let mut best_score = healthy[start].ewma().score();
        for offset in 1..len {
            let position = (start + offset) % len;
            let score = healthy[position].ewma().score();
            if score < best_score {
                best = position;
                best_score = score;
            }
        }
        best
    }
}
