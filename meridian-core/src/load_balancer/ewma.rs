//! Peak-sensitive exponentially weighted moving average of backend latency.
//!
//! A sample above the current average replaces it outright; a sample below
//! it is blended in with weight `1 - decay`. Slow spikes are therefore seen
//! immediately while recovery is gradual.

use std::sync::atomic::{AtomicU64, Ordering};

/// Decay applied when no explicit value is given.
pub const DEFAULT_DECAY: f64 = 0.5;

/// Lock-free latency tracker for one backend.
#[derive(Debug)]
pub struct PeakEwma {
    /// f64 bits of the current average, in milliseconds.
    ewma: AtomicU64,
    decay: f64,
    in_flight: AtomicU64,
}

impl Default for PeakEwma {
    fn default() -> Self {
        Self::new(0.0, DEFAULT_DECAY)
    }
}

impl PeakEwma {
    /// Create a tracker seeded with `initial_ms` and the given decay in `[0, 1]`.
    pub fn new(initial_ms: f64, decay: f64) -> Self {
        Self {
            ewma: AtomicU64::new(initial_ms.to_bits()),
            decay: decay.clamp(0.0, 1.0),
            in_flight: AtomicU64::new(0),
        }
    }

    /// Current average in milliseconds.
    pub fn latency_ms(&self) -> f64 {
        f64::from_bits(self.ewma.load(Ordering::Relaxed))
    }

    /// Number of requests currently outstanding against the backend.
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Fold a round-trip sample into the average.
    pub fn observe(&self, rtt_ms: f64) {
        let decay = self.decay;
        // fetch_update retries the closure on contention; it never returns None here.
        let _ = self
            .ewma
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                let current = f64::from_bits(bits);
                let next = if rtt_ms > current {
                    rtt_ms
                } else {
                    rtt_ms * (1.0 - decay) + current * decay
                };
                Some(next.to_bits())
            });
    }

    /// Mark a request as started. The returned guard marks it finished on drop.
    pub fn start_request(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { ewma: self }
    }

    /// Routing cost; lower is better. `(latency + 1) * (in_flight + 1)`.
    pub fn score(&self) -> f64 {
        (self.latency_ms() + 1.0) * (self.in_flight() as f64 + 1.0)
    }
}

/// Decrements the in-flight count of a [`PeakEwma`] when dropped.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    ewma: &'a PeakEwma,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.ewma.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
