//! Request counters kept around every service call.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub errors: u64,
    pub in_flight: i64,
}

#[derive(Debug, Default)]
pub struct RequestMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    in_flight: AtomicI64,
}

impl RequestMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request as started. It stays in flight until the guard drops.
    pub fn start(&self) -> RequestGuard<'_> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        RequestGuard { metrics: self }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }
}

/// Decrements the in-flight count on drop.
pub struct RequestGuard<'a> {
    metrics: &'a RequestMetrics,
}

impl RequestGuard<'_> {
    /// Record the outcome, counting an error when `result` is one.
    pub fn finish<T, E>(self, result: Result<T, E>) -> Result<T, E> {
        if result.is_err() {
            self.metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
        result
    }
}

impl Drop for RequestGuard<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}
