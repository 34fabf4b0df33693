//! Pipeline counters.
//!
//! One counter per outcome of the dispatch state machine (success, terminal
//! error, retry) plus a received total and an in-flight gauge. Plain atomics
//! with `Relaxed` ordering: each number is an independent observation for
//! the shutdown summary, never a synchronisation point. Share as
//! `Arc<Metrics>`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

pub struct Metrics {
    received: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    in_flight: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            in_flight: AtomicI64::new(0),
        }
    }

    /// A job was pulled off the broker stream.
    pub fn job_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// A success result was published.
    pub fn job_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    /// A terminal error result was published.
    pub fn job_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A retry envelope was published. Counts publishes, not jobs: one job
    /// can contribute up to `MAX_RETRIES` of these.
    pub fn job_retried(&self) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a job as in flight until the returned guard drops.
    ///
    /// The guard pattern keeps the gauge honest across every exit path of a
    /// dispatch routine, early returns included.
    pub fn track_in_flight(&self) -> InFlightGuard<'_> {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        InFlightGuard { metrics: self }
    }

    /// Point-in-time snapshot. Relaxed reads, so approximate — sufficient
    /// for the shutdown summary.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    pub fn log_summary(&self) {
        let s = self.snapshot();
        tracing::info!(
            received = s.received,
            succeeded = s.succeeded,
            failed = s.failed,
            retried = s.retried,
            in_flight = s.in_flight,
            "📊 metrics summary"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight gauge on drop. See [`Metrics::track_in_flight`].
pub struct InFlightGuard<'a> {
    metrics: &'a Metrics,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A point-in-time snapshot of [`Metrics`] counters.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub in_flight: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_independently() {
        let m = Metrics::new();
        m.job_received();
        m.job_received();
        m.job_retried();
        m.job_succeeded();

        let s = m.snapshot();
        assert_eq!(s.received, 2);
        assert_eq!(s.retried, 1);
        assert_eq!(s.succeeded, 1);
        assert_eq!(s.failed, 0);
        assert_eq!(s.in_flight, 0);
    }

    #[test]
    fn in_flight_guard_balances_on_every_exit_path() {
        let m = Metrics::new();
        {
            let _guard = m.track_in_flight();
            assert_eq!(m.snapshot().in_flight, 1);
            let _second = m.track_in_flight();
            assert_eq!(m.snapshot().in_flight, 2);
        }
        assert_eq!(m.snapshot().in_flight, 0);
    }
}
