use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use once_cell::sync::Lazy;

/// Global runtime metrics for the collector.
///
/// Purpose:
/// - Track trigger invocations (run / throttled)
/// - Track per-race throughput (polled / failed / retried)
/// - Track snapshot rows actually written
///
/// Design:
/// - Lock-free (Atomics)
/// - Process-local: counters reset on restart. Anything that must
///   survive an invocation lives in the durable stores instead.
#[derive(Default)]
pub struct RuntimeMetrics {
    // Invocations
    pub invocations: AtomicUsize,
    pub throttled_invocations: AtomicUsize,
    pub second_passes: AtomicUsize,
    pub reconcile_runs: AtomicUsize,

    // Races
    pub races_polled: AtomicUsize,
    pub race_errors: AtomicUsize,
    pub retries: AtomicUsize,

    // Storage
    pub snapshots_written: AtomicUsize,
}

impl RuntimeMetrics {
    pub fn incr(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicUsize, n: usize) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// One-line report for the periodic reporter.
    pub fn report(&self) -> String {
        format!(
            "inv={} throttled={} second={} reconcile={} polled={} race_err={} retries={} written={}",
            self.invocations.load(Ordering::Relaxed),
            self.throttled_invocations.load(Ordering::Relaxed),
            self.second_passes.load(Ordering::Relaxed),
            self.reconcile_runs.load(Ordering::Relaxed),
            self.races_polled.load(Ordering::Relaxed),
            self.race_errors.load(Ordering::Relaxed),
            self.retries.load(Ordering::Relaxed),
            self.snapshots_written.load(Ordering::Relaxed),
        )
    }
}

/// Global metrics registry (singleton)
pub static METRICS: Lazy<Arc<RuntimeMetrics>> =
    Lazy::new(|| Arc::new(RuntimeMetrics::default()));
