//! Optional metrics exposed by the runtime
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters for the reconcile loop
#[derive(Default, Debug)]
pub struct ReconcileMetrics {
    /// Completed reconcile attempts
    pub runs: AtomicU64,
    /// Attempts that ended in an error, panic or timeout
    pub failures: AtomicU64,
    /// Attempts that scheduled a follow-up run
    pub requeues: AtomicU64,
    /// Total time spent in reconcile attempts
    pub duration_ms: AtomicU64,
}

impl ReconcileMetrics {
    pub fn observe(&self, failed: bool, duration: Duration) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failures.fetch_add(1, Ordering::Relaxed);
        }
        self.duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }
}

/// All metrics
#[derive(Default, Debug)]
pub struct Metrics {
    /// Library version baked in at build time
    pub build_info: String,
    /// Metrics from the reconcile loop
    pub reconcile: ReconcileMetrics,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            build_info: env!("CARGO_PKG_VERSION").to_string(),
            ..Default::default()
        }
    }

    /// Render in the Prometheus text exposition format
    #[must_use]
    pub fn render(&self) -> String {
        let r = &self.reconcile;
        format!(
            "# TYPE opkit_reconcile_runs_total counter\n\
             opkit_reconcile_runs_total {}\n\
             # TYPE opkit_reconcile_failures_total counter\n\
             opkit_reconcile_failures_total {}\n\
             # TYPE opkit_reconcile_requeues_total counter\n\
             opkit_reconcile_requeues_total {}\n\
             # TYPE opkit_reconcile_duration_milliseconds_total counter\n\
             opkit_reconcile_duration_milliseconds_total {}\n",
            r.runs.load(Ordering::Relaxed),
            r.failures.load(Ordering::Relaxed),
            r.requeues.load(Ordering::Relaxed),
            r.duration_ms.load(Ordering::Relaxed),
        )
    }
}
