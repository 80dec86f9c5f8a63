use std::sync::atomic::{AtomicU64, Ordering};

/// Rolling counters for one controller.
#[derive(Default, Debug)]
pub struct ControllerStats {
    submitted: AtomicU64,
    workers_started: AtomicU64,
    batches_processed: AtomicU64,
    results_delivered: AtomicU64,
    results_dropped: AtomicU64,
    cancellations: AtomicU64,
    failures: AtomicU64
}

/// Point-in-time copy of [`ControllerStats`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerStatsSnapshot {
    pub submitted: u64,
    pub workers_started: u64,
    pub batches_processed: u64,
    pub results_delivered: u64,
    pub results_dropped: u64,
    pub cancellations: u64,
    pub failures: u64
}

impl ControllerStats {
    pub(crate) fn record_submitted(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.submitted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_worker_started(&self) {
        self.workers_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_delivered(&self) {
        self.results_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.results_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancellation(&self) {
        self.cancellations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ControllerStatsSnapshot {
        ControllerStatsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            workers_started: self.workers_started.load(Ordering::Relaxed),
            batches_processed: self.batches_processed.load(Ordering::Relaxed),
            results_delivered: self.results_delivered.load(Ordering::Relaxed),
            results_dropped: self.results_dropped.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed)
        }
    }
}
