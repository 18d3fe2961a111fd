use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Applier metrics: the total number of ops applied, and per-batch apply
/// timings.
pub struct Stats {
    ops_applied: AtomicU64,
    batches: Mutex<BatchTimings>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
struct BatchTimings {
    count: u64,
    total: Duration,
    min: Duration,
    max: Duration,
}

/// A point-in-time view of the applier metrics.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// Total ops applied, counting each op in a grouped insert.
    pub ops_applied: u64,
    /// Number of batches applied.
    pub batches: u64,
    /// Total time spent applying batches.
    pub batch_total: Duration,
    /// Fastest batch.
    pub batch_min: Duration,
    /// Slowest batch.
    pub batch_max: Duration,
}

impl Stats {
    pub fn new() -> Self {
        Self { ops_applied: AtomicU64::new(0), batches: Mutex::new(BatchTimings::default()) }
    }

    /// Counts applied ops.
    pub fn add_ops_applied(&self, count: u64) {
        self.ops_applied.fetch_add(count, Ordering::Relaxed);
    }

    /// Records the apply duration of one batch.
    pub fn record_batch(&self, elapsed: Duration) {
        let mut batches = self.batches.lock().expect("lock poisoned");
        if batches.count == 0 {
            batches.min = elapsed;
            batches.max = elapsed;
        } else {
            batches.min = batches.min.min(elapsed);
            batches.max = batches.max.max(elapsed);
        }
        batches.count += 1;
        batches.total += elapsed;
    }

    /// Returns a snapshot of the metrics.
    pub fn snapshot(&self) -> Snapshot {
        let batches = *self.batches.lock().expect("lock poisoned");
        Snapshot {
            ops_applied: self.ops_applied.load(Ordering::Relaxed),
            batches: batches.count,
            batch_total: batches.total,
            batch_min: batches.min,
            batch_max: batches.max,
        }
    }
}
