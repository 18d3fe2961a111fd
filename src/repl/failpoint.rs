//! Process-global fail points, used by tests to pause the applier at
//! interesting places. Tests toggling these must run serially.

use std::sync::atomic::{AtomicBool, Ordering};

/// While enabled, the batcher spins without emitting batches. Must not be
/// enabled during clean shutdown.
pub static SYNC_APPLY_STOP: FailPoint = FailPoint::new();

/// While enabled, blocks missing-document fetches until cleared.
pub static HANG_BEFORE_GETTING_MISSING_DOC: FailPoint = FailPoint::new();

/// A fail point: a global switch checked at a specific code site.
pub struct FailPoint {
    enabled: AtomicBool,
}

impl FailPoint {
    const fn new() -> Self {
        Self { enabled: AtomicBool::new(false) }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}
