use crate::document::Timestamp;

use std::sync::atomic::{AtomicU64, Ordering};

/// The node's logical clock: the latest oplog timestamp the node knows of.
/// The applier publishes the last timestamp of every applied batch so that
/// new local timestamps are allocated after it. Packed into a single atomic
/// so advancing is a lock-free monotone max.
pub struct LogicalClock {
    packed: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self { packed: AtomicU64::new(0) }
    }

    /// Advances the clock to the given timestamp, if it is ahead.
    pub fn advance_to(&self, ts: Timestamp) {
        self.packed.fetch_max(Self::pack(ts), Ordering::SeqCst);
    }

    /// The current clock value.
    pub fn now(&self) -> Timestamp {
        Self::unpack(self.packed.load(Ordering::SeqCst))
    }

    fn pack(ts: Timestamp) -> u64 {
        (ts.secs as u64) << 32 | ts.ord as u64
    }

    fn unpack(packed: u64) -> Timestamp {
        Timestamp::new((packed >> 32) as u32, packed as u32)
    }
}
