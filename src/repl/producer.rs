use super::entry::OplogEntry;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// The producer feeding the applier: an ordered stream of oplog entries
/// fetched from the sync source. The batcher is the single consumer; peek
/// and consume operate on the same front entry.
pub trait Producer: Send + Sync {
    /// Returns the front entry without consuming it, or None if the stream
    /// is currently empty. Non-blocking.
    fn peek(&self) -> Option<OplogEntry>;

    /// Removes the most recently peeked entry.
    fn consume(&self);

    /// Blocks up to about a second for new entries to arrive.
    fn wait_for_more(&self);

    /// True once the producer has entered clean shutdown. Remaining entries
    /// are still drained.
    fn in_shutdown(&self) -> bool;
}

/// An in-memory producer queue. The network fetcher side pushes entries and
/// eventually signals shutdown; the batcher side peeks and consumes.
pub struct Queue {
    entries: Mutex<VecDeque<OplogEntry>>,
    nonempty: Condvar,
    shutdown: AtomicBool,
}

impl Queue {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            nonempty: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Appends an entry to the stream.
    pub fn push(&self, entry: OplogEntry) {
        self.entries.lock().expect("lock poisoned").push_back(entry);
        self.nonempty.notify_all();
    }

    /// Signals clean shutdown. Entries already queued are still drained.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.nonempty.notify_all();
    }

    /// The number of queued entries.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("lock poisoned").len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Producer for Queue {
    fn peek(&self) -> Option<OplogEntry> {
        self.entries.lock().expect("lock poisoned").front().cloned()
    }

    fn consume(&self) {
        let mut entries = self.entries.lock().expect("lock poisoned");
        entries.pop_front().expect("consume without a peeked entry");
    }

    fn wait_for_more(&self) {
        let entries = self.entries.lock().expect("lock poisoned");
        if entries.is_empty() && !self.in_shutdown() {
            // Waking due to timeout is fine; the batcher rechecks either way.
            let (_entries, _) = self
                .nonempty
                .wait_timeout(entries, Duration::from_secs(1))
                .expect("lock poisoned");
        }
    }

    fn in_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}
