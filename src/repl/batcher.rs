use super::coordinator::Coordinator;
use super::entry::{OpKind, OplogEntry, OPLOG_VERSION};
use super::failpoint;
use super::producer::Producer;
use crate::config::Settings;
use crate::storage::Storage;

use log::error;

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

/// The limits recognized when cutting one batch, snapshotted per batch.
pub struct BatchLimits {
    /// The maximum number of entries.
    pub ops: u64,
    /// The byte limit: the smaller of the configured ceiling and 10% of the
    /// oplog's maximum size. A batch of a single entry may exceed it.
    pub bytes: u64,
    /// When follower delay is configured, the latest wall-clock second
    /// (Unix time) whose entries may be applied. Entries strictly after it
    /// are deferred.
    pub slave_delay_latest_timestamp: Option<u64>,
}

/// An accumulator of pending oplog entries, handed from the batcher to the
/// applier in one move. Entries are in producer order; `bytes` tracks their
/// raw encoded sizes exactly.
#[derive(Default)]
pub struct OpQueue {
    entries: Vec<OplogEntry>,
    bytes: u64,
    must_shutdown: bool,
}

impl OpQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// True if this is the final batch before shutdown.
    pub fn must_shutdown(&self) -> bool {
        self.must_shutdown
    }

    pub fn front(&self) -> Option<&OplogEntry> {
        self.entries.first()
    }

    pub fn back(&self) -> Option<&OplogEntry> {
        self.entries.last()
    }

    /// Releases the batch contents. The queue retains nothing.
    pub fn into_entries(self) -> Vec<OplogEntry> {
        self.entries
    }

    pub(crate) fn push(&mut self, entry: OplogEntry) {
        self.bytes += entry.size() as u64;
        self.entries.push(entry);
    }

    pub(crate) fn pop_back(&mut self) -> Option<OplogEntry> {
        let entry = self.entries.pop()?;
        self.bytes -= entry.size() as u64;
        Some(entry)
    }

    pub(crate) fn set_must_shutdown(&mut self) {
        self.must_shutdown = true;
    }
}

/// Copies one op from the producer into the queue, enforcing the batch
/// cutoff rules. Returns true if the batch should be ended: the byte or
/// count limit was hit, an op that must run alone was seen, an op was
/// deferred for follower delay, or the producer had nothing for us. Blocks
/// up to a second waiting for new ops so that shutdown and state changes
/// are checked periodically.
pub(crate) fn try_pop_and_wait_for_more(
    producer: &dyn Producer,
    ops: &mut OpQueue,
    limits: &BatchLimits,
) -> bool {
    let Some(entry) = producer.peek() else {
        if ops.is_empty() {
            if producer.in_shutdown() {
                ops.set_must_shutdown();
            } else {
                // Block up to a second for something to appear. The batch
                // still ends, so the next op starts a fresh batch.
                producer.wait_for_more();
            }
        }
        return true;
    };

    // If this op would put us over the byte limit don't include it, unless
    // the batch is empty: single-op batches may exceed the limit so that
    // large ops can be processed at all.
    if !ops.is_empty() && ops.bytes() + entry.size() as u64 > limits.bytes {
        return true;
    }
    ops.push(entry);

    let (must_run_alone, ts_secs) = {
        let entry = ops.back().expect("entry was just pushed");

        if !entry.is_sentinel() {
            let version = entry.version.unwrap_or(1);
            if version != OPLOG_VERSION {
                // The node cannot interpret this oplog.
                error!("expected oplog version {OPLOG_VERSION} but found {version}: {entry}");
                panic!("unsupported oplog version {version}");
            }
        }

        let must_run_alone = entry.is_sentinel()
            || entry.kind == OpKind::Command
            // Index builds are replicated as inserts into system.indexes,
            // not as commands, but must also run alone.
            || entry.is_index_build();
        (must_run_alone, entry.ts.secs)
    };

    if let Some(latest) = limits.slave_delay_latest_timestamp {
        if ts_secs as u64 > latest {
            ops.pop_back(); // don't do this op yet
            if ops.is_empty() {
                // Nothing to do; sleep only a second at a time so shutdown
                // and reconfiguration aren't delayed.
                std::thread::sleep(Duration::from_secs(1));
            }
            return true;
        }
    }

    if must_run_alone {
        if ops.count() == 1 {
            producer.consume();
        } else {
            // This op must be processed alone, but the batch already has
            // entries. Leave it unconsumed; it will be seen again as the
            // only entry of the next batch.
            ops.pop_back();
        }
        return true;
    }

    producer.consume();
    ops.count() as u64 >= limits.ops
}

/// The batcher: a dedicated thread draining the producer into batches and
/// handing them to the applier through a single-slot rendezvous. A new
/// batch is not produced until the previous one has been claimed.
pub struct Batcher {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    /// The handoff slot. Deposited batches are never empty (except the
    /// final shutdown batch), so an empty slot means nothing is pending.
    slot: Mutex<OpQueue>,
    slot_changed: Condvar,
    done: Mutex<bool>,
}

impl Batcher {
    /// Starts the batcher thread.
    pub fn new(
        producer: Arc<dyn Producer>,
        storage: Arc<dyn Storage>,
        coordinator: Arc<dyn Coordinator>,
        settings: Arc<Settings>,
    ) -> Self {
        let shared = Arc::new(Shared {
            slot: Mutex::new(OpQueue::new()),
            slot_changed: Condvar::new(),
            done: Mutex::new(false),
        });
        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("repl-batcher".into())
                .spawn(move || Self::run(producer, storage, coordinator, settings, shared))
                .expect("failed to spawn batcher thread")
        };
        Self { shared, thread: Some(thread) }
    }

    /// Blocks up to `max_wait` for a batch to be ready, returning whatever
    /// is ready, possibly nothing. Single consumer.
    pub fn next_batch(&self, max_wait: Duration) -> OpQueue {
        let mut slot = self.shared.slot.lock().expect("lock poisoned");
        if slot.is_empty() && !slot.must_shutdown() {
            // Waking due to a deposit or the timeout is the same to us: we
            // take whatever is in the slot either way.
            let (guard, _) = self
                .shared
                .slot_changed
                .wait_timeout(slot, max_wait)
                .expect("lock poisoned");
            slot = guard;
        }
        let ops = std::mem::take(&mut *slot);
        self.shared.slot_changed.notify_all();
        ops
    }

    fn run(
        producer: Arc<dyn Producer>,
        storage: Arc<dyn Storage>,
        coordinator: Arc<dyn Coordinator>,
        settings: Arc<Settings>,
        shared: Arc<Shared>,
    ) {
        let oplog_max_size = storage.oplog_max_size().expect("oplog max size unavailable");
        // Batches are limited to 10% of the oplog.
        let bytes = (oplog_max_size / 10).min(settings.batch_limit_bytes);

        loop {
            let slave_delay = coordinator.slave_delay();
            let limits = BatchLimits {
                // Re-check this once per batch: it can change at runtime.
                ops: settings.batch_limit_operations(),
                bytes,
                slave_delay_latest_timestamp: (!slave_delay.is_zero())
                    .then(|| unix_now_secs().saturating_sub(slave_delay.as_secs())),
            };

            let mut ops = OpQueue::new();
            while !try_pop_and_wait_for_more(producer.as_ref(), &mut ops, &limits) {}

            // For pausing replication in tests.
            while failpoint::SYNC_APPLY_STOP.is_enabled() {
                // Clean shutdown must not be attempted with the fail point
                // set; there is no sensible way to resolve the two.
                assert!(
                    !producer.in_shutdown(),
                    "turn off sync_apply_stop before attempting clean shutdown"
                );
                std::thread::sleep(Duration::from_millis(10));
            }

            if ops.is_empty() && !ops.must_shutdown() {
                continue; // don't emit empty batches
            }

            // Block until the previous batch has been taken, then deposit.
            let mut slot = shared.slot.lock().expect("lock poisoned");
            while !slot.is_empty() {
                slot = shared.slot_changed.wait(slot).expect("lock poisoned");
            }
            let shutdown = ops.must_shutdown();
            if shutdown {
                // Mark done before the consumer can observe the batch, so
                // dropping the batcher right after always joins.
                *shared.done.lock().expect("lock poisoned") = true;
            }
            *slot = ops;
            shared.slot_changed.notify_all();
            drop(slot);

            if shutdown {
                return;
            }
        }
    }
}

impl Drop for Batcher {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else { return };
        if !*self.shared.done.lock().expect("lock poisoned") {
            // The producer never signaled shutdown; joining would hang.
            error!("batcher dropped before clean shutdown, detaching batcher thread");
            return;
        }
        thread.join().expect("batcher thread panicked");
    }
}

fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs()
}
