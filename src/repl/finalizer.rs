use super::coordinator::Coordinator;
use super::OpTime;
use crate::storage::Storage;

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

/// Advances the node's replication progress after each applied batch. The
/// last-applied optime always advances synchronously, in batch-commit
/// order. On journaling engines, a dedicated waiter thread additionally
/// blocks until writes are flushed and then advances the last-durable
/// optime; it only ever sees the most recently recorded optime, so it may
/// skip intermediate ones, but never regresses.
pub enum Finalizer {
    /// For engines without journaling: there is nothing to wait for.
    NonDurable { coordinator: Arc<dyn Coordinator> },
    /// For journaling engines: owns the background waiter thread.
    Durable(DurableFinalizer),
}

impl Finalizer {
    /// Creates the finalizer matching the storage engine's durability.
    pub fn new(coordinator: Arc<dyn Coordinator>, storage: Arc<dyn Storage>) -> Self {
        if storage.is_durable() {
            Finalizer::Durable(DurableFinalizer::new(coordinator, storage))
        } else {
            Finalizer::NonDurable { coordinator }
        }
    }

    /// Records a batch's final optime, advancing last-applied immediately.
    pub fn record(&self, op_time: OpTime) {
        match self {
            Finalizer::NonDurable { coordinator } => {
                coordinator.set_my_last_applied_op_time_forward(op_time)
            }
            Finalizer::Durable(durable) => durable.record(op_time),
        }
    }
}

/// The durable finalizer: publishes recorded optimes to a latest-slot that
/// the waiter thread drains. Dropping it signals and joins the thread.
pub struct DurableFinalizer {
    coordinator: Arc<dyn Coordinator>,
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    slot: Mutex<Slot>,
    changed: Condvar,
}

#[derive(Default)]
struct Slot {
    /// The most recent optime to make durable, if any.
    latest: Option<OpTime>,
    shutdown: bool,
}

impl DurableFinalizer {
    fn new(coordinator: Arc<dyn Coordinator>, storage: Arc<dyn Storage>) -> Self {
        let shared = Arc::new(Shared { slot: Mutex::new(Slot::default()), changed: Condvar::new() });
        let thread = {
            let coordinator = coordinator.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("repl-finalizer".into())
                .spawn(move || Self::run(coordinator, storage, shared))
                .expect("failed to spawn finalizer thread")
        };
        Self { coordinator, shared, thread: Some(thread) }
    }

    fn record(&self, op_time: OpTime) {
        self.coordinator.set_my_last_applied_op_time_forward(op_time);

        let mut slot = self.shared.slot.lock().expect("lock poisoned");
        slot.latest = Some(op_time);
        self.shared.changed.notify_all();
    }

    /// Loops waiting for recorded optimes, blocking on the storage engine's
    /// flush before advancing last-durable. Terminates on shutdown.
    fn run(coordinator: Arc<dyn Coordinator>, storage: Arc<dyn Storage>, shared: Arc<Shared>) {
        loop {
            let latest = {
                let mut slot = shared.slot.lock().expect("lock poisoned");
                while slot.latest.is_none() && !slot.shutdown {
                    slot = shared.changed.wait(slot).expect("lock poisoned");
                }
                if slot.shutdown {
                    return;
                }
                slot.latest.take().expect("latest checked above")
            };

            storage.wait_until_durable().expect("wait for durability failed");
            coordinator.set_my_last_durable_op_time_forward(latest);
        }
    }
}

impl Drop for DurableFinalizer {
    fn drop(&mut self) {
        let mut slot = self.shared.slot.lock().expect("lock poisoned");
        slot.shutdown = true;
        self.shared.changed.notify_all();
        drop(slot);

        if let Some(thread) = self.thread.take() {
            thread.join().expect("finalizer thread panicked");
        }
    }
}
