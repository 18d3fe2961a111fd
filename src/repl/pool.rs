use crossbeam::channel::{self, Receiver, Sender};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A scheduled unit of work.
type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed-size pool of writer threads. The applier schedules prefetch,
/// oplog-write, and apply jobs onto it and joins between phases; the pool
/// stays alive across batches and is joined again and again.
pub struct WriterPool {
    job_tx: Option<Sender<Job>>,
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

struct Shared {
    /// The number of scheduled jobs that have not yet completed.
    pending: Mutex<usize>,
    /// Signalled when pending drops to zero.
    done: Condvar,
    /// Set if any job panicked; join() re-panics on the caller.
    panicked: AtomicBool,
}

impl WriterPool {
    /// Creates a pool with the given number of writer threads (1..=256).
    pub fn new(size: usize) -> Self {
        assert!((1..=256).contains(&size), "writer pool size {size} out of range");
        let (job_tx, job_rx) = channel::unbounded::<Job>();
        let shared = Arc::new(Shared {
            pending: Mutex::new(0),
            done: Condvar::new(),
            panicked: AtomicBool::new(false),
        });
        let threads = (0..size)
            .map(|i| {
                let job_rx = job_rx.clone();
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("repl-writer-{i}"))
                    .spawn(move || Self::work(job_rx, shared))
                    .expect("failed to spawn writer thread")
            })
            .collect();
        Self { job_tx: Some(job_tx), shared, threads }
    }

    /// The number of writer threads.
    pub fn size(&self) -> usize {
        self.threads.len()
    }

    /// Schedules a job. It runs on some writer thread, in scheduling order
    /// relative to other jobs picked up by the same thread.
    pub fn schedule(&self, job: impl FnOnce() + Send + 'static) {
        *self.shared.pending.lock().expect("lock poisoned") += 1;
        let job_tx = self.job_tx.as_ref().expect("pool is shut down");
        job_tx.send(Box::new(job)).expect("writer threads exited");
    }

    /// Blocks until all scheduled jobs have completed. Panics if any job
    /// panicked, faulting the node.
    pub fn join(&self) {
        let mut pending = self.shared.pending.lock().expect("lock poisoned");
        while *pending > 0 {
            assert!(!self.shared.panicked.load(Ordering::SeqCst), "writer worker panicked");
            let (guard, _) = self
                .shared
                .done
                .wait_timeout(pending, Duration::from_millis(50))
                .expect("lock poisoned");
            pending = guard;
        }
        drop(pending);
        assert!(!self.shared.panicked.load(Ordering::SeqCst), "writer worker panicked");
    }

    fn work(job_rx: Receiver<Job>, shared: Arc<Shared>) {
        while let Ok(job) = job_rx.recv() {
            // The completion guard decrements the pending count even if the
            // job panics, and records the panic for join() to surface.
            let _complete = Complete(&shared);
            job();
        }
    }
}

impl Drop for WriterPool {
    fn drop(&mut self) {
        self.job_tx.take(); // disconnects the channel, stopping the workers
        for thread in self.threads.drain(..) {
            // A worker that panicked already recorded it; don't re-panic
            // while dropping.
            let _ = thread.join();
        }
    }
}

struct Complete<'a>(&'a Shared);

impl Drop for Complete<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.panicked.store(true, Ordering::SeqCst);
        }
        let mut pending = self.0.pending.lock().expect("lock poisoned");
        *pending -= 1;
        if *pending == 0 {
            self.0.done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_all_jobs() {
        let pool = WriterPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            pool.schedule(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn join_is_reusable() {
        let pool = WriterPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for round in 1..=3 {
            for _ in 0..10 {
                let counter = counter.clone();
                pool.schedule(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            pool.join();
            assert_eq!(counter.load(Ordering::SeqCst), round * 10);
        }
    }

    #[test]
    fn join_with_no_jobs() {
        let pool = WriterPool::new(1);
        pool.join();
    }

    #[test]
    #[should_panic(expected = "writer worker panicked")]
    fn job_panic_propagates_to_join() {
        let pool = WriterPool::new(2);
        pool.schedule(|| panic!("boom"));
        pool.join();
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn zero_size_rejected() {
        WriterPool::new(0);
    }
}
