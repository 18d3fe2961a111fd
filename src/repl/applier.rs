use super::apply::{multi_initial_sync_apply, multi_sync_apply, ApplyBatchFn, ApplyContext};
use super::batcher::Batcher;
use super::clock::LogicalClock;
use super::coordinator::{Coordinator, MemberState};
use super::entry::{OpTime, OplogEntry};
use super::fetch::{MissingDocFetcher, SyncSource};
use super::finalizer::Finalizer;
use super::partition::fill_writer_streams;
use super::pool::WriterPool;
use super::producer::Producer;
use super::stats::{Snapshot, Stats};
use crate::config::Settings;
use crate::document::Timestamp;
use crate::errinput;
use crate::error::{Error, Result};
use crate::storage::{BatchWriterGuard, LockMode, LockScope, Storage, OPLOG_NS};

use crossbeam::channel;
use log::{debug, error, warn};

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Entries per writer thread below which the oplog is written by a single
/// worker: a lone bulk insert amortizes its overhead better than spreading
/// too little work across threads.
const MIN_OPLOG_ENTRIES_PER_THREAD: usize = 16;

/// The replication tail applier. Owns the writer pool and drives batches
/// from the producer through oplog write, parallel apply, and finalization.
pub struct Applier {
    producer: Arc<dyn Producer>,
    storage: Arc<dyn Storage>,
    coordinator: Arc<dyn Coordinator>,
    settings: Arc<Settings>,
    pool: WriterPool,
    apply_fn: ApplyBatchFn,
    ctx: Arc<ApplyContext>,
    clock: Arc<LogicalClock>,
    /// Held while a batch is mid-application, so the fsync+lock command
    /// cannot observe an intermediate state. Shared with its implementation.
    fsync_lock: Arc<Mutex<()>>,
}

impl Applier {
    /// Creates a steady-state applier.
    pub fn new(
        producer: Arc<dyn Producer>,
        storage: Arc<dyn Storage>,
        coordinator: Arc<dyn Coordinator>,
        settings: Arc<Settings>,
    ) -> Self {
        Self::with_apply_fn(producer, storage, coordinator, settings, Arc::new(multi_sync_apply), None)
    }

    /// Creates an initial-sync applier, which fetches documents that are
    /// missing locally from the given sync source.
    pub fn new_initial_sync(
        producer: Arc<dyn Producer>,
        storage: Arc<dyn Storage>,
        coordinator: Arc<dyn Coordinator>,
        settings: Arc<Settings>,
        source: Arc<dyn SyncSource>,
        hostname: impl Into<String>,
    ) -> Self {
        let fetcher = MissingDocFetcher::new(source, hostname);
        Self::with_apply_fn(
            producer,
            storage,
            coordinator,
            settings,
            Arc::new(multi_initial_sync_apply),
            Some(fetcher),
        )
    }

    /// Creates an applier with an injected worker body. Tests use this to
    /// stub out the apply stage.
    pub fn with_apply_fn(
        producer: Arc<dyn Producer>,
        storage: Arc<dyn Storage>,
        coordinator: Arc<dyn Coordinator>,
        settings: Arc<Settings>,
        apply_fn: ApplyBatchFn,
        fetcher: Option<MissingDocFetcher>,
    ) -> Self {
        let ctx = Arc::new(ApplyContext {
            storage: storage.clone(),
            stats: Arc::new(Stats::new()),
            fetcher,
        });
        let pool = WriterPool::new(settings.writer_threads);
        Self {
            producer,
            storage,
            coordinator,
            settings,
            pool,
            apply_fn,
            ctx,
            clock: Arc::new(LogicalClock::new()),
            fsync_lock: Arc::new(Mutex::new(())),
        }
    }

    /// A snapshot of the applier metrics.
    pub fn stats(&self) -> Snapshot {
        self.ctx.stats.snapshot()
    }

    /// The node's logical clock, advanced past every applied batch.
    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// The mutex an fsync+lock implementation must hold to get a settled
    /// view of the node: the applier holds it for the span of each batch.
    pub fn fsync_mutex(&self) -> Arc<Mutex<()>> {
        self.fsync_lock.clone()
    }

    /// Runs the tail loop: pull a batch, apply it, advance the applied and
    /// durable points, and transition out of RECOVERING once caught up.
    /// Returns once the producer signals shutdown and the final batch has
    /// been applied. Invariant violations (out-of-order oplog, failed
    /// application) panic, faulting the node.
    pub fn run(&self) -> Result<()> {
        let batcher = Batcher::new(
            self.producer.clone(),
            self.storage.clone(),
            self.coordinator.clone(),
            self.settings.clone(),
        );
        let finalizer = Finalizer::new(self.coordinator.clone(), self.storage.clone());

        loop {
            self.try_to_go_live_as_secondary()?;

            // Block up to a second for a batch to be ready, so the checks
            // above run periodically even when the queue is idle.
            let ops = batcher.next_batch(Duration::from_secs(1));
            if ops.is_empty() {
                if ops.must_shutdown() {
                    return Ok(());
                }
                continue;
            }

            if ops.front().expect("batch is non-empty").is_sentinel() {
                // The producer has coalesced and we have processed all of
                // its data.
                assert_eq!(ops.count(), 1, "sentinel batched with other entries");
                if self.coordinator.is_waiting_for_applier_to_drain() {
                    self.coordinator.signal_drain_complete();
                }
                continue; // not a real op
            }

            let first = ops.front().expect("batch is non-empty").op_time();
            let last = ops.back().expect("batch is non-empty").op_time();

            // Make sure the oplog doesn't go back in time or repeat an
            // entry.
            let last_applied = self.coordinator.my_last_applied_op_time();
            if first <= last_applied {
                let err = Error::OplogOutOfOrder(format!(
                    "attempted to apply an oplog entry ({first}) which is not greater than our \
                     last applied optime ({last_applied})"
                ));
                error!("{err}");
                panic!("{err}");
            }

            // Don't allow the fsync+lock thread to see intermediate states
            // of batch application.
            let _fsync = self.fsync_lock.lock().expect("lock poisoned");

            if let Err(err) = self.multi_apply(ops.into_entries()) {
                error!("failed to apply batch: {err}");
                panic!("failed to apply batch: {err}");
            }

            // Update the things that care about our last applied optime.
            self.clock.advance_to(last.ts);
            self.storage.set_applied_through(last)?;
            finalizer.record(last);
        }
    }

    /// Applies one batch: guards against applying while primary, prefetches
    /// on legacy engines, writes the entries to the local oplog, then
    /// applies their user-data effects across the writer pool. All readers
    /// are stopped for the duration. Returns the optime of the batch's last
    /// entry.
    pub fn multi_apply(&self, mut ops: Vec<OplogEntry>) -> Result<OpTime> {
        if ops.is_empty() {
            return errinput!("no operations provided to multi_apply");
        }

        // A primary must never apply replicated ops, except while draining
        // after step-down or catching up after election.
        if self.coordinator.member_state().is_primary()
            && !self.coordinator.is_waiting_for_applier_to_drain()
            && !self.coordinator.is_catching_up()
        {
            error!("attempting to replicate ops while primary");
            return Err(Error::CannotApplyWhilePrimary);
        }

        // Use the writer pool to warm pages for every op in the batch.
        // Only legacy page-based engines benefit.
        if self.storage.is_legacy_engine() {
            self.prefetch_ops(&ops);
        }

        debug!("replication batch size is {}", ops.len());

        // Stop all readers until we're done. This also prevents the engine
        // from deleting old oplog entries while we write.
        let _batch_writer = BatchWriterGuard::new(self.storage.as_ref());

        // Partition the batch into per-worker streams. This also marks
        // inserts into capped collections, which the workers must not
        // group.
        let streams = fill_writer_streams(self.storage.as_ref(), &mut ops, self.pool.size());

        let first_ts = ops.first().expect("batch is non-empty").ts;
        let last_op_time = ops.last().expect("batch is non-empty").op_time();

        // Record where crash recovery would have to truncate the oplog back
        // to, write the batch to the oplog, then clear the truncation point
        // and promise to reach the batch's end before claiming consistency.
        self.storage.set_oplog_delete_from_point(first_ts)?;
        let ops = Arc::new(ops);
        self.write_ops_to_oplog(&ops)?;
        self.storage.set_oplog_delete_from_point(Timestamp::NULL)?;
        self.storage.set_min_valid_to_at_least(last_op_time)?;

        // Apply the user-data effects, one job per non-empty stream. Any
        // worker error fails the batch, which faults the node upstream.
        let start = Instant::now();
        let (result_tx, result_rx) = channel::unbounded();
        for stream in streams {
            if stream.is_empty() {
                continue;
            }
            let apply_fn = self.apply_fn.clone();
            let ctx = self.ctx.clone();
            let ops = ops.clone();
            let result_tx = result_tx.clone();
            self.pool.schedule(move || {
                let result = apply_fn.as_ref()(&ctx, &ops, stream);
                result_tx.send(result).expect("apply results channel closed");
            });
        }
        drop(result_tx);
        self.pool.join();
        self.ctx.stats.record_batch(start.elapsed());

        for result in result_rx.try_iter() {
            if let Err(err) = result {
                error!("writer worker failed: {err}");
                return Err(err);
            }
        }

        Ok(last_op_time)
    }

    /// Prefetches pages for every op in the batch and waits for completion.
    /// Prefetch is best-effort: errors are logged and ignored.
    fn prefetch_ops(&self, ops: &[OplogEntry]) {
        for op in ops {
            if op.ns.is_empty() {
                continue;
            }
            let op = op.clone();
            let storage = self.storage.clone();
            self.pool.schedule(move || {
                if let Err(err) = storage.prefetch(&op) {
                    debug!("ignoring error in prefetch: {err}");
                }
            });
        }
        self.pool.join();
    }

    /// Writes the batch to the local oplog via the writer pool and waits
    /// for completion. Uses a single bulk insert unless there is enough
    /// work to go around and the engine supports doc-locking, in which case
    /// contiguous ranges are written in parallel; such engines keep the
    /// oplog ordered by timestamp regardless of insertion order. Failing to
    /// write the oplog is an error the caller escalates to fatal.
    fn write_ops_to_oplog(&self, ops: &Arc<Vec<OplogEntry>>) -> Result<()> {
        let (result_tx, result_rx) = channel::unbounded();
        let schedule_range = |begin: usize, end: usize| {
            let ops = ops.clone();
            let storage = self.storage.clone();
            let result_tx = result_tx.clone();
            self.pool.schedule(move || {
                let docs = ops[begin..end].iter().map(|op| op.to_document()).collect();
                let result = storage.insert_documents(OPLOG_NS, docs);
                result_tx.send(result).expect("oplog results channel closed");
            });
        };

        let threads = self.pool.size();
        let enough_to_multi_thread = ops.len() >= MIN_OPLOG_ENTRIES_PER_THREAD * threads;
        if !enough_to_multi_thread || !self.storage.supports_doc_locking() {
            schedule_range(0, ops.len());
        } else {
            let per_thread = ops.len() / threads;
            for thread in 0..threads {
                let begin = thread * per_thread;
                let end = if thread == threads - 1 { ops.len() } else { begin + per_thread };
                schedule_range(begin, end);
            }
        }

        drop(result_tx);
        self.pool.join();

        for result in result_rx.try_iter() {
            if let Err(err) = result {
                error!("failed to write batch to the oplog: {err}");
                return Err(err);
            }
        }
        Ok(())
    }

    /// Transitions the node from RECOVERING to SECONDARY once it has
    /// applied through the min-valid point, unless maintenance mode is
    /// active.
    fn try_to_go_live_as_secondary(&self) -> Result<()> {
        if self.coordinator.is_in_primary_or_secondary_state() {
            return Ok(());
        }

        let _global = self.storage.lock(LockScope::Global, LockMode::Shared);

        if self.coordinator.maintenance_mode() {
            debug!("can't go live as maintenance mode is active");
            return Ok(());
        }

        // Only RECOVERING can transition to SECONDARY.
        let state = self.coordinator.member_state();
        if !state.is_recovering() {
            debug!("can't go live as state is {state}, not RECOVERING");
            return Ok(());
        }

        // We can't go to SECONDARY until we reach minvalid.
        if self.coordinator.my_last_applied_op_time() < self.storage.min_valid()? {
            return Ok(());
        }

        if !self.coordinator.set_follower_mode(MemberState::Secondary) {
            warn!(
                "failed to transition into {}, current state: {}",
                MemberState::Secondary,
                self.coordinator.member_state()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::document::{Document, Value};
    use crate::repl::coordinator::test::Stub;
    use crate::repl::producer::Queue;
    use crate::storage::test::{Emit, Inject, Operation};
    use crate::storage::Memory;

    use crossbeam::channel::Receiver;
    use pretty_assertions::assert_eq;

    fn insert(ts: u32, id: i64) -> OplogEntry {
        OplogEntry::insert(Timestamp::new(ts, 0), 1, "app.users", Document::from([("_id", id)]))
    }

    fn settings(writer_threads: usize) -> Arc<Settings> {
        Arc::new(
            Config { writer_threads, ..Config::default() }.validate().expect("config is valid"),
        )
    }

    struct Harness {
        applier: Applier,
        producer: Arc<Queue>,
        coordinator: Arc<Stub>,
        storage: Arc<Emit<Inject<Memory>>>,
        operations: Receiver<Operation>,
    }

    fn harness(memory: Memory, state: MemberState, threads: usize) -> Harness {
        let (tx, operations) = crossbeam::channel::unbounded();
        let storage = Arc::new(Emit::new(Inject::new(memory), tx));
        let producer = Arc::new(Queue::new());
        let coordinator = Arc::new(Stub::new(state));
        let applier = Applier::new(
            producer.clone(),
            storage.clone(),
            coordinator.clone(),
            settings(threads),
        );
        Harness { applier, producer, coordinator, storage, operations }
    }

    fn memory(h: &Harness) -> &Memory {
        h.storage.inner().inner()
    }

    #[test]
    fn applies_an_ordinary_batch() -> Result<()> {
        // S1: a batch of 50 inserts lands in both the oplog and the
        // collection, and returns the last entry's optime.
        let h = harness(Memory::new(), MemberState::Recovering, 4);
        let ops: Vec<_> = (0..50).map(|i| insert(100 + i, i as i64)).collect();

        let applied = h.applier.multi_apply(ops)?;
        assert_eq!(applied, OpTime::new(Timestamp::new(149, 0), 1));
        assert_eq!(memory(&h).oplog_documents().len(), 50);
        assert_eq!(memory(&h).collection("app.users").unwrap().len(), 50);
        assert_eq!(h.applier.stats().ops_applied, 50);
        assert_eq!(h.applier.stats().batches, 1);
        Ok(())
    }

    #[test]
    fn applying_twice_is_idempotent() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Recovering, 4);
        let ops: Vec<_> = (0..10).map(|i| insert(100 + i, i as i64)).collect();

        h.applier.multi_apply(ops.clone())?;
        let before = memory(&h).collection("app.users").unwrap();
        h.applier.multi_apply(ops)?;
        assert_eq!(memory(&h).collection("app.users").unwrap(), before);
        Ok(())
    }

    #[test]
    fn empty_batch_is_rejected() {
        let h = harness(Memory::new(), MemberState::Recovering, 2);
        assert!(h.applier.multi_apply(Vec::new()).is_err());
    }

    #[test]
    fn primary_guard() {
        // S5: a primary that is neither draining nor catching up must not
        // apply replicated ops.
        let h = harness(Memory::new(), MemberState::Primary, 2);
        let result = h.applier.multi_apply(vec![insert(1, 1)]);
        assert_eq!(result, Err(Error::CannotApplyWhilePrimary));
    }

    #[test]
    fn draining_primary_may_apply() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Primary, 2);
        h.coordinator.set_waiting_for_drain(true);
        h.applier.multi_apply(vec![insert(1, 1)])?;
        Ok(())
    }

    #[test]
    fn catching_up_primary_may_apply() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Primary, 2);
        h.coordinator.set_catching_up(true);
        h.applier.multi_apply(vec![insert(1, 1)])?;
        Ok(())
    }

    #[test]
    fn phase_order_and_delete_from_point_lifecycle() -> Result<()> {
        // Invariant: the oplog truncation point is set to the batch's first
        // timestamp before any oplog write, cleared before min-valid
        // advances, and null at every external observation point.
        let h = harness(Memory::new(), MemberState::Recovering, 2);
        h.applier.multi_apply(vec![insert(7, 1), insert(8, 2)])?;
        assert!(h.storage.oplog_delete_from_point()?.is_null());

        let interesting: Vec<_> = h
            .operations
            .try_iter()
            .filter(|op| {
                !matches!(
                    op,
                    Operation::ApplyOperation { .. } | Operation::Lock { .. }
                )
            })
            .collect();
        assert_eq!(
            interesting,
            vec![
                Operation::BeginBatchWrite,
                Operation::SetOplogDeleteFromPoint(Timestamp::new(7, 0)),
                Operation::InsertDocuments { ns: OPLOG_NS.into(), count: 2 },
                Operation::SetOplogDeleteFromPoint(Timestamp::NULL),
                Operation::SetMinValidToAtLeast(OpTime::new(Timestamp::new(8, 0), 1)),
                Operation::EndBatchWrite,
            ]
        );
        Ok(())
    }

    #[test]
    fn small_batches_write_oplog_single_threaded() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Recovering, 4);
        // One less than 16 × 4 writes via a single worker.
        let ops: Vec<_> = (0..63).map(|i| insert(i + 1, i as i64)).collect();
        h.applier.multi_apply(ops)?;
        let oplog_writes = h
            .operations
            .try_iter()
            .filter(|op| matches!(op, Operation::InsertDocuments { ns, .. } if ns == OPLOG_NS))
            .count();
        assert_eq!(oplog_writes, 1);
        Ok(())
    }

    #[test]
    fn large_batches_write_oplog_in_parallel() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Recovering, 4);
        // Exactly 16 × 4 splits across all four workers.
        let ops: Vec<_> = (0..64).map(|i| insert(i + 1, i as i64)).collect();
        h.applier.multi_apply(ops)?;
        let oplog_writes = h
            .operations
            .try_iter()
            .filter(|op| matches!(op, Operation::InsertDocuments { ns, .. } if ns == OPLOG_NS))
            .count();
        assert_eq!(oplog_writes, 4);

        // Parallel ranges still leave the oplog ordered by timestamp.
        let ts: Vec<_> = memory(&h)
            .oplog_documents()
            .iter()
            .map(|doc| match doc.get("ts") {
                Some(&Value::Timestamp(ts)) => ts,
                _ => panic!("no ts"),
            })
            .collect();
        assert!(ts.windows(2).all(|w| w[0] < w[1]));
        Ok(())
    }

    #[test]
    fn doc_locking_disabled_writes_oplog_single_threaded() -> Result<()> {
        let h = harness(Memory::new().with_doc_locking(false), MemberState::Recovering, 4);
        let ops: Vec<_> = (0..64).map(|i| insert(i + 1, i as i64)).collect();
        h.applier.multi_apply(ops)?;
        let oplog_writes = h
            .operations
            .try_iter()
            .filter(|op| matches!(op, Operation::InsertDocuments { ns, .. } if ns == OPLOG_NS))
            .count();
        assert_eq!(oplog_writes, 1);
        Ok(())
    }

    #[test]
    fn oplog_insert_failure_is_an_error() {
        let h = harness(Memory::new(), MemberState::Recovering, 2);
        h.storage.inner().inject_insert_error(Error::IO("disk full".into()));
        assert!(h.applier.multi_apply(vec![insert(1, 1)]).is_err());
    }

    #[test]
    fn prefetch_runs_on_legacy_engines_and_swallows_errors() -> Result<()> {
        let h = harness(Memory::new().with_legacy_engine(), MemberState::Recovering, 2);
        h.storage.inner().inject_prefetch_error(Error::IO("page fault".into()));
        h.applier.multi_apply(vec![insert(1, 1), insert(2, 2)])?;
        let prefetches = h
            .operations
            .try_iter()
            .filter(|op| matches!(op, Operation::Prefetch { .. }))
            .count();
        assert_eq!(prefetches, 2);
        Ok(())
    }

    #[test]
    fn no_prefetch_on_modern_engines() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Recovering, 2);
        h.applier.multi_apply(vec![insert(1, 1)])?;
        assert!(h
            .operations
            .try_iter()
            .all(|op| !matches!(op, Operation::Prefetch { .. })));
        Ok(())
    }

    #[test]
    fn worker_error_fails_the_batch() {
        let h = harness(Memory::new(), MemberState::Recovering, 2);
        // Fail the user-data apply (the oplog write goes through
        // insert_documents, not apply_operation).
        h.storage.inner().inject_apply_error(Error::InvalidData("corrupt".into()));
        // A single entry can't group, so exactly one apply call fails.
        let result = h.applier.multi_apply(vec![insert(1, 1)]);
        assert_eq!(result, Err(Error::InvalidData("corrupt".into())));
    }

    #[test]
    fn go_live_requires_min_valid() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Recovering, 2);
        h.storage.set_min_valid_to_at_least(OpTime::new(Timestamp::new(10, 0), 1))?;

        // Not caught up yet: stays in RECOVERING.
        h.applier.try_to_go_live_as_secondary()?;
        assert_eq!(h.coordinator.member_state(), MemberState::Recovering);

        // Caught up: transitions to SECONDARY.
        h.coordinator
            .set_my_last_applied_op_time_forward(OpTime::new(Timestamp::new(10, 0), 1));
        h.applier.try_to_go_live_as_secondary()?;
        assert_eq!(h.coordinator.member_state(), MemberState::Secondary);
        Ok(())
    }

    #[test]
    fn go_live_respects_maintenance_mode() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Recovering, 2);
        h.coordinator.set_maintenance(true);
        h.applier.try_to_go_live_as_secondary()?;
        assert_eq!(h.coordinator.member_state(), MemberState::Recovering);
        Ok(())
    }

    #[test]
    fn go_live_only_from_recovering() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Rollback, 2);
        h.applier.try_to_go_live_as_secondary()?;
        assert_eq!(h.coordinator.member_state(), MemberState::Rollback);
        Ok(())
    }

    #[test]
    fn go_live_tolerates_refused_transition() -> Result<()> {
        // The coordinator may refuse the transition; the applier warns and
        // carries on.
        let h = harness(Memory::new(), MemberState::Recovering, 2);
        h.coordinator.refuse_follower_mode(true);
        h.applier.try_to_go_live_as_secondary()?;
        assert_eq!(h.coordinator.member_state(), MemberState::Recovering);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "not greater than our last applied")]
    fn out_of_order_batch_is_fatal() {
        let h = harness(Memory::new(), MemberState::Secondary, 2);
        h.coordinator
            .set_my_last_applied_op_time_forward(OpTime::new(Timestamp::new(100, 0), 1));
        h.producer.push(insert(50, 1));
        h.producer.shutdown();
        let _ = h.applier.run();
    }

    #[test]
    fn run_drains_and_shuts_down() -> Result<()> {
        let h = harness(Memory::new(), MemberState::Secondary, 2);
        for i in 0..5 {
            h.producer.push(insert(i + 1, i as i64));
        }
        h.coordinator.set_waiting_for_drain(true);
        h.producer.push(OplogEntry::sentinel());
        h.producer.shutdown();

        h.applier.run()?;
        assert!(h.coordinator.drain_complete());
        assert_eq!(memory(&h).collection("app.users").unwrap().len(), 5);
        assert_eq!(
            h.coordinator.my_last_applied_op_time(),
            OpTime::new(Timestamp::new(5, 0), 1)
        );
        assert_eq!(h.storage.applied_through()?, OpTime::new(Timestamp::new(5, 0), 1));
        assert_eq!(h.applier.clock().now(), Timestamp::new(5, 0));
        Ok(())
    }
}
