//! The worker-side apply path. [`sync_apply`] dispatches a single oplog
//! entry to the storage engine's apply hooks under the appropriate locks,
//! retrying write conflicts transparently. [`multi_sync_apply`] and
//! [`multi_initial_sync_apply`] are the two worker bodies that run a stream
//! of a partitioned batch; which one is used is chosen when the applier is
//! constructed.

use super::entry::{OpKind, OplogEntry};
use super::fetch::MissingDocFetcher;
use super::stats::Stats;
use crate::document::Value;
use crate::error::{Error, Result};
use crate::storage::{ApplyOptions, LockMode, LockScope, Storage};

use log::{debug, error};

use std::sync::Arc;

/// The maximum cumulative payload size of a grouped insert, matching the
/// storage engine's insert-vector limit.
pub const INSERT_VECTOR_MAX_BYTES: usize = 256 * 1024;

/// The maximum number of inserts combined into one group.
const INSERT_GROUP_MAX_OPS: usize = 64;

/// Shared context for apply workers: the engine, metrics, and (during
/// initial sync) the missing-document fetcher.
pub struct ApplyContext {
    pub storage: Arc<dyn Storage>,
    pub stats: Arc<Stats>,
    pub fetcher: Option<MissingDocFetcher>,
}

/// A worker body applying one stream of a batch. Steady state and initial
/// sync are both of this shape; tests inject stubs.
pub type ApplyBatchFn =
    Arc<dyn Fn(&ApplyContext, &[OplogEntry], Vec<usize>) -> Result<()> + Send + Sync>;

/// Runs a storage operation, transparently retrying write conflicts. The
/// retry loop is unbounded; conflicts are expected to be transient.
pub(crate) fn write_conflict_retry<T>(
    name: &str,
    ns: &str,
    mut operation: impl FnMut() -> Result<T>,
) -> Result<T> {
    let mut attempts = 0u64;
    loop {
        match operation() {
            Err(Error::WriteConflict) => {
                attempts += 1;
                debug!("write conflict in {name} on {ns}, attempt {attempts}");
            }
            result => return result,
        }
    }
}

/// The number of user-visible ops an entry carries: the group size for a
/// grouped insert, otherwise one.
fn op_count(entry: &OplogEntry) -> u64 {
    match &entry.o {
        Value::Array(payloads) if entry.kind == OpKind::Insert => payloads.len() as u64,
        _ => 1,
    }
}

/// Applies a single oplog entry to the local node.
///
/// Commands run under the global write lock. No-ops and index builds take
/// the database lock exclusively. CRUD ops take intent-exclusive database
/// and collection locks, upgrading both to exclusive when the database or
/// collection has to be created first. Ops against an empty or "."
/// namespace are skipped: they are usually no-ops, and never applicable.
pub fn sync_apply(
    storage: &dyn Storage,
    stats: &Stats,
    entry: &OplogEntry,
    convert_update_to_upsert: bool,
) -> Result<()> {
    let ns = &entry.ns;
    if ns.is_empty() || ns.starts_with('.') {
        if entry.kind != OpKind::Noop {
            error!("skipping bad op in oplog: {entry}");
        }
        return Ok(());
    }

    let options = ApplyOptions::replay(convert_update_to_upsert);
    match entry.kind {
        OpKind::Command => write_conflict_retry("sync_apply_command", ns, || {
            // A command may need a global write lock, so conservatively
            // take one.
            let _global = storage.lock(LockScope::Global, LockMode::Exclusive);
            let result = storage.apply_command(entry);
            if result != Err(Error::WriteConflict) {
                stats.add_ops_applied(1);
            }
            result
        }),

        OpKind::Noop => write_conflict_retry("sync_apply_noop", ns, || {
            let _db = storage.lock(LockScope::Database(entry.database()), LockMode::Exclusive);
            storage.apply_operation(entry, &options)?;
            stats.add_ops_applied(1);
            Ok(())
        }),

        OpKind::Insert if entry.is_index_build() => {
            write_conflict_retry("sync_apply_index_build", ns, || {
                let _db = storage.lock(LockScope::Database(entry.database()), LockMode::Exclusive);
                storage.apply_operation(entry, &options)?;
                stats.add_ops_applied(op_count(entry));
                Ok(())
            })
        }

        OpKind::Insert | OpKind::Update | OpKind::Delete => {
            write_conflict_retry("sync_apply_crud", ns, || {
                let db = entry.database();
                let mut db_lock = storage.lock(LockScope::Database(db), LockMode::IntentExclusive);
                let mut coll_lock =
                    storage.lock(LockScope::Collection(ns), LockMode::IntentExclusive);
                if !storage.database_exists(db) || !storage.collection_exists(ns) {
                    // The apply hook will have to create the database or
                    // collection; upgrade both locks and try again.
                    drop(coll_lock);
                    drop(db_lock);
                    db_lock = storage.lock(LockScope::Database(db), LockMode::Exclusive);
                    coll_lock = storage.lock(LockScope::Collection(ns), LockMode::Exclusive);
                }
                storage.apply_operation(entry, &options)?;
                stats.add_ops_applied(op_count(entry));
                drop(coll_lock);
                drop(db_lock);
                Ok(())
            })
        }
    }
}

/// Applies a steady-state worker stream. The stream is stable-sorted by
/// namespace, which preserves producer order within each namespace, and
/// runs of consecutive inserts to one namespace are combined into single
/// vectored inserts.
pub fn multi_sync_apply(
    ctx: &ApplyContext,
    ops: &[OplogEntry],
    mut stream: Vec<usize>,
) -> Result<()> {
    if stream.len() > 1 {
        stream.sort_by(|&a, &b| ops[a].ns.cmp(&ops[b].ns)); // stable
    }

    let convert_update_to_upsert = true;
    // The final position of a failed group insert; grouping may only resume
    // beyond it, so a bad group isn't retried quadratically.
    let mut do_not_group_before = 0;

    let mut position = 0;
    while position < stream.len() {
        let entry = &ops[stream[position]];

        if entry.kind == OpKind::Insert
            && !entry.is_for_capped_collection
            && position > do_not_group_before
        {
            // Collect the run of groupable inserts following this one.
            let mut group_bytes = 0;
            let mut end = position + 1;
            while end < stream.len() && end - position < INSERT_GROUP_MAX_OPS {
                let next = &ops[stream[end]];
                if next.kind != OpKind::Insert || next.ns != entry.ns {
                    break;
                }
                group_bytes += next.payload_size();
                if group_bytes > INSERT_VECTOR_MAX_BYTES {
                    break;
                }
                end += 1;
            }

            if end > position + 1 {
                // Found more than one, apply them as a single vectored
                // insert: the leader's envelope with the o field replaced
                // by the array of all payloads.
                let mut grouped = entry.clone();
                grouped.o =
                    Value::Array(stream[position..end].iter().map(|&i| ops[i].o.clone()).collect());

                match sync_apply(ctx.storage.as_ref(), &ctx.stats, &grouped, convert_update_to_upsert)
                {
                    Ok(()) => {
                        position = end;
                        continue;
                    }
                    Err(err) => {
                        // Fall through to apply the leader on its own.
                        error!("error applying inserts in bulk ({err}), trying first insert as a lone insert");
                        do_not_group_before = end - 1;
                    }
                }
            }
        }

        let entry = &ops[stream[position]];
        if let Err(err) = sync_apply(ctx.storage.as_ref(), &ctx.stats, entry, convert_update_to_upsert)
        {
            error!("error applying operation ({entry}): {err}");
            return Err(err);
        }
        position += 1;
    }
    Ok(())
}

/// Applies an initial-sync worker stream. Updates are not converted to
/// upserts; a failed op instead fetches the missing document from the sync
/// source and retries once. CRUD failures on collections that will be
/// re-cloned later in initial sync are skipped.
pub fn multi_initial_sync_apply(
    ctx: &ApplyContext,
    ops: &[OplogEntry],
    stream: Vec<usize>,
) -> Result<()> {
    let convert_update_to_upsert = false;
    for index in stream {
        let entry = &ops[index];
        match sync_apply(ctx.storage.as_ref(), &ctx.stats, entry, convert_update_to_upsert) {
            Ok(()) => {}

            // The collection will be dropped and rebuilt before initial
            // sync ends, so this op is irrelevant.
            Err(Error::NamespaceNotFound(_)) | Err(Error::CannotIndexParallelArrays)
                if entry.is_crud() => {}

            Err(err) => {
                let Some(fetcher) = &ctx.fetcher else {
                    error!("error applying operation ({entry}): {err}");
                    return Err(err);
                };
                if fetcher.should_retry(ctx.storage.as_ref(), entry)? {
                    if let Err(err) = sync_apply(
                        ctx.storage.as_ref(),
                        &ctx.stats,
                        entry,
                        convert_update_to_upsert,
                    ) {
                        error!("error applying operation ({entry}): {err}");
                        return Err(err);
                    }
                }
                // If the fetch came back empty, the document was moved or
                // deleted later in the oplog and the op can be dropped.
            }
        }
    }
    Ok(())
}
