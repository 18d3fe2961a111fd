//! The storage engine interface consumed by the replication applier, and an
//! in-memory implementation. The applier drives the engine through the
//! object-safe [`Storage`] trait: catalog lookups, document and oplog
//! writes, the replication metadata cells used for crash consistency, and
//! the lock and durability primitives the apply path depends on.

mod memory;

pub use memory::Memory;

use crate::document::{Document, Timestamp};
use crate::error::Result;
use crate::repl::entry::OplogEntry;
use crate::repl::OpTime;

/// The namespace of the local oplog collection.
pub const OPLOG_NS: &str = "local.oplog.rs";

/// Collection properties relevant to oplog application.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CollectionProperties {
    /// Whether the collection is capped. Capped collections preserve strict
    /// insertion order, which disqualifies insert grouping and per-id
    /// dispersal.
    pub capped: bool,
    /// Whether the collection has a non-simple default collation, which
    /// disqualifies per-id dispersal (the `_id` cannot be hashed with
    /// respect to the collation).
    pub has_nonsimple_collation: bool,
}

/// A lock scope.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LockScope<'a> {
    Global,
    Database(&'a str),
    Collection(&'a str),
}

/// A lock mode.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LockMode {
    Shared,
    Exclusive,
    IntentShared,
    IntentExclusive,
}

/// A held lock, released on drop.
pub trait Lock {}

impl Lock for () {}

/// Options passed to the operation apply hook. Oplog application always
/// disables replicated-write tracking and document validation; steady-state
/// replay additionally converts updates into upserts so that updates of
/// since-removed documents replay idempotently.
#[derive(Clone, Copy, Debug)]
pub struct ApplyOptions {
    pub convert_update_to_upsert: bool,
    pub replicated_writes: bool,
    pub validate_documents: bool,
}

impl ApplyOptions {
    /// Options for oplog replay with the given update-to-upsert conversion.
    pub fn replay(convert_update_to_upsert: bool) -> Self {
        Self { convert_update_to_upsert, replicated_writes: false, validate_documents: false }
    }
}

/// A storage engine, as seen by the replication applier. Implementations
/// must be thread-safe: the writer pool calls into the engine from many
/// threads at once.
pub trait Storage: Send + Sync {
    /// Returns true if the database exists.
    fn database_exists(&self, db: &str) -> bool;

    /// Returns true if the collection exists.
    fn collection_exists(&self, ns: &str) -> bool;

    /// Returns the properties of a collection. Missing collections have
    /// default properties.
    fn collection_properties(&self, ns: &str) -> CollectionProperties;

    /// Acquires a lock, blocking until granted. The lock is released when
    /// the returned guard is dropped.
    fn lock(&self, scope: LockScope<'_>, mode: LockMode) -> Box<dyn Lock + '_>;

    /// Bulk-inserts documents into a namespace, creating it if missing. The
    /// oplog namespace must end up ordered by `ts` regardless of insertion
    /// order on engines that support document-level locking.
    fn insert_documents(&self, ns: &str, docs: Vec<Document>) -> Result<()>;

    /// Applies a CRUD, no-op, or index-build oplog entry. The caller holds
    /// the locks required by the entry kind.
    fn apply_operation(&self, entry: &OplogEntry, options: &ApplyOptions) -> Result<()>;

    /// Applies a command oplog entry. The caller holds the global write
    /// lock.
    fn apply_command(&self, entry: &OplogEntry) -> Result<()>;

    /// Persists the timestamp from which the oplog must be truncated after
    /// a crash, marking a batch's oplog writes as in progress. A null
    /// timestamp clears the marker.
    fn set_oplog_delete_from_point(&self, ts: Timestamp) -> Result<()>;

    /// The current oplog truncation point; null outside batch writes.
    fn oplog_delete_from_point(&self) -> Result<Timestamp>;

    /// Advances the minimum optime the node must reach before it can claim
    /// consistency. Never regresses.
    fn set_min_valid_to_at_least(&self, op_time: OpTime) -> Result<()>;

    /// The current minimum-valid optime.
    fn min_valid(&self) -> Result<OpTime>;

    /// Persists the optime the node has finished applying through.
    fn set_applied_through(&self, op_time: OpTime) -> Result<()>;

    /// The persisted applied-through optime.
    fn applied_through(&self) -> Result<OpTime>;

    /// The maximum size of the oplog in bytes. Batches are limited to a
    /// fraction of this.
    fn oplog_max_size(&self) -> Result<u64>;

    /// Whether the engine journals writes. Enables the durable finalizer.
    fn is_durable(&self) -> bool;

    /// Whether the engine supports document-level locking. Enables parallel
    /// oplog writes and per-id batch dispersal.
    fn supports_doc_locking(&self) -> bool;

    /// Whether this is a legacy page-based engine that benefits from
    /// prefetching pages before applying a batch.
    fn is_legacy_engine(&self) -> bool;

    /// Blocks until all previous writes are durable.
    fn wait_until_durable(&self) -> Result<()>;

    /// Warms pages relevant to an entry on legacy engines. Errors are
    /// ignored by the caller.
    fn prefetch(&self, entry: &OplogEntry) -> Result<()>;

    /// Enters batch-writer mode, halting all readers so they cannot observe
    /// an intermediate state of the batch. Use [`BatchWriterGuard`].
    fn begin_batch_write(&self);

    /// Leaves batch-writer mode.
    fn end_batch_write(&self);
}

/// An RAII guard for the storage engine's batch-writer mode.
pub struct BatchWriterGuard<'a> {
    storage: &'a dyn Storage,
}

impl<'a> BatchWriterGuard<'a> {
    /// Enters batch-writer mode until the guard is dropped.
    pub fn new(storage: &'a dyn Storage) -> Self {
        storage.begin_batch_write();
        Self { storage }
    }
}

impl Drop for BatchWriterGuard<'_> {
    fn drop(&mut self) {
        self.storage.end_batch_write();
    }
}
