//! The replication tail applier. The data path is a pipeline:
//!
//! Producer → Batcher → Applier (writer pool) → Finalizer → Coordinator
//!
//! A [`Producer`] yields oplog entries fetched from the sync source. The
//! [`Batcher`] drains it on a dedicated thread, cutting batches on size,
//! count, command, and delay constraints, and hands one batch at a time to
//! the [`Applier`] through a single-slot rendezvous. The applier writes the
//! batch to the local oplog and applies its user-data effects in parallel
//! across a writer pool, then advances the applied timestamp; when the
//! storage engine journals, a [`finalizer`] thread waits for durability and
//! advances the durable timestamp. The [`Coordinator`] tracks both and owns
//! role-state transitions.

pub mod applier;
pub mod apply;
pub mod batcher;
pub mod clock;
pub mod coordinator;
pub mod entry;
pub mod failpoint;
pub mod fetch;
pub mod finalizer;
mod partition;
pub mod pool;
pub mod producer;
pub mod stats;

pub use applier::Applier;
pub use batcher::{BatchLimits, Batcher, OpQueue};
pub use clock::LogicalClock;
pub use coordinator::{Coordinator, MemberState};
pub use entry::{OpKind, OpTime, OplogEntry, Term, OPLOG_VERSION};
pub use producer::Producer;
pub use stats::Stats;
