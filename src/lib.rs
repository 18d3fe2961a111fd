//! oplogtail is the replication tail applier of a replica-set database node.
//! It continuously pulls an ordered log of write operations (oplog entries)
//! from an upstream producer and applies them locally, so that the node's
//! state converges toward the primary's. It batches inbound entries, writes
//! them to the local oplog and applies their user-data effects in parallel
//! across a writer pool, and advances the applied and durable points in
//! batch-commit order.
//!
//! The crate provides the applier core and the traits it consumes: a
//! [`repl::Producer`] feeding entries, a [`storage::Storage`] engine applying
//! them, and a [`repl::Coordinator`] tracking replication progress. An
//! in-memory [`storage::Memory`] engine and [`repl::producer::Queue`] are
//! included for tests and embedding.

#![warn(clippy::all)]

pub mod config;
pub mod document;
pub mod encoding;
pub mod error;
pub mod repl;
pub mod storage;

pub use config::{Config, Settings};
pub use document::{Document, Timestamp, Value};
pub use error::{Error, Result};
pub use repl::{Applier, Coordinator, OpTime, OplogEntry, Producer};
pub use storage::Storage;
