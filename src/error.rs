use serde_derive::{Deserialize, Serialize};

/// oplogtail errors. All errors are handled via this enum; oplog application
/// never surfaces errors to end users, so the variants classify how the
/// applier reacts: retry transparently, skip, refetch, or fault the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Invalid data, e.g. corrupt oplog entries or malformed documents.
    InvalidData(String),
    /// Invalid configuration or arguments.
    InvalidInput(String),
    /// An I/O or network error. Socket-class errors are retried during
    /// missing-document fetch.
    IO(String),
    /// The database or collection targeted by an operation does not exist.
    /// Skippable for CRUD ops during initial sync.
    NamespaceNotFound(String),
    /// A multikey index build touched parallel arrays. Skippable for CRUD
    /// ops during initial sync.
    CannotIndexParallelArrays,
    /// No document matched the operation's target. Routes to the
    /// missing-document refetch path during initial sync.
    DocumentNotFound(String),
    /// The write conflicted with a concurrent write and must be retried.
    WriteConflict,
    /// Oplog application was attempted while the node is primary.
    CannotApplyWhilePrimary,
    /// The oplog went back in time or repeated an entry.
    OplogOutOfOrder(String),
}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NamespaceNotFound(ns) => write!(f, "namespace {ns} not found"),
            Error::CannotIndexParallelArrays => write!(f, "cannot index parallel arrays"),
            Error::DocumentNotFound(msg) => write!(f, "document not found: {msg}"),
            Error::WriteConflict => write!(f, "write conflict, retry operation"),
            Error::CannotApplyWhilePrimary => {
                write!(f, "attempting to replicate ops while primary")
            }
            Error::OplogOutOfOrder(msg) => write!(f, "oplog out of order: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData via format!() and returns it as a Result.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidData(format!($($args)*))) };
}

/// Constructs an Error::InvalidInput via format!() and returns it as a Result.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { Err($crate::error::Error::InvalidInput(format!($($args)*))) };
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::InvalidInput(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

/// A oplogtail Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
