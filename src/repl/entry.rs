use crate::document::{Document, Timestamp, Value};
use crate::encoding::bincode;
use crate::errdata;
use crate::error::Result;

use serde_derive::{Deserialize, Serialize};

/// The sole supported oplog schema version. Entries without a version field
/// are treated as version 1; anything other than this version is fatal.
pub const OPLOG_VERSION: u32 = 2;

/// A term in which a primary produced oplog entries.
pub type Term = u64;

/// The position of an oplog entry: its timestamp and the term it was
/// produced in. Totally ordered lexicographically by (ts, term).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpTime {
    pub ts: Timestamp,
    pub term: Term,
}

impl OpTime {
    /// The null optime, ordered before all others.
    pub const NULL: OpTime = OpTime { ts: Timestamp::NULL, term: 0 };

    /// Creates a new optime.
    pub fn new(ts: Timestamp, term: Term) -> Self {
        Self { ts, term }
    }

    /// Returns true if this is the null optime.
    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }
}

impl std::fmt::Display for OpTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.ts, self.term)
    }
}

/// The kind of an oplog operation, a single character on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// A document insert (`i`).
    Insert,
    /// A document update (`u`).
    Update,
    /// A document delete (`d`).
    Delete,
    /// A database command (`c`).
    Command,
    /// A no-op (`n`), e.g. produced on leader changes.
    Noop,
}

impl OpKind {
    /// The wire character for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Insert => "i",
            OpKind::Update => "u",
            OpKind::Delete => "d",
            OpKind::Command => "c",
            OpKind::Noop => "n",
        }
    }

    /// Parses a wire character.
    pub fn try_from_str(s: &str) -> Result<Self> {
        match s {
            "i" => Ok(OpKind::Insert),
            "u" => Ok(OpKind::Update),
            "d" => Ok(OpKind::Delete),
            "c" => Ok(OpKind::Command),
            "n" => Ok(OpKind::Noop),
            kind => errdata!("bad op kind '{kind}' in oplog entry"),
        }
    }

    /// Returns true for insert, update, and delete ops.
    pub fn is_crud(&self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update | OpKind::Delete)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Splits a namespace of the form "database.collection" at the first dot.
/// The database of a dotless namespace is the whole string.
pub fn split_namespace(ns: &str) -> (&str, &str) {
    match ns.split_once('.') {
        Some((db, collection)) => (db, collection),
        None => (ns, ""),
    }
}

/// A single oplog entry, immutable once produced. The derived
/// `is_for_capped_collection` marker is set by the batch partitioner and is
/// not part of the wire form; neither is the cached encoded size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OplogEntry {
    /// The entry's timestamp, globally monotone per producer.
    pub ts: Timestamp,
    /// The term the entry was produced in.
    pub term: Term,
    /// The operation kind.
    pub kind: OpKind,
    /// The target namespace, "database.collection". May be empty or "." for
    /// sentinels and corrupt entries.
    pub ns: String,
    /// The primary payload. A document for ordinary ops; an array of
    /// documents for grouped inserts.
    pub o: Value,
    /// The auxiliary payload; present for updates, holding the identifying
    /// key of the target document.
    pub o2: Option<Value>,
    /// The oplog schema version. Absent means version 1.
    pub version: Option<u32>,
    /// True if this is an insert into a capped collection. Set while
    /// partitioning a batch; refuses insert grouping downstream.
    #[serde(skip)]
    pub is_for_capped_collection: bool,
    /// The entry's raw encoded size, cached at construction.
    #[serde(skip)]
    size: usize,
}

impl OplogEntry {
    /// Creates a new oplog entry at the supported oplog version.
    pub fn new(
        ts: Timestamp,
        term: Term,
        kind: OpKind,
        ns: impl Into<String>,
        o: impl Into<Value>,
    ) -> Self {
        let mut entry = Self {
            ts,
            term,
            kind,
            ns: ns.into(),
            o: o.into(),
            o2: None,
            version: Some(OPLOG_VERSION),
            is_for_capped_collection: false,
            size: 0,
        };
        entry.size = entry.compute_size();
        entry
    }

    /// Creates an insert entry.
    pub fn insert(ts: Timestamp, term: Term, ns: impl Into<String>, doc: Document) -> Self {
        Self::new(ts, term, OpKind::Insert, ns, doc)
    }

    /// Creates an update entry. `o` is the new document contents, `o2` the
    /// identifying key of the target.
    pub fn update(
        ts: Timestamp,
        term: Term,
        ns: impl Into<String>,
        o: Document,
        o2: Document,
    ) -> Self {
        let mut entry = Self::new(ts, term, OpKind::Update, ns, o);
        entry.o2 = Some(Value::Document(o2));
        entry.size = entry.compute_size();
        entry
    }

    /// Creates a delete entry. `o` holds the identifying key of the target.
    pub fn delete(ts: Timestamp, term: Term, ns: impl Into<String>, o: Document) -> Self {
        Self::new(ts, term, OpKind::Delete, ns, o)
    }

    /// Creates a command entry against a database's $cmd namespace.
    pub fn command(ts: Timestamp, term: Term, ns: impl Into<String>, o: Document) -> Self {
        Self::new(ts, term, OpKind::Command, ns, o)
    }

    /// Creates a sentinel entry, used by the producer to signal that it has
    /// coalesced and the applier has processed all of its data.
    pub fn sentinel() -> Self {
        Self {
            ts: Timestamp::NULL,
            term: 0,
            kind: OpKind::Noop,
            ns: String::new(),
            o: Value::Null,
            o2: None,
            version: None,
            is_for_capped_collection: false,
            size: 0,
        }
    }

    /// Returns true if this is a producer sentinel.
    pub fn is_sentinel(&self) -> bool {
        self.ns.is_empty() && self.ts.is_null() && self.kind == OpKind::Noop
    }

    /// The entry's optime.
    pub fn op_time(&self) -> OpTime {
        OpTime::new(self.ts, self.term)
    }

    /// Returns true for insert, update, and delete ops.
    pub fn is_crud(&self) -> bool {
        self.kind.is_crud()
    }

    /// Returns true if this is an index build, which is replicated as an
    /// insert into the database's system.indexes collection.
    pub fn is_index_build(&self) -> bool {
        self.kind == OpKind::Insert && split_namespace(&self.ns).1 == "system.indexes"
    }

    /// The database part of the entry's namespace.
    pub fn database(&self) -> &str {
        split_namespace(&self.ns).0
    }

    /// The `_id` of the document affected by this op: from `o2` for updates,
    /// otherwise from `o`. None if absent or if the payload is not a
    /// document.
    pub fn id_value(&self) -> Option<&Value> {
        let payload = match self.kind {
            OpKind::Update => self.o2.as_ref()?,
            _ => &self.o,
        };
        payload.as_document()?.id()
    }

    /// The entry's raw encoded size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// The encoded size of the primary payload, used to bound insert
    /// grouping.
    pub fn payload_size(&self) -> usize {
        bincode::serialized_size(&self.o).expect("payload is serializable")
    }

    fn compute_size(&self) -> usize {
        bincode::serialized_size(self).expect("entry is serializable")
    }

    /// Converts the entry into its oplog document form.
    pub fn to_document(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("ts", self.ts);
        doc.insert("t", self.term as i64);
        doc.insert("op", self.kind.as_str());
        doc.insert("ns", self.ns.clone());
        doc.insert("o", self.o.clone());
        if let Some(o2) = &self.o2 {
            doc.insert("o2", o2.clone());
        }
        if let Some(version) = self.version {
            doc.insert("v", version as i64);
        }
        doc
    }

    /// Parses an entry from its oplog document form.
    pub fn from_document(doc: &Document) -> Result<Self> {
        let Some(&Value::Timestamp(ts)) = doc.get("ts") else {
            return errdata!("oplog document has no ts field: {doc}");
        };
        let Some(&Value::Integer(term)) = doc.get("t") else {
            return errdata!("oplog document has no t field: {doc}");
        };
        let Some(Value::String(kind)) = doc.get("op") else {
            return errdata!("oplog document has no op field: {doc}");
        };
        let Some(Value::String(ns)) = doc.get("ns") else {
            return errdata!("oplog document has no ns field: {doc}");
        };
        let Some(o) = doc.get("o") else {
            return errdata!("oplog document has no o field: {doc}");
        };
        let version = match doc.get("v") {
            Some(&Value::Integer(v)) => Some(v as u32),
            Some(v) => return errdata!("bad oplog version {v} in document: {doc}"),
            None => None,
        };
        let mut entry = Self {
            ts,
            term: term as Term,
            kind: OpKind::try_from_str(kind)?,
            ns: ns.clone(),
            o: o.clone(),
            o2: doc.get("o2").cloned(),
            version,
            is_for_capped_collection: false,
            size: 0,
        };
        entry.size = entry.compute_size();
        Ok(entry)
    }
}

impl std::fmt::Display for OplogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}", self.kind, self.ns, self.op_time())
    }
}
