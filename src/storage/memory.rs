use super::{ApplyOptions, CollectionProperties, Lock, LockMode, LockScope, Storage, OPLOG_NS};
use crate::document::{Document, Timestamp, Value};
use crate::errdata;
use crate::error::{Error, Result};
use crate::repl::entry::{split_namespace, OpKind, OplogEntry};
use crate::repl::OpTime;

use log::debug;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// An in-memory storage engine. Data is not persisted; durability signaling
/// is immediate. Used in tests and by embedders experimenting locally.
///
/// Collections are keyed by `_id` using the simple value comparator, except
/// capped collections which preserve strict insertion order. The oplog is
/// kept ordered by timestamp regardless of insertion order, as required of
/// doc-locking engines.
pub struct Memory {
    state: Mutex<State>,
    durable: bool,
    doc_locking: bool,
    legacy_engine: bool,
    oplog_max_size: u64,
    batch_write: AtomicBool,
}

struct State {
    collections: HashMap<String, Collection>,
    oplog: BTreeMap<Timestamp, Document>,
    indexes: HashMap<String, Vec<Document>>,
    oplog_delete_from_point: Timestamp,
    min_valid: OpTime,
    applied_through: OpTime,
}

#[derive(Default)]
struct Collection {
    properties: CollectionProperties,
    /// Documents by `_id`, for ordinary collections.
    docs: BTreeMap<Value, Document>,
    /// Documents in insertion order, for capped collections.
    rows: Vec<Document>,
}

impl Memory {
    /// Creates a new in-memory engine: non-durable, document-locking, with a
    /// 1 GiB oplog.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                collections: HashMap::new(),
                oplog: BTreeMap::new(),
                indexes: HashMap::new(),
                oplog_delete_from_point: Timestamp::NULL,
                min_valid: OpTime::NULL,
                applied_through: OpTime::NULL,
            }),
            durable: false,
            doc_locking: true,
            legacy_engine: false,
            oplog_max_size: 1 << 30,
            batch_write: AtomicBool::new(false),
        }
    }

    /// Enables durability signaling (journaling).
    pub fn with_durability(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets whether the engine supports document-level locking.
    pub fn with_doc_locking(mut self, doc_locking: bool) -> Self {
        self.doc_locking = doc_locking;
        self
    }

    /// Marks the engine as a legacy page-based engine, enabling prefetch.
    pub fn with_legacy_engine(mut self) -> Self {
        self.legacy_engine = true;
        self
    }

    /// Sets the maximum oplog size.
    pub fn with_oplog_max_size(mut self, bytes: u64) -> Self {
        self.oplog_max_size = bytes;
        self
    }

    /// Creates a collection with the given properties. Replaces an existing
    /// collection.
    pub fn create_collection(&self, ns: &str, properties: CollectionProperties) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.collections.insert(ns.to_string(), Collection { properties, ..Default::default() });
    }

    /// Returns a collection's documents: in `_id` order for ordinary
    /// collections, insertion order for capped ones. None if the collection
    /// does not exist.
    pub fn collection(&self, ns: &str) -> Option<Vec<Document>> {
        let state = self.state.lock().expect("lock poisoned");
        let collection = state.collections.get(ns)?;
        if collection.properties.capped {
            Some(collection.rows.clone())
        } else {
            Some(collection.docs.values().cloned().collect())
        }
    }

    /// Returns the oplog contents in timestamp order.
    pub fn oplog_documents(&self) -> Vec<Document> {
        let state = self.state.lock().expect("lock poisoned");
        state.oplog.values().cloned().collect()
    }

    /// Returns the index specs built for a database.
    pub fn index_specs(&self, db: &str) -> Vec<Document> {
        let state = self.state.lock().expect("lock poisoned");
        state.indexes.get(db).cloned().unwrap_or_default()
    }

    /// Inserts a single document payload into a collection, upserting by
    /// `_id` for ordinary collections.
    fn insert_into(collection: &mut Collection, doc: Document) -> Result<()> {
        if collection.properties.capped {
            collection.rows.push(doc);
            return Ok(());
        }
        let Some(id) = doc.id().cloned() else {
            return errdata!("document has no _id field: {doc}");
        };
        collection.docs.insert(id, doc);
        Ok(())
    }

    /// Extracts the document payloads of an insert op: a single document, or
    /// an array of documents for grouped inserts.
    fn insert_payloads(o: &Value) -> Result<Vec<Document>> {
        match o {
            Value::Document(doc) => Ok(vec![doc.clone()]),
            Value::Array(values) => values
                .iter()
                .map(|v| match v.as_document() {
                    Some(doc) => Ok(doc.clone()),
                    None => errdata!("grouped insert payload is not a document: {v}"),
                })
                .collect(),
            v => errdata!("insert payload is not a document: {v}"),
        }
    }
}

impl Storage for Memory {
    fn database_exists(&self, db: &str) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.collections.keys().any(|ns| split_namespace(ns).0 == db)
            || state.indexes.contains_key(db)
    }

    fn collection_exists(&self, ns: &str) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        state.collections.contains_key(ns)
    }

    fn collection_properties(&self, ns: &str) -> CollectionProperties {
        let state = self.state.lock().expect("lock poisoned");
        state.collections.get(ns).map(|c| c.properties).unwrap_or_default()
    }

    fn lock(&self, _scope: LockScope<'_>, _mode: LockMode) -> Box<dyn Lock + '_> {
        // The state mutex serializes all accesses; lock requests are
        // granted immediately.
        Box::new(())
    }

    fn insert_documents(&self, ns: &str, docs: Vec<Document>) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        if ns == OPLOG_NS {
            for doc in docs {
                let Some(&Value::Timestamp(ts)) = doc.get("ts") else {
                    return errdata!("oplog document has no ts field: {doc}");
                };
                state.oplog.insert(ts, doc);
            }
            return Ok(());
        }
        let collection = state.collections.entry(ns.to_string()).or_default();
        for doc in docs {
            Self::insert_into(collection, doc)?;
        }
        Ok(())
    }

    fn apply_operation(&self, entry: &OplogEntry, options: &ApplyOptions) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        match entry.kind {
            OpKind::Insert if entry.is_index_build() => {
                let Some(spec) = entry.o.as_document() else {
                    return errdata!("index build payload is not a document: {}", entry.o);
                };
                let db = entry.database().to_string();
                state.indexes.entry(db).or_default().push(spec.clone());
                Ok(())
            }
            OpKind::Insert => {
                let payloads = Self::insert_payloads(&entry.o)?;
                let collection = state.collections.entry(entry.ns.clone()).or_default();
                for doc in payloads {
                    Self::insert_into(collection, doc)?;
                }
                Ok(())
            }
            OpKind::Update => {
                let id = match entry.o2.as_ref().and_then(|o2| o2.as_document()).and_then(|d| d.id())
                {
                    Some(id) => id.clone(),
                    None => return errdata!("update entry has no o2._id: {entry}"),
                };
                let Some(new) = entry.o.as_document() else {
                    return errdata!("update payload is not a document: {}", entry.o);
                };
                let mut new = new.clone();
                if new.id().is_none() {
                    new.insert("_id", id.clone());
                }
                let upsert = options.convert_update_to_upsert;
                if !state.collections.contains_key(&entry.ns) {
                    if !upsert {
                        return Err(Error::DocumentNotFound(format!(
                            "no document with _id {id} in missing collection {}",
                            entry.ns
                        )));
                    }
                    state.collections.insert(entry.ns.clone(), Collection::default());
                }
                let collection =
                    state.collections.get_mut(&entry.ns).expect("collection exists");
                if collection.properties.capped {
                    match collection.rows.iter_mut().find(|doc| doc.id() == Some(&id)) {
                        Some(doc) => *doc = new,
                        None => {
                            return Err(Error::DocumentNotFound(format!(
                                "no document with _id {id} in {}",
                                entry.ns
                            )))
                        }
                    }
                    return Ok(());
                }
                if !upsert && !collection.docs.contains_key(&id) {
                    return Err(Error::DocumentNotFound(format!(
                        "no document with _id {id} in {}",
                        entry.ns
                    )));
                }
                collection.docs.insert(id, new);
                Ok(())
            }
            OpKind::Delete => {
                let id = match entry.o.as_document().and_then(|d| d.id()) {
                    Some(id) => id.clone(),
                    None => return errdata!("delete entry has no o._id: {entry}"),
                };
                // Deletes replay idempotently: a missing collection or
                // document is fine.
                if let Some(collection) = state.collections.get_mut(&entry.ns) {
                    if collection.properties.capped {
                        collection.rows.retain(|doc| doc.id() != Some(&id));
                    } else if collection.docs.remove(&id).is_none() {
                        debug!("delete of missing document _id {id} in {}", entry.ns);
                    }
                }
                Ok(())
            }
            OpKind::Noop => Ok(()),
            OpKind::Command => errdata!("command op routed to apply_operation: {entry}"),
        }
    }

    fn apply_command(&self, entry: &OplogEntry) -> Result<()> {
        let Some(command) = entry.o.as_document() else {
            return errdata!("command payload is not a document: {}", entry.o);
        };
        let db = entry.database();
        if let Some(Value::String(name)) = command.get("create") {
            let capped = command.get("capped") == Some(&Value::Boolean(true));
            let ns = format!("{db}.{name}");
            let mut state = self.state.lock().expect("lock poisoned");
            state.collections.entry(ns).or_insert_with(|| Collection {
                properties: CollectionProperties { capped, has_nonsimple_collation: false },
                ..Default::default()
            });
            return Ok(());
        }
        if let Some(Value::String(name)) = command.get("drop") {
            let ns = format!("{db}.{name}");
            let mut state = self.state.lock().expect("lock poisoned");
            // Dropping a missing collection replays idempotently.
            if state.collections.remove(&ns).is_none() {
                debug!("drop of missing collection {ns}");
            }
            return Ok(());
        }
        errdata!("unsupported command: {command}")
    }

    fn set_oplog_delete_from_point(&self, ts: Timestamp) -> Result<()> {
        self.state.lock().expect("lock poisoned").oplog_delete_from_point = ts;
        Ok(())
    }

    fn oplog_delete_from_point(&self) -> Result<Timestamp> {
        Ok(self.state.lock().expect("lock poisoned").oplog_delete_from_point)
    }

    fn set_min_valid_to_at_least(&self, op_time: OpTime) -> Result<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        state.min_valid = state.min_valid.max(op_time);
        Ok(())
    }

    fn min_valid(&self) -> Result<OpTime> {
        Ok(self.state.lock().expect("lock poisoned").min_valid)
    }

    fn set_applied_through(&self, op_time: OpTime) -> Result<()> {
        self.state.lock().expect("lock poisoned").applied_through = op_time;
        Ok(())
    }

    fn applied_through(&self) -> Result<OpTime> {
        Ok(self.state.lock().expect("lock poisoned").applied_through)
    }

    fn oplog_max_size(&self) -> Result<u64> {
        Ok(self.oplog_max_size)
    }

    fn is_durable(&self) -> bool {
        self.durable
    }

    fn supports_doc_locking(&self) -> bool {
        self.doc_locking
    }

    fn is_legacy_engine(&self) -> bool {
        self.legacy_engine
    }

    fn wait_until_durable(&self) -> Result<()> {
        Ok(())
    }

    fn prefetch(&self, _entry: &OplogEntry) -> Result<()> {
        Ok(())
    }

    fn begin_batch_write(&self) {
        let was = self.batch_write.swap(true, Ordering::SeqCst);
        debug_assert!(!was, "nested batch-writer mode");
    }

    fn end_batch_write(&self) {
        let was = self.batch_write.swap(false, Ordering::SeqCst);
        debug_assert!(was, "leaving batch-writer mode while not in it");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn insert(ts: u32, ns: &str, doc: Document) -> OplogEntry {
        OplogEntry::insert(Timestamp::new(ts, 0), 1, ns, doc)
    }

    #[test]
    fn insert_upserts_by_id() -> Result<()> {
        let memory = Memory::new();
        let options = ApplyOptions::replay(true);
        memory.apply_operation(&insert(1, "app.users", Document::from([("_id", 1_i64)])), &options)?;
        memory.apply_operation(
            &insert(2, "app.users", Document::from([("_id", 1_i64), ("x", 9_i64)])),
            &options,
        )?;
        assert_eq!(
            memory.collection("app.users").unwrap(),
            vec![Document::from([("_id", 1_i64), ("x", 9_i64)])],
        );
        Ok(())
    }

    #[test]
    fn grouped_insert_payload() -> Result<()> {
        let memory = Memory::new();
        let entry = OplogEntry::new(
            Timestamp::new(1, 0),
            1,
            OpKind::Insert,
            "app.users",
            Value::Array(vec![
                Document::from([("_id", 1_i64)]).into(),
                Document::from([("_id", 2_i64)]).into(),
            ]),
        );
        memory.apply_operation(&entry, &ApplyOptions::replay(true))?;
        assert_eq!(memory.collection("app.users").unwrap().len(), 2);
        Ok(())
    }

    #[test]
    fn update_upsert_flag() {
        let memory = Memory::new();
        let entry = OplogEntry::update(
            Timestamp::new(1, 0),
            1,
            "app.users",
            Document::from([("x", 1_i64)]),
            Document::from([("_id", 5_i64)]),
        );

        // Without upsert conversion, the missing target is an error.
        let result = memory.apply_operation(&entry, &ApplyOptions::replay(false));
        assert!(matches!(result, Err(Error::DocumentNotFound(_))));

        // With it, the update becomes an insert, with the _id taken from o2.
        memory.apply_operation(&entry, &ApplyOptions::replay(true)).unwrap();
        assert_eq!(
            memory.collection("app.users").unwrap(),
            vec![Document::from([("_id", 5_i64), ("x", 1_i64)])],
        );
    }

    #[test]
    fn delete_is_idempotent() -> Result<()> {
        let memory = Memory::new();
        let options = ApplyOptions::replay(true);
        let delete =
            OplogEntry::delete(Timestamp::new(2, 0), 1, "app.users", Document::from([("_id", 1_i64)]));
        memory.apply_operation(&delete, &options)?; // missing collection
        memory.apply_operation(&insert(1, "app.users", Document::from([("_id", 1_i64)])), &options)?;
        memory.apply_operation(&delete, &options)?;
        memory.apply_operation(&delete, &options)?; // missing document
        assert_eq!(memory.collection("app.users").unwrap(), vec![]);
        Ok(())
    }

    #[test]
    fn capped_preserves_insertion_order() -> Result<()> {
        let memory = Memory::new();
        memory.create_collection(
            "app.log",
            CollectionProperties { capped: true, has_nonsimple_collation: false },
        );
        let options = ApplyOptions::replay(true);
        for id in [3_i64, 1, 2] {
            memory.apply_operation(&insert(id as u32, "app.log", Document::from([("_id", id)])), &options)?;
        }
        let ids: Vec<_> = memory
            .collection("app.log")
            .unwrap()
            .iter()
            .map(|doc| doc.id().cloned().unwrap())
            .collect();
        assert_eq!(ids, vec![Value::Integer(3), Value::Integer(1), Value::Integer(2)]);
        Ok(())
    }

    #[test]
    fn oplog_ordered_by_ts() -> Result<()> {
        let memory = Memory::new();
        let entries = [insert(3, "app.users", Document::from([("_id", 3_i64)])),
            insert(1, "app.users", Document::from([("_id", 1_i64)])),
            insert(2, "app.users", Document::from([("_id", 2_i64)]))];
        memory.insert_documents(OPLOG_NS, entries.iter().map(|e| e.to_document()).collect())?;
        let ts: Vec<_> = memory
            .oplog_documents()
            .iter()
            .map(|doc| match doc.get("ts") {
                Some(&Value::Timestamp(ts)) => ts.secs,
                _ => panic!("no ts"),
            })
            .collect();
        assert_eq!(ts, vec![1, 2, 3]);
        Ok(())
    }

    #[test]
    fn commands_create_and_drop() -> Result<()> {
        let memory = Memory::new();
        let create = OplogEntry::command(
            Timestamp::new(1, 0),
            1,
            "app.$cmd",
            Document::from([("create", Value::from("log")), ("capped", Value::from(true))]),
        );
        memory.apply_command(&create)?;
        assert!(memory.collection_exists("app.log"));
        assert!(memory.collection_properties("app.log").capped);

        let drop = OplogEntry::command(
            Timestamp::new(2, 0),
            1,
            "app.$cmd",
            Document::from([("drop", "log")]),
        );
        memory.apply_command(&drop)?;
        assert!(!memory.collection_exists("app.log"));
        memory.apply_command(&drop)?; // idempotent
        Ok(())
    }

    #[test]
    fn index_build() -> Result<()> {
        let memory = Memory::new();
        let build = insert(1, "app.system.indexes", Document::from([("name", "x_1")]));
        memory.apply_operation(&build, &ApplyOptions::replay(true))?;
        assert_eq!(memory.index_specs("app"), vec![Document::from([("name", "x_1")])]);
        Ok(())
    }

    #[test]
    fn replication_metadata() -> Result<()> {
        let memory = Memory::new();
        assert_eq!(memory.min_valid()?, OpTime::NULL);

        let low = OpTime::new(Timestamp::new(5, 0), 1);
        let high = OpTime::new(Timestamp::new(9, 0), 1);
        memory.set_min_valid_to_at_least(high)?;
        memory.set_min_valid_to_at_least(low)?; // must not regress
        assert_eq!(memory.min_valid()?, high);

        memory.set_applied_through(low)?;
        assert_eq!(memory.applied_through()?, low);

        memory.set_oplog_delete_from_point(Timestamp::new(7, 0))?;
        assert_eq!(memory.oplog_delete_from_point()?, Timestamp::new(7, 0));
        memory.set_oplog_delete_from_point(Timestamp::NULL)?;
        assert!(memory.oplog_delete_from_point()?.is_null());
        Ok(())
    }
}
