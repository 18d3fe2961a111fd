//! Fetching documents that are missing locally during initial sync. When an
//! op fails to apply because its target document does not exist yet (the
//! cloner may have missed it), the document is fetched from the sync source
//! and inserted, and the op is retried.

use super::apply::write_conflict_retry;
use super::entry::{OpKind, OplogEntry};
use super::failpoint;
use crate::document::{Document, Value};
use crate::error::{Error, Result};
use crate::storage::{LockMode, LockScope, Storage};

use log::{debug, error, info, warn};

use std::sync::Arc;
use std::time::Duration;

/// The maximum number of fetch attempts before giving up.
const RETRY_MAX: u32 = 3;

/// A connection to the sync source, used to fetch individual documents.
/// Socket-class failures must be reported as [`Error::IO`]; they are
/// retried.
pub trait SyncSource: Send + Sync {
    /// Connects (or reconnects) to the given host.
    fn connect(&self, host: &str) -> Result<()>;

    /// Fetches a document by `_id` from a collection on the source, or None
    /// if it no longer exists there.
    fn find_by_id(&self, ns: &str, id: &Value) -> Result<Option<Document>>;
}

/// Fetches missing documents from the sync source during initial sync.
pub struct MissingDocFetcher {
    source: Arc<dyn SyncSource>,
    hostname: String,
    /// The backoff unit between attempts, scaled by the square of the
    /// attempt number. Tests shrink this.
    backoff_unit: Duration,
}

impl MissingDocFetcher {
    pub fn new(source: Arc<dyn SyncSource>, hostname: impl Into<String>) -> Self {
        Self { source, hostname: hostname.into(), backoff_unit: Duration::from_secs(1) }
    }

    /// Overrides the retry backoff unit.
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Fetches the document a failed op refers to and inserts it locally,
    /// returning whether the op should be retried. Returns false if the
    /// document no longer exists on the source, i.e. it was deleted later
    /// in the oplog, in which case the op can be dropped.
    pub fn should_retry(&self, storage: &dyn Storage, entry: &OplogEntry) -> Result<bool> {
        write_conflict_retry("insert_retry", &entry.ns, || {
            // Take the database exclusively to preclude other modifications;
            // it might not exist yet.
            let _db = storage.lock(LockScope::Database(entry.database()), LockMode::Exclusive);

            // Rare enough to log.
            info!("adding missing object for {entry}");

            let Some(missing) = self.fetch_missing_document(storage, entry)? else {
                info!("missing object not found on source, presumably deleted later in oplog");
                return Ok(false);
            };
            storage.insert_documents(&entry.ns, vec![missing.clone()])?;
            debug!("inserted missing doc: {missing}");
            Ok(true)
        })
    }

    /// Fetches the document an op refers to from the sync source. Missing
    /// documents are expected for capped collections, and when the source
    /// has since deleted the document; both return None. Network problems
    /// are retried up to [`RETRY_MAX`] times with quadratic backoff; running
    /// out of attempts is an error, which the caller escalates.
    ///
    /// Panics if the op carries no `_id` to fetch by; such an entry can
    /// never be resolved and the node must not proceed without it.
    pub fn fetch_missing_document(
        &self,
        storage: &dyn Storage,
        entry: &OplogEntry,
    ) -> Result<Option<Document>> {
        if storage.collection_properties(&entry.ns).capped {
            info!("missing doc, but this is okay for a capped collection ({})", entry.ns);
            return Ok(None);
        }

        if failpoint::HANG_BEFORE_GETTING_MISSING_DOC.is_enabled() {
            info!("hang_before_getting_missing_doc fail point enabled, blocking until disabled");
            while failpoint::HANG_BEFORE_GETTING_MISSING_DOC.is_enabled() {
                std::thread::sleep(Duration::from_secs(1));
            }
        }

        let Some(id) = entry.id_value() else {
            panic!("cannot fetch missing document without _id field: {entry}");
        };
        debug_assert!(entry.kind != OpKind::Update || entry.o2.is_some());

        for attempt in 1..=RETRY_MAX {
            if attempt != 1 {
                // Let the network possibly recover before retrying.
                std::thread::sleep(self.backoff_unit * (attempt * attempt));
            }

            match self.source.connect(&self.hostname) {
                Ok(()) => {}
                Err(Error::IO(_)) => {
                    warn!(
                        "network problem detected while connecting to the sync source, \
                         attempt {attempt} of {RETRY_MAX}"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            }

            match self.source.find_by_id(&entry.ns, id) {
                Ok(doc) => return Ok(doc),
                Err(Error::IO(_)) => {
                    warn!(
                        "network problem detected while fetching a missing document from the \
                         sync source, attempt {attempt} of {RETRY_MAX}"
                    );
                    continue;
                }
                Err(err) => {
                    error!("error fetching missing document: {err}");
                    return Err(err);
                }
            }
        }

        Err(Error::IO(format!("can no longer connect to initial sync source: {}", self.hostname)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Timestamp;
    use crate::storage::{CollectionProperties, Memory};

    use std::sync::Mutex;

    /// A scripted sync source: pops one result per call.
    struct Scripted {
        connects: Mutex<Vec<Result<()>>>,
        finds: Mutex<Vec<Result<Option<Document>>>>,
    }

    impl Scripted {
        fn new(connects: Vec<Result<()>>, finds: Vec<Result<Option<Document>>>) -> Self {
            Self { connects: Mutex::new(connects), finds: Mutex::new(finds) }
        }
    }

    impl SyncSource for Scripted {
        fn connect(&self, _host: &str) -> Result<()> {
            self.connects.lock().unwrap().remove(0)
        }

        fn find_by_id(&self, _ns: &str, _id: &Value) -> Result<Option<Document>> {
            self.finds.lock().unwrap().remove(0)
        }
    }

    fn fetcher(source: Scripted) -> MissingDocFetcher {
        MissingDocFetcher::new(Arc::new(source), "sync-source:27017")
            .with_backoff_unit(Duration::from_millis(1))
    }

    fn update(id: i64) -> OplogEntry {
        OplogEntry::update(
            Timestamp::new(10, 0),
            1,
            "app.users",
            Document::from([("v", 1_i64)]),
            Document::from([("_id", id)]),
        )
    }

    #[test]
    fn inserts_fetched_document() -> Result<()> {
        let doc = Document::from([("_id", 7_i64), ("v", 1_i64)]);
        let source = Scripted::new(vec![Ok(())], vec![Ok(Some(doc.clone()))]);
        let memory = Memory::new();

        assert!(fetcher(source).should_retry(&memory, &update(7))?);
        assert_eq!(memory.collection("app.users").unwrap(), vec![doc]);
        Ok(())
    }

    #[test]
    fn deleted_on_source_is_dropped() -> Result<()> {
        let source = Scripted::new(vec![Ok(())], vec![Ok(None)]);
        let memory = Memory::new();

        assert!(!fetcher(source).should_retry(&memory, &update(7))?);
        assert!(memory.collection("app.users").is_none());
        Ok(())
    }

    #[test]
    fn socket_errors_retry_until_success() -> Result<()> {
        let source = Scripted::new(
            vec![Err(Error::IO("reset".into())), Ok(()), Ok(())],
            vec![Err(Error::IO("reset".into())), Ok(Some(Document::from([("_id", 7_i64)])))],
        );
        let memory = Memory::new();
        assert!(fetcher(source).should_retry(&memory, &update(7))?);
        Ok(())
    }

    #[test]
    fn retries_exhausted_is_an_error() {
        let source = Scripted::new(
            vec![Err(Error::IO("down".into())); 3],
            vec![],
        );
        let memory = Memory::new();
        let result = fetcher(source).fetch_missing_document(&memory, &update(7));
        assert!(matches!(result, Err(Error::IO(_))));
    }

    #[test]
    fn non_socket_errors_propagate() {
        let source = Scripted::new(
            vec![Ok(())],
            vec![Err(Error::InvalidData("corrupt".into()))],
        );
        let memory = Memory::new();
        let result = fetcher(source).fetch_missing_document(&memory, &update(7));
        assert_eq!(result, Err(Error::InvalidData("corrupt".into())));
    }

    #[test]
    fn capped_collections_tolerate_missing_docs() -> Result<()> {
        let memory = Memory::new();
        memory.create_collection(
            "app.users",
            CollectionProperties { capped: true, has_nonsimple_collation: false },
        );
        // The source is never contacted.
        let source = Scripted::new(vec![], vec![]);
        assert_eq!(fetcher(source).fetch_missing_document(&memory, &update(7))?, None);
        Ok(())
    }

    #[test]
    #[should_panic(expected = "without _id field")]
    fn missing_id_is_fatal() {
        let source = Scripted::new(vec![], vec![]);
        let memory = Memory::new();
        let entry = OplogEntry::delete(Timestamp::new(1, 0), 1, "app.users", Document::new());
        let _ = fetcher(source).fetch_missing_document(&memory, &entry);
    }

    #[test]
    #[serial_test::serial]
    fn hang_failpoint_blocks_fetch() {
        failpoint::HANG_BEFORE_GETTING_MISSING_DOC.enable();
        let doc = Document::from([("_id", 7_i64)]);
        let fetcher = fetcher(Scripted::new(vec![Ok(())], vec![Ok(Some(doc.clone()))]));

        let handle = std::thread::spawn(move || {
            fetcher.fetch_missing_document(&Memory::new(), &update(7))
        });
        std::thread::sleep(Duration::from_millis(300));
        assert!(!handle.is_finished());

        failpoint::HANG_BEFORE_GETTING_MISSING_DOC.disable();
        assert_eq!(handle.join().unwrap().unwrap(), Some(doc));
    }
}
