//! Derived lookup tables over structured objects.
//!
//! Each class may declare named indexes; the [`IndexManager`] keeps one
//! persisted bucket per `(class, index)` in its own backend, mapping index
//! keys to ordered OID lists. Buckets are patched incrementally on every
//! save and remove, and can be rebuilt wholesale from the object store.

pub use self::{
    indexer::{IndexKeys, Indexer},
    query::{IndexHits, IndexQuery, OidHits, Order},
};

mod indexer;
mod query;

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    backend::Backend,
    objects::ObjectStore,
    record::ObjectRecord,
    schema::ClassSchema,
    Error, Result,
};

pub(crate) struct IndexShared {
    store: ObjectStore,
    backend: Box<dyn Backend>,
    // Serializes bucket read-modify-write cycles. Taken after the object
    // store's lock, never before it.
    lock: Mutex<()>,
}

/// Maintains every declared index of an object store inside a dedicated
/// backend.
///
/// The manager hooks the store it is created for: each `save` hands it the
/// previous and the new record so only the changed keys are touched, and
/// each `remove` drops the object from every key it appeared under.
/// Cloning is cheap and shares all state.
pub struct IndexManager {
    shared: Arc<IndexShared>,
}

impl Clone for IndexManager {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexManager").finish_non_exhaustive()
    }
}

impl IndexManager {
    /// Creates the manager over `backend` and attaches it to `store`.
    pub fn new(store: &ObjectStore, backend: impl Backend) -> Self {
        let manager = Self {
            shared: Arc::new(IndexShared {
                store: store.clone(),
                backend: Box::new(backend),
                lock: Mutex::new(()),
            }),
        };
        store.attach_indexes(&manager);
        manager
    }

    pub(crate) fn from_shared(shared: Arc<IndexShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<IndexShared> {
        &self.shared
    }

    /// Query handle for the index `index` declared on `class`.
    pub fn query(&self, class: &str, index: &str) -> Result<IndexQuery> {
        let handle = self.shared.store.class(class)?;
        if !handle.schema().indexes().contains_key(index) {
            return Err(Error::UnknownProperty {
                class: class.to_owned(),
                name: index.to_owned(),
            });
        }
        Ok(IndexQuery::new(self.clone(), handle, index.to_owned()))
    }

    /// Flushes the index backend's durable state.
    pub fn sync(&self) -> Result<()> {
        self.shared.backend.sync()
    }

    /// Drops and replays every bucket of every registered class.
    ///
    /// Not safe against concurrent writers; quiesce them first. With
    /// `sync`, the index backend is flushed before returning.
    pub fn rebuild(&self, sync: bool) -> Result<()> {
        for class in self.shared.store.classes() {
            let schema = class.schema();
            if schema.indexes().is_empty() {
                continue;
            }
            {
                let _guard = self.shared.lock.lock();
                for key in self.shared.backend.keys(&format!("{}/", schema.name()))? {
                    self.shared.backend.remove(&key)?;
                }
            }
            for object in class.all()? {
                let object = object?;
                let record = object.current_record()?;
                let oid = record.oid.clone();
                self.object_saved(schema, &oid, None, &record)?;
            }
            debug!("rebuilt indexes of {}", schema.name());
        }
        if sync {
            self.shared.backend.sync()?;
        }
        Ok(())
    }

    pub(crate) fn object_saved(
        &self,
        schema: &ClassSchema,
        oid: &str,
        prev: Option<&ObjectRecord>,
        next: &ObjectRecord,
    ) -> Result<()> {
        let _guard = self.shared.lock.lock();
        for (name, indexer) in schema.indexes() {
            let old: BTreeSet<String> = prev
                .map(|record| indexer.keys(name, record).into_iter().collect())
                .unwrap_or_default();
            let new: BTreeSet<String> = indexer.keys(name, next).into_iter().collect();
            for key in old.difference(&new) {
                self.drop_entry(schema.name(), name, key, oid)?;
            }
            for key in new.difference(&old) {
                self.add_entry(schema.name(), name, key, oid)?;
            }
        }
        Ok(())
    }

    pub(crate) fn object_removed(
        &self,
        schema: &ClassSchema,
        oid: &str,
        prev: Option<&ObjectRecord>,
    ) -> Result<()> {
        let record = match prev {
            Some(record) => record,
            None => return Ok(()),
        };
        let _guard = self.shared.lock.lock();
        for (name, indexer) in schema.indexes() {
            for key in indexer.keys(name, record) {
                self.drop_entry(schema.name(), name, &key, oid)?;
            }
        }
        Ok(())
    }

    pub(crate) fn bucket_key(class: &str, index: &str, key: &str) -> String {
        format!("{}/{}/{}", class, index, escape_key(key))
    }

    pub(crate) fn bucket_prefix(class: &str, index: &str) -> String {
        format!("{}/{}/", class, index)
    }

    pub(crate) fn read_bucket(&self, bucket: &str) -> Result<Vec<String>> {
        match self.shared.backend.get(bucket)? {
            Some(bytes) => {
                serde_json::from_slice(&bytes).map_err(|e| Error::backend(bucket, e))
            }
            None => Ok(Vec::new()),
        }
    }

    pub(crate) fn list_bucket_keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.shared.backend.keys(prefix)
    }

    fn write_bucket(&self, bucket: &str, oids: &[String]) -> Result<()> {
        if oids.is_empty() {
            self.shared.backend.remove(bucket)
        } else {
            let bytes = serde_json::to_vec(oids).map_err(|e| Error::backend(bucket, e))?;
            self.shared.backend.update(bucket, &bytes)
        }
    }

    // Insertion preserves first-seen order; duplicates are suppressed.
    fn add_entry(&self, class: &str, index: &str, key: &str, oid: &str) -> Result<()> {
        let bucket = Self::bucket_key(class, index, key);
        let mut oids = self.read_bucket(&bucket)?;
        if !oids.iter().any(|existing| existing == oid) {
            oids.push(oid.to_owned());
            self.write_bucket(&bucket, &oids)?;
        }
        Ok(())
    }

    fn drop_entry(&self, class: &str, index: &str, key: &str, oid: &str) -> Result<()> {
        let bucket = Self::bucket_key(class, index, key);
        let mut oids = self.read_bucket(&bucket)?;
        let before = oids.len();
        oids.retain(|existing| existing != oid);
        if oids.len() != before {
            self.write_bucket(&bucket, &oids)?;
        }
        Ok(())
    }
}

// Index keys may contain the path separator; it is escaped so that
// `keys(prefix)` scoping stays unambiguous.
pub(crate) fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace('/', "%2F")
}

pub(crate) fn unescape_key(key: &str) -> String {
    key.replace("%2F", "/").replace("%25", "%")
}
