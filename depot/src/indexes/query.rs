//! Read access to one index bucket.

use std::fmt;
use std::vec;

use crate::{
    objects::{Class, Object},
    Error, Result,
};

use super::{unescape_key, IndexManager};

/// Direction of paginated key iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    /// Lexicographically ascending.
    Asc,
    /// Lexicographically descending.
    Desc,
}

/// Query surface of one `(class, index)` bucket.
#[derive(Clone)]
pub struct IndexQuery {
    manager: IndexManager,
    class: Class,
    index: String,
}

impl fmt::Debug for IndexQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexQuery")
            .field("class", &self.class.name())
            .field("index", &self.index)
            .finish()
    }
}

impl IndexQuery {
    pub(crate) fn new(manager: IndexManager, class: Class, index: String) -> Self {
        Self {
            manager,
            class,
            index,
        }
    }

    /// The raw OIDs stored under `key`, materialized in first-seen order.
    ///
    /// For lazy enumeration use [`get_oids`].
    ///
    /// [`get_oids`]: #method.get_oids
    pub fn oids(&self, key: &str) -> Result<Vec<String>> {
        let bucket = IndexManager::bucket_key(self.class.name(), &self.index, key);
        self.manager.read_bucket(&bucket)
    }

    /// Lazily restores the objects stored under `key`, preserving insertion
    /// order. Nothing touches the backend until the first pull.
    pub fn get(&self, key: &str) -> IndexHits {
        IndexHits {
            class: self.class.clone(),
            oids: self.get_oids(key),
        }
    }

    /// Lazily yields the raw OIDs stored under `key` without restoring
    /// objects, preserving insertion order. Nothing touches the backend
    /// until the first pull.
    pub fn get_oids(&self, key: &str) -> OidHits {
        OidHits {
            manager: self.manager.clone(),
            bucket: IndexManager::bucket_key(self.class.name(), &self.index, key),
            oids: None,
            failed: false,
        }
    }

    /// The first object stored under `key`.
    pub fn one(&self, key: &str) -> Result<Object> {
        self.nth(key, 0)
    }

    /// The `index`-th object stored under `key`, or `NotFound`.
    pub fn nth(&self, key: &str, index: usize) -> Result<Object> {
        let oids = self.oids(key)?;
        match oids.get(index) {
            Some(oid) => self.class.get(oid),
            None => Err(Error::not_found(
                format!("{}.{}", self.class.name(), self.index),
                key,
            )),
        }
    }

    /// Whether any object is stored under `key`.
    pub fn has(&self, key: &str) -> Result<bool> {
        Ok(!self.oids(key)?.is_empty())
    }

    /// Number of objects stored under `key`.
    pub fn count(&self, key: &str) -> Result<usize> {
        Ok(self.oids(key)?.len())
    }

    /// Every key of this bucket, in ascending order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let prefix = IndexManager::bucket_prefix(self.class.name(), &self.index);
        let keys = self.manager.list_bucket_keys(&prefix)?;
        Ok(keys
            .into_iter()
            .map(|key| unescape_key(&key[prefix.len()..]))
            .collect())
    }

    /// A page of keys. `start` and `end` slice the ordered key sequence
    /// (after `order` is applied); `count` caps the page length.
    pub fn list(
        &self,
        count: Option<usize>,
        start: Option<usize>,
        end: Option<usize>,
        order: Order,
    ) -> Result<Vec<String>> {
        let mut keys = self.keys()?;
        if order == Order::Desc {
            keys.reverse();
        }
        let start = start.unwrap_or(0).min(keys.len());
        let end = end.unwrap_or_else(|| keys.len()).min(keys.len()).max(start);
        Ok(keys[start..end]
            .iter()
            .take(count.unwrap_or(usize::max_value()))
            .cloned()
            .collect())
    }
}

/// Lazy iterator over the raw OIDs found under one index key.
///
/// The bucket is read from the index backend on the first pull; a read
/// failure is delivered by that pull and ends the iteration.
#[derive(Debug)]
pub struct OidHits {
    manager: IndexManager,
    bucket: String,
    oids: Option<vec::IntoIter<String>>,
    failed: bool,
}

impl Iterator for OidHits {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.oids.is_none() {
            match self.manager.read_bucket(&self.bucket) {
                Ok(oids) => self.oids = Some(oids.into_iter()),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        self.oids.as_mut()?.next().map(Ok)
    }
}

/// Lazy iterator over the objects found under one index key.
///
/// Each pull resolves one OID through the class handle, so a record
/// failing to load surfaces as the error of its own pull.
#[derive(Debug)]
pub struct IndexHits {
    class: Class,
    oids: OidHits,
}

impl Iterator for IndexHits {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.oids.next()? {
            Ok(oid) => Some(self.class.get(&oid)),
            Err(e) => Some(Err(e)),
        }
    }
}
