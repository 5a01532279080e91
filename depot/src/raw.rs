//! The raw (blob) store.
//!
//! A raw object splits into two sibling records: an opaque byte stream
//! under `collection/oid.data` and a JSON metadata record under
//! `collection/oid.meta`. The two always exist together and are removed
//! together. Blob contents can be read in chunks; when the backend exposes
//! filesystem paths the chunks stream straight from the file.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::vec;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    backend::{Backend, Capabilities},
    cache::WeakCache,
    objects::generate_oid,
    schema::RESERVED_NAMES,
    types::{ExactClasses, Type, Value},
    Error, Result,
};

/// Declarative description of a raw class: a name, a collection prefix and
/// the typed metadata attributes.
///
/// Metadata keys outside the declared set are accepted as long as they hold
/// primitive trees.
#[derive(Debug, Clone)]
pub struct RawSchema {
    name: String,
    collection: String,
    properties: BTreeMap<String, Type>,
}

impl RawSchema {
    /// Starts a schema for the raw class `name`; the collection prefix
    /// defaults to the name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection: name.clone(),
            name,
            properties: BTreeMap::new(),
        }
    }

    /// Overrides the key-prefix blobs of this class are stored under.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Declares a typed metadata attribute.
    pub fn property(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.properties.insert(name.into(), ty);
        self
    }

    /// The class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The descriptor of the metadata attribute `name`.
    pub fn property_type(&self, name: &str) -> Option<&Type> {
        self.properties.get(name)
    }

    fn data_key(&self, oid: &str) -> String {
        format!("{}/{}.data", self.collection, oid)
    }

    fn meta_key(&self, oid: &str) -> String {
        format!("{}/{}.meta", self.collection, oid)
    }

    fn key_prefix(&self) -> String {
        format!("{}/", self.collection)
    }

    fn check(&self) -> Result<()> {
        for name in self.properties.keys() {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(Error::ReservedProperty { name: name.clone() });
            }
        }
        Ok(())
    }
}

// The persisted shape of `collection/oid.meta`.
#[derive(Debug, Serialize, Deserialize)]
struct MetaRecord {
    #[serde(rename = "type")]
    class: String,
    oid: String,
    #[serde(default)]
    meta: BTreeMap<String, Value>,
}

/// A store of binary blobs with structured metadata.
///
/// Cloning is cheap and shares all state.
pub struct RawStore {
    shared: Arc<RawShared>,
}

struct RawShared {
    backend: Box<dyn Backend>,
    inner: Mutex<RawInner>,
}

#[derive(Default)]
struct RawInner {
    schemas: BTreeMap<String, Arc<RawSchema>>,
    caches: HashMap<String, WeakCache<RawCore>>,
}

impl RawInner {
    fn cache_mut(&mut self, class: &str) -> &mut WeakCache<RawCore> {
        self.caches.entry(class.to_owned()).or_default()
    }
}

impl Clone for RawStore {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl fmt::Debug for RawStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawStore").finish_non_exhaustive()
    }
}

impl RawStore {
    /// Creates a raw store over `backend`.
    pub fn new(backend: impl Backend) -> Self {
        Self {
            shared: Arc::new(RawShared {
                backend: Box::new(backend),
                inner: Mutex::new(RawInner::default()),
            }),
        }
    }

    /// Registers `schema` and returns the bound class handle.
    pub fn register(&self, schema: RawSchema) -> Result<RawClass> {
        schema.check()?;
        let mut inner = self.shared.inner.lock();
        if inner.schemas.contains_key(schema.name()) {
            return Err(Error::AlreadyExists {
                key: schema.name().to_owned(),
            });
        }
        let schema = Arc::new(schema);
        inner.schemas.insert(schema.name().to_owned(), schema.clone());
        Ok(RawClass {
            schema,
            store: self.clone(),
        })
    }

    /// The handle of a previously registered raw class.
    pub fn class(&self, name: &str) -> Result<RawClass> {
        let schema = self
            .shared
            .inner
            .lock()
            .schemas
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotRegistered {
                class: name.to_owned(),
            })?;
        Ok(RawClass {
            schema,
            store: self.clone(),
        })
    }

    /// Flushes the backend's durable state.
    pub fn sync(&self) -> Result<()> {
        let _inner = self.shared.inner.lock();
        self.shared.backend.sync()
    }

    /// The capability flags of the underlying backend.
    pub fn capabilities(&self) -> Capabilities {
        self.shared.backend.capabilities()
    }
}

/// A raw schema bound to a store.
#[derive(Clone)]
pub struct RawClass {
    schema: Arc<RawSchema>,
    store: RawStore,
}

impl fmt::Debug for RawClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawClass")
            .field("name", &self.schema.name())
            .finish()
    }
}

impl RawClass {
    /// The class name.
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// Creates a fresh, unsaved raw object with empty data.
    pub fn create(&self) -> RawObject {
        RawObject {
            core: Arc::new(RawCore {
                schema: self.schema.clone(),
                store: self.store.clone(),
                state: Mutex::new(RawState {
                    oid: None,
                    meta: BTreeMap::new(),
                    data: None,
                    data_dirty: false,
                    meta_dirty: true,
                    loaded: false,
                }),
            }),
        }
    }

    /// Fetches the raw object `oid`. Metadata is loaded eagerly, the blob
    /// itself stays on the backend until it is read.
    pub fn get(&self, oid: &str) -> Result<RawObject> {
        let mut inner = self.store.shared.inner.lock();
        if let Some(core) = inner.cache_mut(self.schema.name()).get(oid) {
            return Ok(RawObject { core });
        }
        let key = self.schema.meta_key(oid);
        let bytes = self
            .store
            .shared
            .backend
            .get(&key)?
            .ok_or_else(|| Error::not_found(self.schema.name(), oid))?;
        let record: MetaRecord =
            serde_json::from_slice(&bytes).map_err(|e| Error::backend(&key, e))?;
        let core = Arc::new(RawCore {
            schema: self.schema.clone(),
            store: self.store.clone(),
            state: Mutex::new(RawState {
                oid: Some(oid.to_owned()),
                meta: record.meta,
                data: None,
                data_dirty: false,
                meta_dirty: false,
                loaded: true,
            }),
        });
        inner.cache_mut(self.schema.name()).insert(oid, &core);
        Ok(RawObject { core })
    }

    /// Whether a blob `oid` is persisted.
    pub fn has(&self, oid: &str) -> Result<bool> {
        let _inner = self.store.shared.inner.lock();
        self.store.shared.backend.has(&self.schema.meta_key(oid))
    }

    /// Lazily iterates every persisted raw object, ordered by OID.
    pub fn all(&self) -> Result<RawIter> {
        Ok(RawIter {
            class: self.clone(),
            oids: self.oids()?.into_iter(),
        })
    }

    /// Number of persisted raw objects.
    pub fn count(&self) -> Result<usize> {
        Ok(self.oids()?.len())
    }

    fn oids(&self) -> Result<Vec<String>> {
        let prefix = self.schema.key_prefix();
        let _inner = self.store.shared.inner.lock();
        let keys = self.store.shared.backend.keys(&prefix)?;
        Ok(keys
            .into_iter()
            .filter_map(|key| {
                key[prefix.len()..]
                    .strip_suffix(".meta")
                    .map(str::to_owned)
            })
            .collect())
    }
}

/// Lazy iterator over the raw objects of one class.
#[derive(Debug)]
pub struct RawIter {
    class: RawClass,
    oids: vec::IntoIter<String>,
}

impl Iterator for RawIter {
    type Item = Result<RawObject>;

    fn next(&mut self) -> Option<Self::Item> {
        let oid = self.oids.next()?;
        Some(self.class.get(&oid))
    }
}

struct RawCore {
    schema: Arc<RawSchema>,
    store: RawStore,
    state: Mutex<RawState>,
}

struct RawState {
    oid: Option<String>,
    meta: BTreeMap<String, Value>,
    // `None` means the blob was not touched since load; `save` then leaves
    // the data record alone.
    data: Option<Vec<u8>>,
    data_dirty: bool,
    meta_dirty: bool,
    loaded: bool,
}

/// A live raw object: shared handle onto the single in-memory instance for
/// its `(class, oid)`.
#[derive(Clone)]
pub struct RawObject {
    core: Arc<RawCore>,
}

impl fmt::Debug for RawObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("RawObject")
            .field("class", &self.core.schema.name())
            .field("oid", &state.oid)
            .finish()
    }
}

impl RawObject {
    /// The class name.
    pub fn class_name(&self) -> &str {
        self.core.schema.name()
    }

    /// The object identifier, if one was assigned yet.
    pub fn oid(&self) -> Option<String> {
        self.core.state.lock().oid.clone()
    }

    /// Whether two handles point at the same live instance.
    pub fn ptr_eq(&self, other: &RawObject) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// Reads the metadata attribute `name` (`Null` when unset).
    pub fn meta(&self, name: &str) -> Value {
        self.core
            .state
            .lock()
            .meta
            .get(name)
            .cloned()
            .unwrap_or(Value::Null)
    }

    /// The full metadata map.
    pub fn meta_all(&self) -> BTreeMap<String, Value> {
        self.core.state.lock().meta.clone()
    }

    /// Writes the metadata attribute `name` and marks the object dirty.
    /// Declared attributes are validated against their descriptor;
    /// undeclared ones must hold a primitive tree.
    pub fn set_meta(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if RESERVED_NAMES.contains(&name) {
            return Err(Error::ReservedProperty {
                name: name.to_owned(),
            });
        }
        let canonical = match self.core.schema.property_type(name) {
            Some(ty) => ty.validate(&value, name, &ExactClasses)?,
            None => Type::Any.validate(&value, name, &ExactClasses)?,
        };
        let mut state = self.core.state.lock();
        if canonical.is_null() {
            state.meta.remove(name);
        } else {
            state.meta.insert(name.to_owned(), canonical);
        }
        state.meta_dirty = true;
        Ok(())
    }

    /// Bulk metadata write; either every field validates or nothing is
    /// mutated.
    pub fn set_meta_many(
        &self,
        fields: impl IntoIterator<Item = (String, Value)>,
    ) -> Result<()> {
        let mut validated = Vec::new();
        for (name, value) in fields {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(Error::ReservedProperty { name });
            }
            let canonical = match self.core.schema.property_type(&name) {
                Some(ty) => ty.validate(&value, &name, &ExactClasses)?,
                None => Type::Any.validate(&value, &name, &ExactClasses)?,
            };
            validated.push((name, canonical));
        }
        let mut state = self.core.state.lock();
        for (name, value) in validated {
            if value.is_null() {
                state.meta.remove(&name);
            } else {
                state.meta.insert(name, value);
            }
        }
        state.meta_dirty = true;
        Ok(())
    }

    /// Replaces the blob contents.
    pub fn set_data(&self, data: impl Into<Vec<u8>>) {
        let mut state = self.core.state.lock();
        state.data = Some(data.into());
        state.data_dirty = true;
    }

    /// Reads the blob in buffers of at most `chunk_size` bytes without
    /// materializing it when the backend can stream from a file. An empty
    /// blob yields zero chunks.
    pub fn data(&self, chunk_size: usize) -> Result<DataChunks> {
        if chunk_size == 0 {
            return Err(Error::invalid_value("chunk_size", "must be positive"));
        }
        {
            let state = self.core.state.lock();
            if let Some(data) = &state.data {
                return Ok(DataChunks::memory(data.clone(), chunk_size));
            }
        }
        let oid = self.saved_oid()?;
        let key = self.core.schema.data_key(&oid);
        let _inner = self.core.store.shared.inner.lock();
        let backend = &self.core.store.shared.backend;
        if backend.capabilities().contains(Capabilities::FILESYSTEM) {
            if let Some(path) = backend.data_path(&key) {
                let file = File::open(&path)
                    .map_err(|e| Error::backend(&key, e))?;
                return Ok(DataChunks::file(file, chunk_size, key));
            }
        }
        let data = backend
            .get(&key)?
            .ok_or_else(|| Error::not_found(self.class_name(), &oid))?;
        Ok(DataChunks::memory(data, chunk_size))
    }

    /// Materializes the whole blob. Intended for small payloads; large ones
    /// should go through [`data`].
    ///
    /// [`data`]: #method.data
    pub fn load_data(&self) -> Result<Vec<u8>> {
        {
            let state = self.core.state.lock();
            if let Some(data) = &state.data {
                return Ok(data.clone());
            }
        }
        let oid = self.saved_oid()?;
        let key = self.core.schema.data_key(&oid);
        let data = {
            let _inner = self.core.store.shared.inner.lock();
            self.core
                .store
                .shared
                .backend
                .get(&key)?
                .ok_or_else(|| Error::not_found(self.class_name(), &oid))?
        };
        let mut state = self.core.state.lock();
        if state.data.is_none() {
            state.data = Some(data.clone());
        }
        Ok(data)
    }

    /// The filesystem path of the blob, when the backend publishes the
    /// `FILESYSTEM` capability.
    pub fn path(&self) -> Result<PathBuf> {
        let backend = &self.core.store.shared.backend;
        if !backend.capabilities().contains(Capabilities::FILESYSTEM) {
            return Err(Error::Unsupported {
                operation: "path".to_owned(),
            });
        }
        let oid = self.saved_oid()?;
        backend
            .data_path(&self.core.schema.data_key(&oid))
            .ok_or_else(|| Error::Unsupported {
                operation: "path".to_owned(),
            })
    }

    /// Persists both sibling records. The data record is rewritten only
    /// when the blob was touched since load (or does not exist yet).
    pub fn save(&self) -> Result<()> {
        let store = self.core.store.clone();
        let mut inner = store.shared.inner.lock();
        let mut state = self.core.state.lock();
        if state.loaded && !state.meta_dirty && !state.data_dirty {
            return Ok(());
        }
        if state.oid.is_none() {
            state.oid = Some(generate_oid());
        }
        let oid = state.oid.clone().expect("oid was just assigned");
        let meta_key = self.core.schema.meta_key(&oid);
        let data_key = self.core.schema.data_key(&oid);

        let record = MetaRecord {
            class: self.class_name().to_owned(),
            oid: oid.clone(),
            meta: state.meta.clone(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| Error::backend(&meta_key, e))?;
        store.shared.backend.update(&meta_key, &bytes)?;

        // The two records exist together: the first save materializes an
        // empty data record even when no data was assigned.
        if state.data_dirty || !store.shared.backend.has(&data_key)? {
            let empty = Vec::new();
            let data = state.data.as_ref().unwrap_or(&empty);
            store.shared.backend.update(&data_key, data)?;
        }

        inner.cache_mut(self.class_name()).insert(&oid, &self.core);
        debug!("saved {}", meta_key);
        state.data_dirty = false;
        state.meta_dirty = false;
        state.loaded = true;
        Ok(())
    }

    /// Deletes both sibling records and invalidates the cache entry.
    pub fn remove(&self) -> Result<()> {
        let store = self.core.store.clone();
        let mut inner = store.shared.inner.lock();
        let mut state = self.core.state.lock();
        let oid = match &state.oid {
            Some(oid) => oid.clone(),
            None => return Ok(()),
        };
        store.shared.backend.remove(&self.core.schema.data_key(&oid))?;
        store.shared.backend.remove(&self.core.schema.meta_key(&oid))?;
        inner.cache_mut(self.class_name()).remove(&oid);
        state.loaded = false;
        state.meta_dirty = false;
        state.data_dirty = false;
        Ok(())
    }

    fn saved_oid(&self) -> Result<String> {
        self.core
            .state
            .lock()
            .oid
            .clone()
            .ok_or_else(|| Error::invalid_value("oid", "raw object has never been saved"))
    }
}

/// Finite sequence of byte buffers produced by [`RawObject::data`].
pub struct DataChunks {
    source: ChunkSource,
    chunk_size: usize,
}

enum ChunkSource {
    Memory { data: Vec<u8>, pos: usize },
    File { file: File, key: String, done: bool },
}

impl DataChunks {
    fn memory(data: Vec<u8>, chunk_size: usize) -> Self {
        Self {
            source: ChunkSource::Memory { data, pos: 0 },
            chunk_size,
        }
    }

    fn file(file: File, chunk_size: usize, key: String) -> Self {
        Self {
            source: ChunkSource::File {
                file,
                key,
                done: false,
            },
            chunk_size,
        }
    }
}

impl fmt::Debug for DataChunks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataChunks")
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl Iterator for DataChunks {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.source {
            ChunkSource::Memory { data, pos } => {
                if *pos >= data.len() {
                    return None;
                }
                let end = (*pos + self.chunk_size).min(data.len());
                let chunk = data[*pos..end].to_vec();
                *pos = end;
                Some(Ok(chunk))
            }
            ChunkSource::File { file, key, done } => {
                if *done {
                    return None;
                }
                let mut chunk = vec![0_u8; self.chunk_size];
                let mut filled = 0;
                while filled < chunk.len() {
                    match file.read(&mut chunk[filled..]) {
                        Ok(0) => break,
                        Ok(n) => filled += n,
                        Err(e) => {
                            *done = true;
                            return Some(Err(Error::backend(key.clone(), e)));
                        }
                    }
                }
                if filled == 0 {
                    *done = true;
                    return None;
                }
                chunk.truncate(filled);
                if filled < self.chunk_size {
                    *done = true;
                }
                Some(Ok(chunk))
            }
        }
    }
}
