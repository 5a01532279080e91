//! The structured object store.
//!
//! An [`ObjectStore`] hosts classes described by [`ClassSchema`]s over one
//! backend. Objects are dynamic: a typed attribute map governed by the
//! class schema, with every mutation going through validate → stamp
//! `updates` → mark dirty. The store keeps one live instance per
//! `(class, oid)` while anyone holds a strong reference, resolves relation
//! stubs on demand, and feeds an attached [`IndexManager`] with old/new
//! record pairs on every save.
//!
//! [`IndexManager`]: ../indexes/struct.IndexManager.html

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::vec;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    backend::{Backend, Capabilities},
    cache::WeakCache,
    clock::{self, Timestamp},
    indexes::{IndexManager, IndexShared},
    record::{ObjectRecord, ObjectStub, RelationValue},
    schema::{ClassSchema, RelationKind, SchemaSet, RESERVED_NAMES},
    types::Value,
    Error, Result,
};

/// Returns a fresh OID: 32 printable hex characters, no separators.
pub(crate) fn generate_oid() -> String {
    Uuid::new_v4().to_simple().to_string()
}

/// A store of structured, schema-validated objects over one backend.
///
/// Cloning is cheap and shares all state.
pub struct ObjectStore {
    shared: Arc<StoreShared>,
}

struct StoreShared {
    backend: Box<dyn Backend>,
    inner: Mutex<StoreInner>,
    indexes: Mutex<Weak<IndexShared>>,
}

#[derive(Default)]
struct StoreInner {
    schemas: SchemaSet,
    caches: HashMap<String, WeakCache<ObjectCore>>,
    scope_depth: u32,
    scoped: Vec<Weak<ObjectCore>>,
}

impl StoreInner {
    fn cache_mut(&mut self, class: &str) -> &mut WeakCache<ObjectCore> {
        self.caches.entry(class.to_owned()).or_default()
    }
}

impl Clone for ObjectStore {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore").finish_non_exhaustive()
    }
}

impl ObjectStore {
    /// Creates a store over `backend`.
    pub fn new(backend: impl Backend) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                backend: Box::new(backend),
                inner: Mutex::new(StoreInner::default()),
                indexes: Mutex::new(Weak::new()),
            }),
        }
    }

    /// Registers `schema` and returns the bound class handle.
    pub fn register(&self, schema: ClassSchema) -> Result<Class> {
        let schema = self.shared.inner.lock().schemas.insert(schema)?;
        Ok(Class {
            schema,
            store: self.clone(),
        })
    }

    /// The handle of a previously registered class.
    pub fn class(&self, name: &str) -> Result<Class> {
        let schema = self
            .shared
            .inner
            .lock()
            .schemas
            .get(name)
            .ok_or_else(|| Error::NotRegistered {
                class: name.to_owned(),
            })?;
        Ok(Class {
            schema,
            store: self.clone(),
        })
    }

    /// All registered class handles.
    pub fn classes(&self) -> Vec<Class> {
        let inner = self.shared.inner.lock();
        inner
            .schemas
            .iter()
            .map(|schema| Class {
                schema: schema.clone(),
                store: self.clone(),
            })
            .collect()
    }

    /// Opens a scoped save block: objects marked dirty while at least one
    /// scope is open are flushed when the scope commits (or drops).
    pub fn scope(&self) -> Scope {
        self.shared.inner.lock().scope_depth += 1;
        Scope {
            store: self.clone(),
            done: false,
        }
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

    pub(crate) fn attach_indexes(&self, manager: &IndexManager) {
        *self.shared.indexes.lock() = Arc::downgrade(manager.shared());
    }

    pub(crate) fn indexes(&self) -> Option<IndexManager> {
        self.shared
            .indexes
            .lock()
            .upgrade()
            .map(IndexManager::from_shared)
    }

    // Whether `actual` may stand where `declared` is expected.
    pub(crate) fn class_matches(&self, actual: &str, declared: &str) -> bool {
        use crate::types::ClassLookup;
        self.shared.inner.lock().schemas.is_subclass(actual, declared)
    }

    fn enlist(&self, core: &Arc<ObjectCore>) {
        let mut inner = self.shared.inner.lock();
        if inner.scope_depth == 0 {
            return;
        }
        let weak = Arc::downgrade(core);
        if !inner.scoped.iter().any(|seen| seen.ptr_eq(&weak)) {
            inner.scoped.push(weak);
        }
    }
}

/// RAII guard for a scoped save block.
///
/// Every object marked dirty while the scope is open is saved exactly once
/// when the scope ends. [`commit`] reports the first failing save (the error
/// names the offending key); objects saved before the failure stay saved.
/// Dropping without committing flushes best-effort and logs failures.
///
/// [`commit`]: #method.commit
#[must_use = "a scope only saves when it commits or drops"]
pub struct Scope {
    store: ObjectStore,
    done: bool,
}

impl Scope {
    /// Ends the scope, saving every dirty object captured within.
    pub fn commit(mut self) -> Result<()> {
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let pending = {
            let mut inner = self.store.shared.inner.lock();
            inner.scope_depth -= 1;
            std::mem::take(&mut inner.scoped)
        };
        for weak in pending {
            if let Some(core) = weak.upgrade() {
                Object { core }.save()?;
            }
        }
        Ok(())
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if !self.done {
            if let Err(e) = self.flush() {
                warn!("scoped save failed: {}", e);
            }
        }
    }
}

impl fmt::Debug for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scope").field("done", &self.done).finish()
    }
}

/// A schema bound to a store: the entry point for creating and finding
/// objects of one class.
#[derive(Clone)]
pub struct Class {
    schema: Arc<ClassSchema>,
    store: ObjectStore,
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class").field("name", &self.schema.name()).finish()
    }
}

impl Class {
    /// The class name.
    pub fn name(&self) -> &str {
        self.schema.name()
    }

    /// The registered schema.
    pub fn schema(&self) -> &ClassSchema {
        &self.schema
    }

    /// The store this class is bound to.
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    /// Creates a fresh, unsaved object. The OID is assigned at first save.
    pub fn create(&self) -> Object {
        let core = Arc::new(ObjectCore::fresh(self.schema.clone(), self.store.clone(), None));
        self.store.enlist(&core);
        Object { core }
    }

    /// Fetches the object `oid`, from the identity cache or the backend.
    pub fn get(&self, oid: &str) -> Result<Object> {
        let shared = &self.store.shared;
        let mut inner = shared.inner.lock();
        if let Some(core) = inner.cache_mut(self.schema.name()).get(oid) {
            return Ok(Object { core });
        }
        let key = self.schema.object_key(oid);
        let bytes = shared
            .backend
            .get(&key)?
            .ok_or_else(|| Error::not_found(self.schema.name(), oid))?;
        let record = ObjectRecord::from_bytes(&key, &bytes)?;
        let core = Arc::new(ObjectCore::from_record(
            self.schema.clone(),
            self.store.clone(),
            record,
        ));
        inner.cache_mut(self.schema.name()).insert(oid, &core);
        Ok(Object { core })
    }

    /// Whether an object `oid` is persisted.
    pub fn has(&self, oid: &str) -> Result<bool> {
        let _inner = self.store.shared.inner.lock();
        self.store.shared.backend.has(&self.schema.object_key(oid))
    }

    /// Returns the live or persisted object `oid`, creating an unsaved one
    /// if it does not exist yet.
    pub fn ensure(&self, oid: &str) -> Result<Object> {
        match self.get(oid) {
            Ok(object) => Ok(object),
            Err(Error::NotFound { .. }) => {
                let mut inner = self.store.shared.inner.lock();
                // Racing ensure() calls must agree on the instance.
                if let Some(core) = inner.cache_mut(self.schema.name()).get(oid) {
                    return Ok(Object { core });
                }
                let core = Arc::new(ObjectCore::fresh(
                    self.schema.clone(),
                    self.store.clone(),
                    Some(oid.to_owned()),
                ));
                inner.cache_mut(self.schema.name()).insert(oid, &core);
                drop(inner);
                self.store.enlist(&core);
                Ok(Object { core })
            }
            Err(e) => Err(e),
        }
    }

    /// Lazily iterates every persisted object of this class, ordered by OID.
    pub fn all(&self) -> Result<ObjectIter> {
        Ok(ObjectIter {
            class: self.clone(),
            oids: self.oids()?.into_iter(),
        })
    }

    /// A page of objects in stable OID order. `start` and `end` slice the
    /// ordered OID sequence; `count` caps the page length.
    pub fn list(
        &self,
        count: Option<usize>,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<Vec<Object>> {
        let oids = self.oids()?;
        let start = start.unwrap_or(0).min(oids.len());
        let end = end.unwrap_or(oids.len()).min(oids.len()).max(start);
        oids[start..end]
            .iter()
            .take(count.unwrap_or(usize::max_value()))
            .map(|oid| self.get(oid))
            .collect()
    }

    /// Number of persisted objects of this class.
    pub fn count(&self) -> Result<usize> {
        Ok(self.oids()?.len())
    }

    /// All persisted OIDs of this class, in key order.
    pub fn oids(&self) -> Result<Vec<String>> {
        let prefix = self.schema.key_prefix();
        let _inner = self.store.shared.inner.lock();
        let keys = self.store.shared.backend.keys(&prefix)?;
        Ok(keys
            .into_iter()
            .filter_map(|key| key[prefix.len()..].splitn(2, '/').next().map(str::to_owned))
            .collect())
    }

    /// Builds an object from a depth-1 export: `{type?, oid?, properties?,
    /// relations?}`. The result is validated and dirty, but not saved.
    pub fn import(&self, value: &Value) -> Result<Object> {
        let entries = match value {
            Value::Map(entries) => entries,
            other => {
                return Err(Error::invalid_value(
                    "<import>",
                    format!("expected a map, got {}", other.kind()),
                ))
            }
        };
        if let Some(declared) = entries.get("type") {
            if declared.as_str() != Some(self.schema.name()) {
                return Err(Error::invalid_value(
                    "type",
                    format!("record is not a `{}`", self.schema.name()),
                ));
            }
        }

        let mut properties = Vec::new();
        if let Some(Value::Map(props)) = entries.get("properties") {
            for (name, raw) in props {
                let ty = self.schema.property_type(name).ok_or_else(|| {
                    Error::UnknownProperty {
                        class: self.schema.name().to_owned(),
                        name: name.clone(),
                    }
                })?;
                let decoded = ty.deserialize(raw)?;
                properties.push((name.clone(), decoded));
            }
        }
        let mut relations = Vec::new();
        if let Some(Value::Map(rels)) = entries.get("relations") {
            for (name, raw) in rels {
                relations.push((name.clone(), raw.clone()));
            }
        }

        let object = match entries.get("oid").and_then(Value::as_str) {
            Some(oid) => self.materialize(oid),
            None => self.create(),
        };
        for (name, value) in properties {
            object.set(&name, value)?;
        }
        for (name, value) in relations {
            object.set(&name, value)?;
        }
        Ok(object)
    }

    // The live instance for `oid`, or a fresh unloaded one; never touches
    // the backend.
    fn materialize(&self, oid: &str) -> Object {
        let mut inner = self.store.shared.inner.lock();
        if let Some(core) = inner.cache_mut(self.schema.name()).get(oid) {
            return Object { core };
        }
        let core = Arc::new(ObjectCore::fresh(
            self.schema.clone(),
            self.store.clone(),
            Some(oid.to_owned()),
        ));
        inner.cache_mut(self.schema.name()).insert(oid, &core);
        Object { core }
    }
}

/// Lazy iterator over the objects of one class.
///
/// The OID listing is taken up front; each object is fetched on the pull
/// that yields it, so a record failing to load surfaces as the error of its
/// own pull and earlier items remain valid.
#[derive(Debug)]
pub struct ObjectIter {
    class: Class,
    oids: vec::IntoIter<String>,
}

impl Iterator for ObjectIter {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        let oid = self.oids.next()?;
        Some(self.class.get(&oid))
    }
}

pub(crate) struct ObjectCore {
    schema: Arc<ClassSchema>,
    store: ObjectStore,
    state: Mutex<ObjectState>,
}

struct ObjectState {
    oid: Option<String>,
    properties: BTreeMap<String, Value>,
    relations: BTreeMap<String, Vec<ObjectStub>>,
    updates: BTreeMap<String, Timestamp>,
    dirty: bool,
    loaded: bool,
    last_saved: Option<ObjectRecord>,
}

impl ObjectCore {
    fn fresh(schema: Arc<ClassSchema>, store: ObjectStore, oid: Option<String>) -> Self {
        let mut updates = BTreeMap::new();
        // Creation stamp; overwritten by every save.
        updates.insert("oid".to_owned(), clock::next());
        Self {
            schema,
            store,
            state: Mutex::new(ObjectState {
                oid,
                properties: BTreeMap::new(),
                relations: BTreeMap::new(),
                updates,
                dirty: true,
                loaded: false,
                last_saved: None,
            }),
        }
    }

    fn from_record(schema: Arc<ClassSchema>, store: ObjectStore, record: ObjectRecord) -> Self {
        let mut properties = BTreeMap::new();
        for (name, primitive) in &record.properties {
            match schema.property_type(name) {
                Some(ty) => match ty.deserialize(primitive) {
                    Ok(value) => {
                        properties.insert(name.clone(), value);
                    }
                    Err(e) => {
                        warn!("dropping undecodable property `{}.{}`: {}", record.class, name, e);
                    }
                },
                // Schemas evolve; keep values the current schema no longer
                // declares so a later save does not lose them.
                None => {
                    properties.insert(name.clone(), primitive.clone());
                }
            }
        }
        let mut relations = BTreeMap::new();
        for (name, value) in &record.relations {
            let stubs = match value {
                RelationValue::One(None) => Vec::new(),
                RelationValue::One(Some(stub)) => vec![stub.clone()],
                RelationValue::Many(stubs) => stubs.clone(),
            };
            relations.insert(name.clone(), stubs);
        }
        Self {
            schema,
            store,
            state: Mutex::new(ObjectState {
                oid: Some(record.oid.clone()),
                properties,
                relations,
                updates: record.updates.clone(),
                dirty: false,
                loaded: true,
                last_saved: Some(record),
            }),
        }
    }
}

/// A live structured object: a shared handle onto the single in-memory
/// instance for its `(class, oid)`.
#[derive(Clone)]
pub struct Object {
    pub(crate) core: Arc<ObjectCore>,
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.state.lock();
        f.debug_struct("Object")
            .field("class", &self.core.schema.name())
            .field("oid", &state.oid)
            .field("dirty", &state.dirty)
            .finish()
    }
}

impl Object {
    /// The class name.
    pub fn class_name(&self) -> &str {
        self.core.schema.name()
    }

    /// The object identifier, if one was assigned yet.
    pub fn oid(&self) -> Option<String> {
        self.core.state.lock().oid.clone()
    }

    /// Whether the object carries unsaved mutations.
    pub fn is_dirty(&self) -> bool {
        self.core.state.lock().dirty
    }

    /// Whether the object was loaded from (or saved to) the backend.
    pub fn is_loaded(&self) -> bool {
        self.core.state.lock().loaded
    }

    /// The modification stamp of `attr`; `updated("oid")` is the time of
    /// the most recent save (or of creation, before the first save).
    pub fn updated(&self, attr: &str) -> Option<Timestamp> {
        self.core.state.lock().updates.get(attr).copied()
    }

    /// Whether two handles point at the same live instance.
    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    /// The current value of the property `name` (`Null` when unset).
    pub fn get(&self, name: &str) -> Result<Value> {
        if self.core.schema.property_type(name).is_none() {
            return Err(Error::UnknownProperty {
                class: self.class_name().to_owned(),
                name: name.to_owned(),
            });
        }
        let state = self.core.state.lock();
        Ok(state.properties.get(name).cloned().unwrap_or(Value::Null))
    }

    /// Assigns the property (or relation) `name`.
    ///
    /// The value is validated and canonicalized; on success the attribute
    /// stamp is updated and the object becomes dirty. Assigning `Null` to a
    /// property unsets it. A declared relation accepts `Null`, a
    /// `{type, oid}` stub, or a list of stubs.
    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        let assignment = self.check_assignment(name, value)?;
        self.apply(vec![assignment]);
        Ok(())
    }

    /// Applies several assignments; either all of them validate or nothing
    /// is mutated.
    pub fn update(&self, values: impl IntoIterator<Item = (String, Value)>) -> Result<()> {
        let mut assignments = Vec::new();
        for (name, value) in values {
            assignments.push(self.check_assignment(&name, value)?);
        }
        self.apply(assignments);
        Ok(())
    }

    /// Handle onto the declared relation `name`.
    pub fn relation(&self, name: &str) -> Result<Relation> {
        let kind = self
            .core
            .schema
            .relation(name)
            .ok_or_else(|| Error::UnknownProperty {
                class: self.class_name().to_owned(),
                name: name.to_owned(),
            })?
            .clone();
        Ok(Relation {
            core: self.core.clone(),
            name: name.to_owned(),
            kind,
        })
    }

    fn check_assignment(&self, name: &str, value: Value) -> Result<Assignment> {
        if RESERVED_NAMES.contains(&name) {
            return Err(Error::ReservedProperty {
                name: name.to_owned(),
            });
        }
        if let Some(kind) = self.core.schema.relation(name) {
            let stubs = parse_relation_value(&self.core.store, name, kind, &value)?;
            return Ok(Assignment::Relation(name.to_owned(), stubs));
        }
        let ty = self
            .core
            .schema
            .property_type(name)
            .ok_or_else(|| Error::UnknownProperty {
                class: self.class_name().to_owned(),
                name: name.to_owned(),
            })?;
        if value.is_null() {
            return Ok(Assignment::Unset(name.to_owned()));
        }
        let canonical = {
            let inner = self.core.store.shared.inner.lock();
            ty.validate(&value, name, &inner.schemas)?
        };
        Ok(Assignment::Property(name.to_owned(), canonical))
    }

    fn apply(&self, assignments: Vec<Assignment>) {
        {
            let mut state = self.core.state.lock();
            for assignment in assignments {
                let name = match assignment {
                    Assignment::Property(name, value) => {
                        state.properties.insert(name.clone(), value);
                        name
                    }
                    Assignment::Unset(name) => {
                        state.properties.remove(&name);
                        name
                    }
                    Assignment::Relation(name, stubs) => {
                        state.relations.insert(name.clone(), stubs);
                        name
                    }
                };
                state.updates.insert(name, clock::next());
                state.dirty = true;
            }
        }
        self.core.store.enlist(&self.core);
    }

    /// Persists the object. Clean, already-saved objects are a no-op; the
    /// first save assigns an OID when none was set.
    pub fn save(&self) -> Result<()> {
        let store = self.core.store.clone();
        let mut inner = store.shared.inner.lock();
        let mut state = self.core.state.lock();
        if !state.dirty && state.last_saved.is_some() {
            return Ok(());
        }
        if state.oid.is_none() {
            state.oid = Some(generate_oid());
        }
        let oid = state.oid.clone().expect("oid was just assigned");
        state.updates.insert("oid".to_owned(), clock::next());
        let record = build_record(&self.core.schema, &state, &oid)?;
        let key = self.core.schema.object_key(&oid);
        store.shared.backend.update(&key, &record.to_bytes(&key)?)?;
        inner.cache_mut(self.core.schema.name()).insert(&oid, &self.core);
        if let Some(indexes) = store.indexes() {
            // A failed index patch leaves the object dirty with the previous
            // record, so a retry recomputes the same diff.
            indexes.object_saved(&self.core.schema, &oid, state.last_saved.as_ref(), &record)?;
        }
        debug!("saved {}", key);
        state.dirty = false;
        state.loaded = true;
        state.last_saved = Some(record);
        Ok(())
    }

    /// Deletes the backend record, drops every index entry pointing at this
    /// object and invalidates the cache entry. Relation stubs elsewhere are
    /// left alone and may dangle.
    pub fn remove(&self) -> Result<()> {
        let store = self.core.store.clone();
        let mut inner = store.shared.inner.lock();
        let mut state = self.core.state.lock();
        let oid = match &state.oid {
            Some(oid) => oid.clone(),
            None => return Ok(()),
        };
        let key = self.core.schema.object_key(&oid);
        store.shared.backend.remove(&key)?;
        if let Some(indexes) = store.indexes() {
            indexes.object_removed(&self.core.schema, &oid, state.last_saved.as_ref())?;
        }
        inner.cache_mut(self.core.schema.name()).remove(&oid);
        debug!("removed {}", key);
        state.last_saved = None;
        state.dirty = false;
        Ok(())
    }

    // The record this object would persist right now.
    pub(crate) fn current_record(&self) -> Result<ObjectRecord> {
        let state = self.core.state.lock();
        let oid = state
            .oid
            .clone()
            .ok_or_else(|| Error::invalid_value("oid", "object has never been saved"))?;
        build_record(&self.core.schema, &state, &oid)
    }

    /// Exports the object as a primitive tree.
    ///
    /// Depth 0 is the `{oid, type}` stub; depth 1 adds serialized properties
    /// and relation stubs; depth 2 replaces relation stubs by their own
    /// depth-1 exports. Cycles (and dangling stubs) degrade to stubs, so
    /// each OID is visited at most once.
    pub fn export(&self, depth: usize) -> Result<Value> {
        let mut visited = HashSet::new();
        self.export_with(depth, &mut visited)
    }

    fn export_with(
        &self,
        depth: usize,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<Value> {
        let (oid, properties, relations) = {
            let state = self.core.state.lock();
            (
                state.oid.clone().unwrap_or_default(),
                state.properties.clone(),
                state.relations.clone(),
            )
        };
        let mut out = BTreeMap::new();
        out.insert(
            "type".to_owned(),
            Value::String(self.class_name().to_owned()),
        );
        out.insert("oid".to_owned(), Value::String(oid.clone()));
        if depth == 0 {
            return Ok(Value::Map(out));
        }
        visited.insert((self.class_name().to_owned(), oid));

        let mut props = BTreeMap::new();
        for (name, value) in &properties {
            let serialized = match self.core.schema.property_type(name) {
                Some(ty) => ty.serialize(value)?,
                None => value.clone(),
            };
            props.insert(name.clone(), serialized);
        }
        out.insert("properties".to_owned(), Value::Map(props));

        let mut rels = BTreeMap::new();
        for (name, stubs) in &relations {
            let plural = self
                .core
                .schema
                .relation(name)
                .map(RelationKind::is_plural)
                .unwrap_or(true);
            let mut exported = Vec::with_capacity(stubs.len());
            for stub in stubs {
                exported.push(self.export_stub(stub, depth, visited)?);
            }
            let value = if plural {
                Value::List(exported)
            } else {
                exported.into_iter().next().unwrap_or(Value::Null)
            };
            rels.insert(name.clone(), value);
        }
        out.insert("relations".to_owned(), Value::Map(rels));
        Ok(Value::Map(out))
    }

    fn export_stub(
        &self,
        stub: &ObjectStub,
        depth: usize,
        visited: &mut HashSet<(String, String)>,
    ) -> Result<Value> {
        if depth < 2 || visited.contains(&(stub.class.clone(), stub.oid.clone())) {
            return Ok(stub.to_value());
        }
        match self.core.store.class(&stub.class) {
            Ok(class) => match class.get(&stub.oid) {
                Ok(target) => target.export_with(depth - 1, visited),
                Err(Error::NotFound { .. }) => Ok(stub.to_value()),
                Err(e) => Err(e),
            },
            Err(Error::NotRegistered { .. }) => Ok(stub.to_value()),
            Err(e) => Err(e),
        }
    }
}

enum Assignment {
    Property(String, Value),
    Unset(String),
    Relation(String, Vec<ObjectStub>),
}

fn parse_relation_value(
    store: &ObjectStore,
    name: &str,
    kind: &RelationKind,
    value: &Value,
) -> Result<Vec<ObjectStub>> {
    let mut stubs = Vec::new();
    let mut push = |raw: &Value| -> Result<()> {
        let stub = ObjectStub::from_value(raw).ok_or_else(|| {
            Error::invalid_value(name, "expected a `{type, oid}` reference")
        })?;
        if !store.class_matches(&stub.class, kind.target()) {
            return Err(Error::RelationTypeMismatch {
                relation: name.to_owned(),
                expected: kind.target().to_owned(),
                actual: stub.class.clone(),
            });
        }
        if !stubs.contains(&stub) {
            stubs.push(stub);
        }
        Ok(())
    };
    match value {
        Value::Null => {}
        Value::List(items) => {
            if !kind.is_plural() {
                return Err(Error::invalid_value(
                    name,
                    "singular relation does not accept a list",
                ));
            }
            for item in items {
                push(item)?;
            }
        }
        other => push(other)?,
    }
    Ok(stubs)
}

fn build_record(
    schema: &ClassSchema,
    state: &ObjectState,
    oid: &str,
) -> Result<ObjectRecord> {
    let mut properties = BTreeMap::new();
    for (name, value) in &state.properties {
        if value.is_null() {
            continue;
        }
        let serialized = match schema.property_type(name) {
            Some(ty) => ty.serialize(value)?,
            None => value.clone(),
        };
        properties.insert(name.clone(), serialized);
    }
    let mut relations = BTreeMap::new();
    for (name, stubs) in &state.relations {
        let plural = schema
            .relation(name)
            .map(RelationKind::is_plural)
            .unwrap_or(true);
        let value = if plural {
            RelationValue::Many(stubs.clone())
        } else {
            RelationValue::One(stubs.first().cloned())
        };
        relations.insert(name.clone(), value);
    }
    Ok(ObjectRecord {
        class: schema.name().to_owned(),
        oid: oid.to_owned(),
        properties,
        relations,
        updates: state.updates.clone(),
    })
}

/// Handle onto one relation attribute of a live object.
///
/// At rest a relation is a list of `(class, oid)` stubs persisted with the
/// owner; resolution goes through the target class's `get`, so a stub whose
/// target was removed resolves to `NotFound`.
pub struct Relation {
    core: Arc<ObjectCore>,
    name: String,
    kind: RelationKind,
}

impl fmt::Debug for Relation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl Relation {
    /// The relation attribute name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the relation holds a sequence.
    pub fn is_plural(&self) -> bool {
        self.kind.is_plural()
    }

    /// The stubs currently held, in insertion order.
    pub fn stubs(&self) -> Vec<ObjectStub> {
        let state = self.core.state.lock();
        state.relations.get(&self.name).cloned().unwrap_or_default()
    }

    /// Number of linked objects.
    pub fn len(&self) -> usize {
        let state = self.core.state.lock();
        state.relations.get(&self.name).map_or(0, Vec::len)
    }

    /// Whether no object is linked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `target` to a plural relation; linking the same object twice
    /// is a no-op.
    pub fn add(&self, target: &Object) -> Result<()> {
        if !self.kind.is_plural() {
            return Err(Error::invalid_value(
                &self.name,
                "singular relation; use `set`",
            ));
        }
        let stub = self.stub_for(target)?;
        self.mutate(|stubs| {
            if !stubs.contains(&stub) {
                stubs.push(stub);
                true
            } else {
                false
            }
        });
        Ok(())
    }

    /// Points a singular relation at `target` (or clears it with `None`).
    pub fn set(&self, target: Option<&Object>) -> Result<()> {
        if self.kind.is_plural() {
            return Err(Error::invalid_value(
                &self.name,
                "plural relation; use `add`",
            ));
        }
        let stub = match target {
            Some(target) => Some(self.stub_for(target)?),
            None => None,
        };
        self.mutate(|stubs| {
            stubs.clear();
            stubs.extend(stub.clone());
            true
        });
        Ok(())
    }

    /// Unlinks `target`; answers whether it was linked.
    pub fn remove(&self, target: &Object) -> Result<bool> {
        let stub = self.stub_for(target)?;
        let mut removed = false;
        self.mutate(|stubs| {
            let before = stubs.len();
            stubs.retain(|s| *s != stub);
            removed = stubs.len() != before;
            removed
        });
        Ok(removed)
    }

    /// Unlinks everything.
    pub fn clear(&self) {
        self.mutate(|stubs| {
            if stubs.is_empty() {
                false
            } else {
                stubs.clear();
                true
            }
        });
    }

    /// Whether `target` is linked.
    pub fn contains(&self, target: &Object) -> bool {
        match (target.oid(), target.class_name()) {
            (Some(oid), class) => self
                .stubs()
                .iter()
                .any(|stub| stub.oid == oid && stub.class == class),
            (None, _) => false,
        }
    }

    /// Resolves a singular relation to its target.
    pub fn get(&self) -> Result<Option<Object>> {
        match self.stubs().first() {
            Some(stub) => {
                let class = self.core.store.class(&stub.class)?;
                class.get(&stub.oid).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Lazily resolves every linked object, in insertion order. A dangling
    /// stub surfaces as the `NotFound` of its own pull.
    pub fn resolve(&self) -> ResolvedIter {
        ResolvedIter {
            store: self.core.store.clone(),
            stubs: self.stubs().into_iter(),
        }
    }

    fn stub_for(&self, target: &Object) -> Result<ObjectStub> {
        let class = target.class_name();
        if !self.core.store.class_matches(class, self.kind.target()) {
            return Err(Error::RelationTypeMismatch {
                relation: self.name.clone(),
                expected: self.kind.target().to_owned(),
                actual: class.to_owned(),
            });
        }
        let oid = target.oid().ok_or_else(|| {
            Error::invalid_value(&self.name, "relation target has never been saved")
        })?;
        Ok(ObjectStub::new(class, oid))
    }

    // Runs `f` over the stub list; when it reports a change, stamps the
    // attribute and marks the owner dirty.
    fn mutate(&self, f: impl FnOnce(&mut Vec<ObjectStub>) -> bool) {
        let mut state = self.core.state.lock();
        let changed = f(state.relations.entry(self.name.clone()).or_default());
        if changed {
            state.updates.insert(self.name.clone(), clock::next());
            state.dirty = true;
        }
        drop(state);
        if changed {
            self.core.store.enlist(&self.core);
        }
    }
}

/// Iterator produced by [`Relation::resolve`].
#[derive(Debug)]
pub struct ResolvedIter {
    store: ObjectStore,
    stubs: vec::IntoIter<ObjectStub>,
}

impl Iterator for ResolvedIter {
    type Item = Result<Object>;

    fn next(&mut self) -> Option<Self::Item> {
        let stub = self.stubs.next()?;
        Some(
            self.store
                .class(&stub.class)
                .and_then(|class| class.get(&stub.oid)),
        )
    }
}
