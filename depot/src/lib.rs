//! An embedded engine for durable, queryable application state over
//! pluggable key-value backends.
//!
//! # Backends
//!
//! A [`Backend`] is a flat namespace of string keys and opaque byte values
//! with lexicographic prefix enumeration. The engine never reaches past this
//! interface; everything below it — durability, layout, caching — is the
//! backend's business. Two backends ship with the crate: [`MemoryBackend`]
//! for scratch state and tests, and [`DirectoryBackend`], which keeps one
//! file per key under a root directory and can hand out filesystem paths.
//!
//! # Objects
//!
//! An [`ObjectStore`] hosts classes of structured objects. A class is
//! described by a [`ClassSchema`]: typed properties, relations to other
//! classes, and the indexes to maintain. Objects are identified by an OID
//! assigned at first save; while anyone holds a strong reference, the store
//! hands out one live instance per `(class, oid)`. Every mutation is
//! validated against the schema, stamps a per-attribute modification time
//! and marks the object dirty; [`ObjectStore::scope`] collects dirty
//! objects and flushes them together.
//!
//! Relations are persisted as `(class, oid)` stubs with the owning object
//! and resolved on demand, so object graphs load lazily.
//!
//! # Raw objects
//!
//! A [`RawStore`] hosts binary blobs. Each blob is a pair of sibling
//! records — the data stream and a JSON metadata record — that are written
//! and removed together. Blob contents can be read in chunks, and backends
//! that advertise the `FILESYSTEM` capability serve them straight from
//! disk.
//!
//! # Indexes
//!
//! An [`IndexManager`] maintains reverse mappings `index key → OIDs` for
//! every index a class declares, persisted through a backend of their own.
//! Buckets are patched incrementally on save and remove, can be rebuilt
//! from scratch, and are queried through [`IndexQuery`].
//!
//! ```
//! use depot::{ClassSchema, Indexer, IndexManager, MemoryBackend, ObjectStore, Type};
//!
//! # fn main() -> depot::Result<()> {
//! let store = ObjectStore::new(MemoryBackend::new());
//! let indexes = IndexManager::new(&store, MemoryBackend::new());
//!
//! let accounts = store.register(
//!     ClassSchema::new("Account")
//!         .property("email", Type::Email)
//!         .index("email", Indexer::Normalize),
//! )?;
//!
//! let account = accounts.create();
//! account.set("email", "Alice@example.com")?;
//! account.save()?;
//!
//! let by_email = indexes.query("Account", "email")?;
//! let found = by_email.one("alice@example.com")?;
//! assert!(found.ptr_eq(&account));
//! # Ok(())
//! # }
//! ```

#![warn(
    missing_debug_implementations,
    unsafe_code,
    bare_trait_objects,
    missing_docs
)]
#![warn(clippy::pedantic, clippy::nursery)]
#![allow(
    // Next `cast_*` lints don't give alternatives.
    clippy::cast_possible_wrap, clippy::cast_possible_truncation, clippy::cast_sign_loss,
    clippy::cast_precision_loss,
    // Next lints produce too much noise/false positives.
    clippy::module_name_repetitions, clippy::similar_names, clippy::must_use_candidate,
    // '... may panic' lints.
    clippy::indexing_slicing,
    // Too much work to fix.
    clippy::missing_errors_doc, clippy::missing_const_for_fn, clippy::missing_panics_doc,
)]

pub use self::{
    backend::{Backend, Capabilities},
    backends::{DirectoryBackend, DirectoryOptions, MemoryBackend},
    clock::Timestamp,
    error::Error,
    indexes::{IndexHits, IndexKeys, IndexManager, IndexQuery, Indexer, OidHits, Order},
    objects::{Class, Object, ObjectIter, ObjectStore, Relation, ResolvedIter, Scope},
    raw::{DataChunks, RawClass, RawIter, RawObject, RawSchema, RawStore},
    record::{ObjectRecord, ObjectStub, RelationValue},
    schema::{ClassSchema, RelationKind, RESERVED_NAMES},
    types::{ClassLookup, ExactClasses, Type, Value},
};

mod backend;
mod backends;
mod cache;
mod clock;
mod error;
pub mod indexes;
mod objects;
mod raw;
mod record;
mod schema;
mod types;

/// A specialized `Result` type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;
