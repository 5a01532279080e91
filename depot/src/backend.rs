//! The key-value contract the stores are written against.
//!
//! A [`Backend`] is a flat, ordered namespace of string keys and opaque byte
//! values. The stores never reach past this interface: everything they
//! persist — object records, blob data, index buckets — is laid out as keys
//! under per-class prefixes. Two backends ship with this crate
//! ([`MemoryBackend`] and [`DirectoryBackend`]); applications may plug in
//! their own.
//!
//! [`MemoryBackend`]: ../backends/struct.MemoryBackend.html
//! [`DirectoryBackend`]: ../backends/struct.DirectoryBackend.html

use std::path::PathBuf;

use bitflags::bitflags;

use crate::Result;

bitflags! {
    /// Optional extensions a backend may advertise.
    ///
    /// The stores consult these flags before attempting an operation outside
    /// the core contract; a missing flag turns the operation into an
    /// `Unsupported` error rather than a runtime surprise.
    pub struct Capabilities: u32 {
        /// Values are held in regular files.
        const FILES = 0b000_0001;
        /// Individual keys can be resolved to a filesystem path.
        const FILESYSTEM = 0b000_0010;
        /// The backend has a fast path for object records.
        const OBJECTS_OPT = 0b000_0100;
        /// The backend has a fast path for metric-sized values.
        const METRICS_OPT = 0b000_1000;
        /// The backend has a fast path for raw blobs.
        const RAW_OPT = 0b001_0000;
        /// The backend has a fast path for index buckets.
        const INDEX_OPT = 0b010_0000;
        /// The backend maintains indexes natively.
        const INDEX = 0b100_0000;
    }
}

/// Storage primitive consumed by [`ObjectStore`], [`RawStore`] and
/// [`IndexManager`].
///
/// Keys are non-empty strings whose segments are joined with `/`; values are
/// opaque byte strings. Implementations must be safe to share between
/// threads; the stores serialize their own access, but two stores may hold
/// the same backend.
///
/// [`ObjectStore`]: ../objects/struct.ObjectStore.html
/// [`RawStore`]: ../raw/struct.RawStore.html
/// [`IndexManager`]: ../indexes/struct.IndexManager.html
pub trait Backend: Send + Sync + 'static {
    /// Creates `key`. Fails with `AlreadyExists` if the key is present.
    fn add(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Writes `key`, creating it if missing.
    fn update(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Reads the value under `key`, or `None` if the key is absent.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Whether `key` is present.
    fn has(&self, key: &str) -> Result<bool>;

    /// Deletes `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// All keys starting with `prefix`, in lexicographic order.
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Flushes durable state.
    fn sync(&self) -> Result<()>;

    /// Removes every key.
    fn clear(&self) -> Result<()>;

    /// The optional extensions this backend supports.
    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }

    /// Resolves `key` to the filesystem path holding its value.
    ///
    /// Only meaningful when [`Capabilities::FILESYSTEM`] is advertised;
    /// the default implementation answers `None`.
    fn data_path(&self, key: &str) -> Option<PathBuf> {
        let _ = key;
        None
    }
}

impl<B: Backend + ?Sized> Backend for std::sync::Arc<B> {
    fn add(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).add(key, value)
    }

    fn update(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).update(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn has(&self, key: &str) -> Result<bool> {
        (**self).has(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys(prefix)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn data_path(&self, key: &str) -> Option<PathBuf> {
        (**self).data_path(key)
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    fn add(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).add(key, value)
    }

    fn update(&self, key: &str, value: &[u8]) -> Result<()> {
        (**self).update(key, value)
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn has(&self, key: &str) -> Result<bool> {
        (**self).has(key)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).keys(prefix)
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }

    fn capabilities(&self) -> Capabilities {
        (**self).capabilities()
    }

    fn data_path(&self, key: &str) -> Option<PathBuf> {
        (**self).data_path(key)
    }
}
