//! An in-memory backend, mainly useful for tests.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::Mutex;

use crate::{
    backend::{Backend, Capabilities},
    Error, Result,
};

/// Non-persistent backend holding all values in a `BTreeMap`.
///
/// The map keeps keys sorted, so `keys(prefix)` enumeration is a cheap range
/// scan. All contents are lost on drop.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Backend for MemoryBackend {
    fn add(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut map = self.map.lock();
        if map.contains_key(key) {
            return Err(Error::AlreadyExists {
                key: key.to_owned(),
            });
        }
        map.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn update(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.lock().insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock().get(key).cloned())
    }

    fn has(&self, key: &str) -> Result<bool> {
        Ok(self.map.lock().contains_key(key))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.lock().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let map = self.map.lock();
        let keys = map
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        Ok(keys)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.map.lock().clear();
        Ok(())
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::empty()
    }
}
