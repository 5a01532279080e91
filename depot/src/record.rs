//! The serialized form of a stored object.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{clock::Timestamp, types::Value, Error, Result};

/// A `(class, oid)` pair standing in for an object inside a relation.
///
/// Stubs never own the object they point at; they are resolved on demand
/// through the target class. A stub may dangle if its target was removed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectStub {
    /// Class name of the target.
    #[serde(rename = "type")]
    pub class: String,
    /// Identifier of the target within its class.
    pub oid: String,
}

impl ObjectStub {
    /// Creates a stub for `(class, oid)`.
    pub fn new(class: impl Into<String>, oid: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            oid: oid.into(),
        }
    }

    /// The stub as a depth-0 export value.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("type".to_owned(), Value::String(self.class.clone()));
        map.insert("oid".to_owned(), Value::String(self.oid.clone()));
        Value::Map(map)
    }

    /// Parses a stub out of a `{type, oid}` value.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Map(entries) => {
                let class = entries.get("type")?.as_str()?;
                let oid = entries.get("oid")?.as_str()?;
                Some(Self::new(class, oid))
            }
            _ => None,
        }
    }
}

/// Persisted state of a relation attribute.
///
/// Singular relations hold at most one stub (`null` when unset); plural
/// relations hold an ordered, duplicate-free stub list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationValue {
    /// Singular relation.
    One(Option<ObjectStub>),
    /// Plural relation.
    Many(Vec<ObjectStub>),
}

/// The full serialized record of a stored object, as written to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Storage class name.
    #[serde(rename = "type")]
    pub class: String,
    /// Object identifier.
    pub oid: String,
    /// Serialized property values.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,
    /// Relation stubs.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, RelationValue>,
    /// Per-attribute modification timestamps; `updates["oid"]` is the time
    /// of the most recent save.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, Timestamp>,
}

impl ObjectRecord {
    /// Encodes the record into the byte form handed to a backend.
    pub fn to_bytes(&self, key: &str) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::backend(key, e))
    }

    /// Decodes a record read back from a backend.
    pub fn from_bytes(key: &str, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::backend(key, e))
    }
}
