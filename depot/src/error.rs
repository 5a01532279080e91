//! An implementation of `Error` type.

use thiserror::Error;

/// The error type for operations on stores, indexes and backends.
///
/// Validation errors and contract violations are raised at the call site
/// without mutating the object. A backend failure during `save` leaves the
/// in-memory object dirty; during `remove` it leaves the cache entry intact,
/// so the caller may retry.
#[derive(Debug, Error)]
pub enum Error {
    /// A value failed type validation.
    #[error("invalid value at `{path}`: {reason}")]
    InvalidValue {
        /// Attribute path of the offending value, e.g. `tags[2]`.
        path: String,
        /// Why validation rejected the value.
        reason: String,
    },

    /// An attribute name is not declared by the class schema.
    #[error("unknown property `{name}` on class `{class}`")]
    UnknownProperty {
        /// Class on which the access was attempted.
        class: String,
        /// The undeclared attribute name.
        name: String,
    },

    /// An attribute name collides with the reserved record fields
    /// (`type`, `oid`, `updates`).
    #[error("property name `{name}` is reserved")]
    ReservedProperty {
        /// The reserved name.
        name: String,
    },

    /// No object with the requested identifier, or an index `one()` miss.
    #[error("no `{class}` object with oid `{oid}`")]
    NotFound {
        /// Class (or `class/index` bucket) that was queried.
        class: String,
        /// The missing identifier or index key.
        oid: String,
    },

    /// `add` was invoked for a key that is already present.
    #[error("key `{key}` already exists")]
    AlreadyExists {
        /// The duplicate key.
        key: String,
    },

    /// An object was linked through a relation whose declared target class
    /// does not match.
    #[error("relation `{relation}` expects class `{expected}`, got `{actual}`")]
    RelationTypeMismatch {
        /// Name of the relation attribute.
        relation: String,
        /// Declared target class.
        expected: String,
        /// Class of the object that was passed.
        actual: String,
    },

    /// A lower-layer error, annotated with the key that was being accessed.
    #[error("backend failure on key `{key}`: {source}")]
    Backend {
        /// The offending key.
        key: String,
        /// The underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The backend does not advertise the capability required by the
    /// operation.
    #[error("`{operation}` is not supported by this backend")]
    Unsupported {
        /// The refused operation.
        operation: String,
    },

    /// A class handle was used without being registered with a store.
    #[error("class `{class}` is not registered")]
    NotRegistered {
        /// The unregistered class name.
        class: String,
    },
}

impl Error {
    pub(crate) fn invalid_value(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::InvalidValue {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(class: impl Into<String>, oid: impl Into<String>) -> Self {
        Error::NotFound {
            class: class.into(),
            oid: oid.into(),
        }
    }

    pub(crate) fn backend(key: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Error::Backend {
            key: key.into(),
            source: source.into(),
        }
    }
}
