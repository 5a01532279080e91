//! Built-in indexer functions.
//!
//! An indexer maps an object's record to the set of keys it should be
//! findable under; producing no keys leaves the object out of the index.
//! Most indexers read the property named like the index itself, so an index
//! declared as `("email", Indexer::Normalize)` indexes the `email` property.

use std::fmt;
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use smallvec::SmallVec;
use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

use crate::{record::ObjectRecord, types::Value};

/// Key set produced by an indexer for one object. Nearly always a single
/// key, so the common case stays on the stack.
pub type IndexKeys = SmallVec<[String; 2]>;

/// Derives index keys from an object record.
#[derive(Clone)]
pub enum Indexer {
    /// The property value itself, stringified.
    Value,
    /// Lowercased, trimmed, internal whitespace collapsed.
    Normalize,
    /// Compatibility-decomposed with combining marks dropped.
    NoAccents,
    /// [`Normalize`] followed by [`NoAccents`].
    ///
    /// [`Normalize`]: #variant.Normalize
    /// [`NoAccents`]: #variant.NoAccents
    Keyword,
    /// Tokenizes the named properties on non-letter runs, keywords each
    /// token, and drops tokens shorter than `min_len`.
    Keywords {
        /// Properties contributing tokens.
        fields: Vec<String>,
        /// Minimum token length, in characters.
        min_len: usize,
    },
    /// Formatted timestamp of the most recent save (`updates["oid"]`).
    UpdateTime,
    /// Splits the property into cumulative path prefixes:
    /// `a/b/c` yields `a`, `a/b` and `a/b/c`.
    Paths {
        /// Path separator.
        separator: char,
    },
    /// Application-supplied indexer; receives the index name and the record.
    Custom(Arc<dyn Fn(&str, &ObjectRecord) -> Vec<String> + Send + Sync>),
}

impl Indexer {
    /// Tokenizing indexer over `fields` with the default minimum token
    /// length of 3.
    pub fn keywords<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Indexer::Keywords {
            fields: fields.into_iter().map(Into::into).collect(),
            min_len: 3,
        }
    }

    /// The keys `record` should be findable under in the index `name`.
    pub fn keys(&self, name: &str, record: &ObjectRecord) -> IndexKeys {
        match self {
            Indexer::Value => property_strings(record, name),
            Indexer::Normalize => map_strings(property_strings(record, name), normalize),
            Indexer::NoAccents => map_strings(property_strings(record, name), no_accents),
            Indexer::Keyword => map_strings(property_strings(record, name), keyword),
            Indexer::Keywords { fields, min_len } => {
                let mut out = IndexKeys::new();
                for field in fields {
                    for text in property_strings(record, field) {
                        for token in tokenize(&text, *min_len) {
                            if !out.contains(&token) {
                                out.push(token);
                            }
                        }
                    }
                }
                out
            }
            Indexer::UpdateTime => {
                let mut out = IndexKeys::new();
                if let Some(&stamp) = record.updates.get("oid") {
                    out.push(format_update_time(stamp));
                }
                out
            }
            Indexer::Paths { separator } => {
                let mut out = IndexKeys::new();
                for text in property_strings(record, name) {
                    let mut prefix = String::new();
                    for segment in text.split(*separator) {
                        if !prefix.is_empty() {
                            prefix.push(*separator);
                        }
                        prefix.push_str(segment);
                        if !out.contains(&prefix) {
                            out.push(prefix.clone());
                        }
                    }
                }
                out
            }
            Indexer::Custom(f) => f(name, record).into_iter().collect(),
        }
    }
}

impl fmt::Debug for Indexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Indexer::Value => f.write_str("Value"),
            Indexer::Normalize => f.write_str("Normalize"),
            Indexer::NoAccents => f.write_str("NoAccents"),
            Indexer::Keyword => f.write_str("Keyword"),
            Indexer::Keywords { fields, min_len } => f
                .debug_struct("Keywords")
                .field("fields", fields)
                .field("min_len", min_len)
                .finish(),
            Indexer::UpdateTime => f.write_str("UpdateTime"),
            Indexer::Paths { separator } => {
                f.debug_struct("Paths").field("separator", separator).finish()
            }
            Indexer::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// A list-valued property contributes one key per element.
fn property_strings(record: &ObjectRecord, name: &str) -> IndexKeys {
    let mut out = IndexKeys::new();
    match record.properties.get(name) {
        Some(Value::List(items)) => {
            for item in items {
                if let Some(text) = value_string(item) {
                    out.push(text);
                }
            }
        }
        Some(value) => {
            if let Some(text) = value_string(value) {
                out.push(text);
            }
        }
        None => {}
    }
    out
}

fn value_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Float(f) => Some(f.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn map_strings(keys: IndexKeys, f: impl Fn(&str) -> String) -> IndexKeys {
    let mut out = IndexKeys::new();
    for key in keys {
        let mapped = f(&key);
        if !mapped.is_empty() && !out.contains(&mapped) {
            out.push(mapped);
        }
    }
    out
}

pub(crate) fn normalize(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub(crate) fn no_accents(s: &str) -> String {
    s.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

pub(crate) fn keyword(s: &str) -> String {
    no_accents(&normalize(s))
}

fn tokenize(s: &str, min_len: usize) -> Vec<String> {
    s.split(|c: char| !c.is_alphabetic())
        .map(keyword)
        .filter(|token| token.chars().count() >= min_len)
        .collect()
}

pub(crate) fn format_update_time(stamp: u64) -> String {
    match Utc.timestamp_millis_opt(stamp as i64).single() {
        Some(dt) => dt.format("%Y%m%d%H%M%S%3f").to_string(),
        None => stamp.to_string(),
    }
}
