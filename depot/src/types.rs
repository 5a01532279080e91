//! Type descriptors and the primitive value tree.
//!
//! Every property a class declares is governed by a [`Type`]. A descriptor
//! does three things: it validates and canonicalizes values on assignment,
//! serializes validated values into the primitive [`Value`] tree that any
//! backend can hold, and deserializes that tree back. Round-tripping a
//! validated value through `serialize` and `deserialize` is the identity.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat};
use serde::{
    de::{self, Deserializer, MapAccess, SeqAccess, Visitor},
    ser::{SerializeMap, SerializeSeq, Serializer},
    Deserialize, Serialize,
};

use crate::{Error, Result};

/// A primitive tree: the common denominator between typed properties and the
/// byte-oriented backends.
///
/// Records are encoded from this shape; `Bytes` never appears in an encoded
/// record (the `BINARY` descriptor armors byte strings as base64 text), so
/// decoding is unambiguous.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Absent / null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Floating-point number.
    Float(f64),
    /// UTF-8 text.
    String(String),
    /// Opaque byte string.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    List(Vec<Value>),
    /// String-keyed mapping.
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// The text content, if this is a `String`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// The integer content, if this is an `Int`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// The numeric content of an `Int` or `Float`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Whether this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short name of the variant, used in validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::String(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (key, value) in entries {
                    map.serialize_entry(key, value)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a primitive value tree")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E: de::Error>(self) -> std::result::Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D: Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> std::result::Result<Value, D::Error> {
                Deserialize::deserialize(deserializer)
            }

            fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<Value, E> {
                Ok(Value::Bool(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Value, E> {
                Ok(Value::Int(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Value, E> {
                if v <= i64::max_value() as u64 {
                    Ok(Value::Int(v as i64))
                } else {
                    Ok(Value::Float(v as f64))
                }
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Value, E> {
                Ok(Value::Float(v))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Value, E> {
                Ok(Value::String(v.to_owned()))
            }

            fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<Value, E> {
                Ok(Value::String(v))
            }

            fn visit_seq<A: SeqAccess<'de>>(
                self,
                mut seq: A,
            ) -> std::result::Result<Value, A::Error> {
                let mut items = Vec::new();
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::List(items))
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Value, A::Error> {
                let mut entries = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    entries.insert(key, value);
                }
                Ok(Value::Map(entries))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

/// Resolves subclass relationships for `REFERENCE` validation.
///
/// The schema registry of a store implements this; outside a store,
/// [`ExactClasses`] restricts references to exact class-name matches.
pub trait ClassLookup {
    /// Whether `class` is `ancestor` itself or one of its descendants.
    fn is_subclass(&self, class: &str, ancestor: &str) -> bool;
}

/// A [`ClassLookup`] without any registered hierarchy: only exact names
/// match.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExactClasses;

impl ClassLookup for ExactClasses {
    fn is_subclass(&self, class: &str, ancestor: &str) -> bool {
        class == ancestor
    }
}

// Branch selection inside ONE_OF never rejects a reference on class grounds;
// the store re-validates with its registry.
struct AnyClasses;

impl ClassLookup for AnyClasses {
    fn is_subclass(&self, _class: &str, _ancestor: &str) -> bool {
        true
    }
}

/// Descriptor of a property type: a closed sum over primitives, composites,
/// enumerations, references and ranges.
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    /// Boolean.
    Bool,
    /// Signed integer; floats with a zero fraction are coerced.
    Integer,
    /// Non-negative integer.
    Positive,
    /// Floating-point number; integers are coerced.
    Float,
    /// Integer or float, kept as given.
    Number,
    /// Arbitrary text.
    String,
    /// Single-line text: newline characters are rejected.
    Line,
    /// E-mail address, validated syntactically only.
    Email,
    /// Secret text; no constraints beyond being text.
    Password,
    /// Absolute URL.
    Url,
    /// HTML markup.
    Html,
    /// Markdown markup.
    Markdown,
    /// Opaque rich-text payload.
    RichText,
    /// Calendar date, canonicalized to `YYYY-MM-DD`.
    Date,
    /// Time of day, canonicalized to `HH:MM:SS`.
    Time,
    /// RFC 3339 timestamp, canonicalized to UTC.
    DateTime,
    /// Opaque byte string; armored as base64 in serialized records.
    Binary,
    /// Any primitive tree (bytes excluded).
    Any,
    /// Homogeneous list.
    List(Box<Type>),
    /// Fixed-length heterogeneous sequence.
    Tuple(Vec<Type>),
    /// First matching alternative wins.
    OneOf(Vec<Type>),
    /// Map with a declared set of fields; unknown fields are rejected,
    /// missing fields are allowed.
    Map(BTreeMap<String, Type>),
    /// Case-sensitive label set.
    Enum(Vec<String>),
    /// A `(class, oid)` stub pointing at an object of the named class or a
    /// subclass. Existence of the target is not checked.
    Reference(String),
    /// Numeric value of the item type within inclusive bounds.
    Range {
        /// Inclusive lower bound.
        min: f64,
        /// Inclusive upper bound.
        max: f64,
        /// Underlying numeric descriptor.
        item: Box<Type>,
    },
}

impl Type {
    /// Convenience constructor for `LIST(t)`.
    pub fn list(item: Type) -> Self {
        Type::List(Box::new(item))
    }

    /// Convenience constructor for `ENUM(labels…)`.
    pub fn labels<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<std::string::String>,
    {
        Type::Enum(labels.into_iter().map(Into::into).collect())
    }

    /// Convenience constructor for `RANGE(lo, hi, t)`.
    pub fn range(min: f64, max: f64, item: Type) -> Self {
        Type::Range {
            min,
            max,
            item: Box::new(item),
        }
    }

    /// Validates `value`, returning its canonical form.
    ///
    /// `path` names the attribute being validated and prefixes every error.
    /// `classes` resolves subclassing for `Reference` descriptors.
    pub fn validate(&self, value: &Value, path: &str, classes: &dyn ClassLookup) -> Result<Value> {
        match self {
            Type::Bool => match value {
                Value::Bool(_) => Ok(value.clone()),
                other => Err(mismatch(path, "bool", other)),
            },
            Type::Integer => match value {
                Value::Int(_) => Ok(value.clone()),
                Value::Float(f) if f.fract() == 0.0 && in_i64_range(*f) => {
                    Ok(Value::Int(*f as i64))
                }
                other => Err(mismatch(path, "integer", other)),
            },
            Type::Positive => {
                let canonical = Type::Integer.validate(value, path, classes)?;
                match canonical {
                    Value::Int(i) if i >= 0 => Ok(Value::Int(i)),
                    _ => Err(Error::invalid_value(path, "expected a non-negative integer")),
                }
            }
            Type::Float => match value {
                Value::Float(_) => Ok(value.clone()),
                Value::Int(i) => Ok(Value::Float(*i as f64)),
                other => Err(mismatch(path, "float", other)),
            },
            Type::Number => match value {
                Value::Int(_) | Value::Float(_) => Ok(value.clone()),
                other => Err(mismatch(path, "number", other)),
            },
            Type::String | Type::Password | Type::Html | Type::Markdown | Type::RichText => {
                match value {
                    Value::String(_) => Ok(value.clone()),
                    other => Err(mismatch(path, "string", other)),
                }
            }
            Type::Line => match value {
                Value::String(s) if !s.contains('\n') && !s.contains('\r') => Ok(value.clone()),
                Value::String(_) => {
                    Err(Error::invalid_value(path, "line must not contain newlines"))
                }
                other => Err(mismatch(path, "string", other)),
            },
            Type::Email => match value {
                Value::String(s) => {
                    let trimmed = s.trim();
                    if is_email(trimmed) {
                        Ok(Value::String(trimmed.to_owned()))
                    } else {
                        Err(Error::invalid_value(path, "not a valid e-mail address"))
                    }
                }
                other => Err(mismatch(path, "string", other)),
            },
            Type::Url => match value {
                Value::String(s) => match url::Url::parse(s) {
                    Ok(_) => Ok(value.clone()),
                    Err(e) => Err(Error::invalid_value(path, format!("not a valid URL: {}", e))),
                },
                other => Err(mismatch(path, "string", other)),
            },
            Type::Date => match value {
                Value::String(s) => match NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                    Ok(date) => Ok(Value::String(date.format("%Y-%m-%d").to_string())),
                    Err(_) => Err(Error::invalid_value(path, "expected a YYYY-MM-DD date")),
                },
                other => Err(mismatch(path, "string", other)),
            },
            Type::Time => match value {
                Value::String(s) => {
                    let parsed = NaiveTime::parse_from_str(s, "%H:%M:%S")
                        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"));
                    match parsed {
                        Ok(time) => Ok(Value::String(time.format("%H:%M:%S").to_string())),
                        Err(_) => Err(Error::invalid_value(path, "expected a HH:MM[:SS] time")),
                    }
                }
                other => Err(mismatch(path, "string", other)),
            },
            Type::DateTime => match value {
                Value::String(s) => match DateTime::parse_from_rfc3339(s) {
                    Ok(dt) => Ok(Value::String(
                        dt.with_timezone(&chrono::Utc)
                            .to_rfc3339_opts(SecondsFormat::Millis, true),
                    )),
                    Err(_) => Err(Error::invalid_value(path, "expected an RFC 3339 timestamp")),
                },
                other => Err(mismatch(path, "string", other)),
            },
            Type::Binary => match value {
                Value::Bytes(_) => Ok(value.clone()),
                other => Err(mismatch(path, "bytes", other)),
            },
            Type::Any => {
                if contains_bytes(value) {
                    Err(Error::invalid_value(path, "bytes are not a primitive tree"))
                } else {
                    Ok(value.clone())
                }
            }
            Type::List(item) => match value {
                Value::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (i, entry) in items.iter().enumerate() {
                        out.push(item.validate(entry, &format!("{}[{}]", path, i), classes)?);
                    }
                    Ok(Value::List(out))
                }
                other => Err(mismatch(path, "list", other)),
            },
            Type::Tuple(items) => match value {
                Value::List(entries) if entries.len() == items.len() => {
                    let mut out = Vec::with_capacity(entries.len());
                    for (i, (ty, entry)) in items.iter().zip(entries).enumerate() {
                        out.push(ty.validate(entry, &format!("{}[{}]", path, i), classes)?);
                    }
                    Ok(Value::List(out))
                }
                Value::List(entries) => Err(Error::invalid_value(
                    path,
                    format!("expected {} elements, got {}", items.len(), entries.len()),
                )),
                other => Err(mismatch(path, "list", other)),
            },
            Type::OneOf(alternatives) => {
                for ty in alternatives {
                    if let Ok(canonical) = ty.validate(value, path, classes) {
                        return Ok(canonical);
                    }
                }
                Err(Error::invalid_value(path, "no alternative matched"))
            }
            Type::Map(fields) => match value {
                Value::Map(entries) => {
                    let mut out = BTreeMap::new();
                    for (key, entry) in entries {
                        match fields.get(key) {
                            Some(ty) => {
                                let canonical =
                                    ty.validate(entry, &format!("{}.{}", path, key), classes)?;
                                out.insert(key.clone(), canonical);
                            }
                            None => {
                                return Err(Error::invalid_value(
                                    format!("{}.{}", path, key),
                                    "field is not declared",
                                ))
                            }
                        }
                    }
                    Ok(Value::Map(out))
                }
                other => Err(mismatch(path, "map", other)),
            },
            Type::Enum(labels) => match value {
                Value::String(s) if labels.iter().any(|label| label == s) => Ok(value.clone()),
                Value::String(s) => Err(Error::invalid_value(
                    path,
                    format!("`{}` is not one of the declared labels", s),
                )),
                other => Err(mismatch(path, "string", other)),
            },
            Type::Reference(class) => match value {
                Value::Map(entries) => {
                    let target = entries.get("type").and_then(Value::as_str);
                    let oid = entries.get("oid").and_then(Value::as_str);
                    match (target, oid) {
                        (Some(target), Some(_)) if entries.len() == 2 => {
                            if classes.is_subclass(target, class) {
                                Ok(value.clone())
                            } else {
                                Err(Error::invalid_value(
                                    path,
                                    format!("expected a reference to `{}`, got `{}`", class, target),
                                ))
                            }
                        }
                        _ => Err(Error::invalid_value(
                            path,
                            "expected a `{type, oid}` reference",
                        )),
                    }
                }
                other => Err(mismatch(path, "reference", other)),
            },
            Type::Range { min, max, item } => {
                let canonical = item.validate(value, path, classes)?;
                let numeric = canonical.as_f64().ok_or_else(|| {
                    Error::invalid_value(path, "range bounds apply to numeric values only")
                })?;
                if numeric >= *min && numeric <= *max {
                    Ok(canonical)
                } else {
                    Err(Error::invalid_value(
                        path,
                        format!("{} is outside [{}, {}]", numeric, min, max),
                    ))
                }
            }
        }
    }

    /// Serializes a validated value into its primitive form.
    pub fn serialize(&self, value: &Value) -> Result<Value> {
        match self {
            Type::Binary => match value {
                Value::Bytes(bytes) => Ok(Value::String(base64::encode(bytes))),
                other => Err(mismatch("<binary>", "bytes", other)),
            },
            Type::List(item) => match value {
                Value::List(items) => Ok(Value::List(
                    items
                        .iter()
                        .map(|entry| item.serialize(entry))
                        .collect::<Result<_>>()?,
                )),
                other => Err(mismatch("<list>", "list", other)),
            },
            Type::Tuple(items) => match value {
                Value::List(entries) => Ok(Value::List(
                    items
                        .iter()
                        .zip(entries)
                        .map(|(ty, entry)| ty.serialize(entry))
                        .collect::<Result<_>>()?,
                )),
                other => Err(mismatch("<tuple>", "list", other)),
            },
            Type::OneOf(alternatives) => {
                for ty in alternatives {
                    if ty.validate(value, "<one-of>", &AnyClasses).is_ok() {
                        return ty.serialize(value);
                    }
                }
                Err(Error::invalid_value("<one-of>", "no alternative matched"))
            }
            Type::Map(fields) => match value {
                Value::Map(entries) => {
                    let mut out = BTreeMap::new();
                    for (key, entry) in entries {
                        let serialized = match fields.get(key) {
                            Some(ty) => ty.serialize(entry)?,
                            None => entry.clone(),
                        };
                        out.insert(key.clone(), serialized);
                    }
                    Ok(Value::Map(out))
                }
                other => Err(mismatch("<map>", "map", other)),
            },
            _ => Ok(value.clone()),
        }
    }

    /// Deserializes a primitive form produced by [`serialize`].
    ///
    /// [`serialize`]: #method.serialize
    pub fn deserialize(&self, primitive: &Value) -> Result<Value> {
        match self {
            Type::Binary => match primitive {
                Value::String(encoded) => base64::decode(encoded)
                    .map(Value::Bytes)
                    .map_err(|e| Error::invalid_value("<binary>", e.to_string())),
                other => Err(mismatch("<binary>", "base64 string", other)),
            },
            Type::List(item) => match primitive {
                Value::List(items) => Ok(Value::List(
                    items
                        .iter()
                        .map(|entry| item.deserialize(entry))
                        .collect::<Result<_>>()?,
                )),
                other => Err(mismatch("<list>", "list", other)),
            },
            Type::Tuple(items) => match primitive {
                Value::List(entries) if entries.len() == items.len() => Ok(Value::List(
                    items
                        .iter()
                        .zip(entries)
                        .map(|(ty, entry)| ty.deserialize(entry))
                        .collect::<Result<_>>()?,
                )),
                other => Err(mismatch("<tuple>", "list", other)),
            },
            Type::OneOf(alternatives) => {
                for ty in alternatives {
                    if let Ok(decoded) = ty.deserialize(primitive) {
                        if ty.validate(&decoded, "<one-of>", &AnyClasses).is_ok() {
                            return Ok(decoded);
                        }
                    }
                }
                Err(Error::invalid_value("<one-of>", "no alternative matched"))
            }
            Type::Map(fields) => match primitive {
                Value::Map(entries) => {
                    let mut out = BTreeMap::new();
                    for (key, entry) in entries {
                        let decoded = match fields.get(key) {
                            Some(ty) => ty.deserialize(entry)?,
                            None => entry.clone(),
                        };
                        out.insert(key.clone(), decoded);
                    }
                    Ok(Value::Map(out))
                }
                other => Err(mismatch("<map>", "map", other)),
            },
            // Integers may come back widened by a permissive codec.
            Type::Integer | Type::Positive => match primitive {
                Value::Int(_) => Ok(primitive.clone()),
                Value::Float(f) if f.fract() == 0.0 && in_i64_range(*f) => {
                    Ok(Value::Int(*f as i64))
                }
                other => Err(mismatch("<integer>", "integer", other)),
            },
            _ => Ok(primitive.clone()),
        }
    }
}

fn mismatch(path: &str, expected: &str, got: &Value) -> Error {
    Error::invalid_value(path, format!("expected {}, got {}", expected, got.kind()))
}

fn in_i64_range(f: f64) -> bool {
    f >= i64::min_value() as f64 && f <= i64::max_value() as f64
}

fn contains_bytes(value: &Value) -> bool {
    match value {
        Value::Bytes(_) => true,
        Value::List(items) => items.iter().any(contains_bytes),
        Value::Map(entries) => entries.values().any(contains_bytes),
        _ => false,
    }
}

// Syntactic check only: one `@`, non-empty sides, no whitespace or control
// characters. Deliverability is not this layer's business.
fn is_email(s: &str) -> bool {
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let mut parts = s.splitn(2, '@');
    match (parts.next(), parts.next()) {
        (Some(local), Some(domain)) => {
            !local.is_empty() && !domain.is_empty() && !domain.contains('@')
        }
        _ => false,
    }
}
