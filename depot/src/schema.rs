//! Class descriptors and the schema registry.
//!
//! A model type is described entirely by data: a [`ClassSchema`] names the
//! class, its storage collection, its typed properties, its relations and
//! its indexes. Registering the schema with a store binds it; from then on
//! every instance of the class is validated against it.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{
    indexes::Indexer,
    types::{ClassLookup, Type},
    Error, Result,
};

/// Attribute names that collide with the reserved record fields.
pub const RESERVED_NAMES: &[&str] = &["type", "oid", "updates"];

/// Declared arity and target of a relation attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelationKind {
    /// At most one target of the named class.
    One(String),
    /// An ordered, duplicate-free sequence of targets of the named class.
    Many(String),
}

impl RelationKind {
    /// The declared target class.
    pub fn target(&self) -> &str {
        match self {
            RelationKind::One(target) | RelationKind::Many(target) => target,
        }
    }

    /// Whether the relation holds a sequence.
    pub fn is_plural(&self) -> bool {
        matches!(self, RelationKind::Many(_))
    }
}

/// Declarative description of a stored class.
///
/// Built with chained setters and handed to
/// [`ObjectStore::register`](crate::ObjectStore::register):
///
/// ```
/// use depot::{ClassSchema, Indexer, Type};
///
/// let schema = ClassSchema::new("Account")
///     .property("email", Type::Email)
///     .property("age", Type::Positive)
///     .relation_many("friends", "Account")
///     .index("email", Indexer::Normalize);
/// assert_eq!(schema.collection_name(), "Account");
/// ```
#[derive(Debug, Clone)]
pub struct ClassSchema {
    name: String,
    collection: String,
    parent: Option<String>,
    properties: BTreeMap<String, Type>,
    relations: BTreeMap<String, RelationKind>,
    indexes: BTreeMap<String, Indexer>,
}

impl ClassSchema {
    /// Starts a schema for the class `name`. The collection prefix defaults
    /// to the class name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            collection: name.clone(),
            name,
            parent: None,
            properties: BTreeMap::new(),
            relations: BTreeMap::new(),
            indexes: BTreeMap::new(),
        }
    }

    /// Overrides the key-prefix objects of this class are stored under.
    pub fn collection(mut self, collection: impl Into<String>) -> Self {
        self.collection = collection.into();
        self
    }

    /// Declares `parent` as the superclass for reference checks.
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    /// Declares a typed property.
    pub fn property(mut self, name: impl Into<String>, ty: Type) -> Self {
        self.properties.insert(name.into(), ty);
        self
    }

    /// Declares a singular relation to `target`.
    pub fn relation_one(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relations
            .insert(name.into(), RelationKind::One(target.into()));
        self
    }

    /// Declares a plural relation to `target`.
    pub fn relation_many(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relations
            .insert(name.into(), RelationKind::Many(target.into()));
        self
    }

    /// Declares an index maintained for this class.
    pub fn index(mut self, name: impl Into<String>, indexer: Indexer) -> Self {
        self.indexes.insert(name.into(), indexer);
        self
    }

    /// The class name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The storage collection (key prefix).
    pub fn collection_name(&self) -> &str {
        &self.collection
    }

    /// The declared superclass, if any.
    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    /// The descriptor of the property `name`.
    pub fn property_type(&self, name: &str) -> Option<&Type> {
        self.properties.get(name)
    }

    /// All declared properties.
    pub fn properties(&self) -> &BTreeMap<String, Type> {
        &self.properties
    }

    /// The declared relation `name`.
    pub fn relation(&self, name: &str) -> Option<&RelationKind> {
        self.relations.get(name)
    }

    /// All declared relations.
    pub fn relations(&self) -> &BTreeMap<String, RelationKind> {
        &self.relations
    }

    /// All declared indexes.
    pub fn indexes(&self) -> &BTreeMap<String, Indexer> {
        &self.indexes
    }

    /// Backend key of the object `oid`.
    pub(crate) fn object_key(&self, oid: &str) -> String {
        format!("{}/{}", self.collection, oid)
    }

    /// Backend key prefix covering all objects of this class.
    pub(crate) fn key_prefix(&self) -> String {
        format!("{}/", self.collection)
    }

    // Registration-time checks: property names must stay clear of the
    // reserved record fields and must not collide with relation names.
    pub(crate) fn check(&self) -> Result<()> {
        for name in self.properties.keys().chain(self.relations.keys()) {
            if RESERVED_NAMES.contains(&name.as_str()) {
                return Err(Error::ReservedProperty { name: name.clone() });
            }
        }
        if let Some(name) = self
            .properties
            .keys()
            .find(|name| self.relations.contains_key(*name))
        {
            return Err(Error::invalid_value(
                name.clone(),
                "declared both as a property and as a relation",
            ));
        }
        Ok(())
    }
}

/// The set of classes registered with a store.
#[derive(Debug, Default)]
pub(crate) struct SchemaSet {
    classes: BTreeMap<String, Arc<ClassSchema>>,
}

impl SchemaSet {
    pub fn insert(&mut self, schema: ClassSchema) -> Result<Arc<ClassSchema>> {
        schema.check()?;
        if self.classes.contains_key(schema.name()) {
            return Err(Error::AlreadyExists {
                key: schema.name().to_owned(),
            });
        }
        let schema = Arc::new(schema);
        self.classes.insert(schema.name().to_owned(), schema.clone());
        Ok(schema)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ClassSchema>> {
        self.classes.get(name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClassSchema>> {
        self.classes.values()
    }
}

impl ClassLookup for SchemaSet {
    fn is_subclass(&self, class: &str, ancestor: &str) -> bool {
        let mut current = class.to_owned();
        // The walk is bounded to tolerate accidental parent cycles.
        for _ in 0..=self.classes.len() {
            if current == ancestor {
                return true;
            }
            match self.classes.get(&current).and_then(|c| c.parent.clone()) {
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }
}
