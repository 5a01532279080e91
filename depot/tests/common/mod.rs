//! Shared fixtures: the schemas used across the integration tests.

use depot::{ClassSchema, IndexManager, Indexer, MemoryBackend, ObjectStore, Type};

pub fn account_schema() -> ClassSchema {
    ClassSchema::new("Account")
        .property("email", Type::Email)
        .property("name", Type::Line)
        .property("age", Type::Positive)
        .index("email", Indexer::Normalize)
}

pub fn comment_schema() -> ClassSchema {
    ClassSchema::new("Comment")
        .property("body", Type::String)
        .relation_one("author", "Account")
        .relation_many("replies", "Comment")
}

pub fn article_schema() -> ClassSchema {
    ClassSchema::new("Article")
        .property("title", Type::Line)
        .property("content", Type::String)
        .property("path", Type::Line)
        .index("keywords", Indexer::keywords(vec!["title", "content"]))
        .index("path", Indexer::Paths { separator: '/' })
        .index("updated", Indexer::UpdateTime)
}

pub fn store() -> ObjectStore {
    let store = ObjectStore::new(MemoryBackend::new());
    store.register(account_schema()).unwrap();
    store.register(comment_schema()).unwrap();
    store.register(article_schema()).unwrap();
    store
}

#[allow(dead_code)]
pub fn store_with_indexes() -> (ObjectStore, IndexManager) {
    let store = store();
    let indexes = IndexManager::new(&store, MemoryBackend::new());
    (store, indexes)
}
