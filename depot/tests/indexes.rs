//! Index maintenance: incremental patching, queries, rebuild.

use std::sync::Arc;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use depot::{
    Backend, DirectoryBackend, Error, IndexManager, MemoryBackend, ObjectStore, Order,
};

mod common;

use crate::common::{account_schema, article_schema, store_with_indexes};

#[test]
fn normalized_email_lookup() {
    let (store, indexes) = store_with_indexes();
    let accounts = store.class("Account").unwrap();

    let account = accounts.create();
    account.set("email", "  Alice@Example.COM ").unwrap();
    account.save().unwrap();

    let by_email = indexes.query("Account", "email").unwrap();
    let found = by_email.one("alice@example.com").unwrap();
    assert!(found.ptr_eq(&account));
    assert_eq!(by_email.count("alice@example.com").unwrap(), 1);
    assert!(!by_email.has("bob@example.com").unwrap());
}

#[test]
fn keyword_search_over_title_and_content() {
    let (store, indexes) = store_with_indexes();
    let articles = store.class("Article").unwrap();

    let article = articles.create();
    article.set("title", "The quick fox").unwrap();
    article.set("content", "over lazy dogs").unwrap();
    article.save().unwrap();

    let by_keywords = indexes.query("Article", "keywords").unwrap();
    let mut keys = by_keywords.keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["dogs", "fox", "lazy", "over", "quick", "the"]);

    assert!(by_keywords
        .one("fox")
        .unwrap()
        .ptr_eq(&article));
    // Single letters fall below the minimum token length.
    assert!(!by_keywords.has("a").unwrap());
    assert_matches!(by_keywords.one("a"), Err(Error::NotFound { .. }));
}

#[test]
fn saves_patch_only_the_changed_keys() {
    let (store, indexes) = store_with_indexes();
    let accounts = store.class("Account").unwrap();
    let by_email = indexes.query("Account", "email").unwrap();

    let account = accounts.create();
    account.set("email", "old@x").unwrap();
    account.save().unwrap();
    assert!(by_email.has("old@x").unwrap());

    account.set("email", "new@x").unwrap();
    account.save().unwrap();
    assert!(!by_email.has("old@x").unwrap());
    assert_eq!(by_email.oids("new@x").unwrap(), vec![account.oid().unwrap()]);
}

#[test]
fn removal_purges_every_bucket() {
    let (store, indexes) = store_with_indexes();
    let articles = store.class("Article").unwrap();

    let article = articles.create();
    article.set("title", "quick fox").unwrap();
    article.set("path", "a/b").unwrap();
    article.save().unwrap();

    article.remove().unwrap();
    assert!(!indexes.query("Article", "keywords").unwrap().has("fox").unwrap());
    assert!(!indexes.query("Article", "path").unwrap().has("a").unwrap());
    assert!(indexes.query("Article", "keywords").unwrap().keys().unwrap().is_empty());
}

#[test]
fn insertion_order_is_preserved_and_duplicate_free() {
    let (store, indexes) = store_with_indexes();
    let accounts = store.class("Account").unwrap();

    let first = accounts.create();
    first.set("email", "shared@x").unwrap();
    first.save().unwrap();
    let second = accounts.create();
    second.set("email", "shared@x").unwrap();
    second.save().unwrap();
    // Re-saving must not duplicate the entry.
    second.set("name", "still shared").unwrap();
    second.save().unwrap();

    let by_email = indexes.query("Account", "email").unwrap();
    let raw: Vec<_> = by_email
        .get_oids("shared@x")
        .collect::<depot::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(raw, vec![first.oid().unwrap(), second.oid().unwrap()]);
    let restored: Vec<_> = by_email
        .get("shared@x")
        .collect::<depot::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(restored.len(), 2);
    assert!(restored[0].ptr_eq(&first));
}

#[test]
fn path_index_matches_every_prefix() {
    let (store, indexes) = store_with_indexes();
    let articles = store.class("Article").unwrap();

    let article = articles.create();
    article.set("path", "docs/guide/intro").unwrap();
    article.save().unwrap();

    let by_path = indexes.query("Article", "path").unwrap();
    for key in &["docs", "docs/guide", "docs/guide/intro"] {
        assert!(by_path.has(key).unwrap(), "missing prefix {}", key);
    }
    assert!(!by_path.has("guide").unwrap());
    // Keys containing the separator survive the escaped storage layout.
    assert!(by_path.keys().unwrap().contains(&"docs/guide/intro".to_owned()));
}

#[test]
fn update_time_index_follows_saves() {
    let (store, indexes) = store_with_indexes();
    let articles = store.class("Article").unwrap();

    let article = articles.create();
    article.set("title", "first").unwrap();
    article.save().unwrap();

    let by_updated = indexes.query("Article", "updated").unwrap();
    let keys = by_updated.keys().unwrap();
    assert_eq!(keys.len(), 1);

    article.set("title", "second").unwrap();
    article.save().unwrap();
    let rekeyed = by_updated.keys().unwrap();
    assert_eq!(rekeyed.len(), 1);
    assert!(rekeyed[0] > keys[0]);
}

#[test]
fn key_listing_paginates_in_both_directions() {
    let (store, indexes) = store_with_indexes();
    let accounts = store.class("Account").unwrap();
    for name in &["a@x", "b@x", "c@x", "d@x"] {
        let account = accounts.create();
        account.set("email", *name).unwrap();
        account.save().unwrap();
    }

    let by_email = indexes.query("Account", "email").unwrap();
    assert_eq!(
        by_email.list(None, None, None, Order::Asc).unwrap(),
        vec!["a@x", "b@x", "c@x", "d@x"]
    );
    assert_eq!(
        by_email.list(Some(2), Some(1), None, Order::Desc).unwrap(),
        vec!["c@x", "b@x"]
    );
    assert_eq!(
        by_email.list(None, Some(1), Some(3), Order::Asc).unwrap(),
        vec!["b@x", "c@x"]
    );
}

#[test]
fn querying_an_undeclared_index_fails() {
    let (_store, indexes) = store_with_indexes();
    assert_matches!(
        indexes.query("Account", "nope"),
        Err(Error::UnknownProperty { .. })
    );
    assert_matches!(
        indexes.query("Nope", "email"),
        Err(Error::NotRegistered { .. })
    );
}

#[test]
fn rebuild_is_idempotent() {
    let (store, indexes) = store_with_indexes();
    let accounts = store.class("Account").unwrap();
    for name in &["a@x", "b@x"] {
        let account = accounts.create();
        account.set("email", *name).unwrap();
        account.save().unwrap();
    }

    let by_email = indexes.query("Account", "email").unwrap();
    let before: Vec<_> = by_email.keys().unwrap();
    indexes.rebuild(false).unwrap();
    let once = by_email.keys().unwrap();
    indexes.rebuild(false).unwrap();
    let twice = by_email.keys().unwrap();
    assert_eq!(before, once);
    assert_eq!(once, twice);
    assert_eq!(by_email.oids("a@x").unwrap().len(), 1);
}

#[test]
fn rebuild_recovers_a_wiped_index_backend() {
    let store = ObjectStore::new(MemoryBackend::new());
    store.register(account_schema()).unwrap();
    store.register(article_schema()).unwrap();
    let index_backend = Arc::new(MemoryBackend::new());
    let indexes = IndexManager::new(&store, index_backend.clone());

    let accounts = store.class("Account").unwrap();
    let account = accounts.create();
    account.set("email", "Lost@Example.com").unwrap();
    account.save().unwrap();

    let by_email = indexes.query("Account", "email").unwrap();
    let before = by_email.oids("lost@example.com").unwrap();
    assert_eq!(before.len(), 1);

    // Wipe the index backend behind the manager's back, then replay.
    index_backend.clear().unwrap();
    assert!(by_email.oids("lost@example.com").unwrap().is_empty());
    indexes.rebuild(true).unwrap();
    assert_eq!(by_email.oids("lost@example.com").unwrap(), before);
}

#[test]
fn rebuild_recovers_deleted_index_files() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = ObjectStore::new(MemoryBackend::new());
    store.register(account_schema()).unwrap();
    let indexes = IndexManager::new(
        &store,
        DirectoryBackend::open(dir.path().join("indexes")).unwrap(),
    );

    let accounts = store.class("Account").unwrap();
    let account = accounts.create();
    account.set("email", "disk@x").unwrap();
    account.save().unwrap();

    let by_email = indexes.query("Account", "email").unwrap();
    assert!(by_email.has("disk@x").unwrap());

    std::fs::remove_dir_all(dir.path().join("indexes").join("Account")).unwrap();
    assert!(!by_email.has("disk@x").unwrap());

    indexes.rebuild(true).unwrap();
    assert_eq!(by_email.oids("disk@x").unwrap(), vec![account.oid().unwrap()]);
}
