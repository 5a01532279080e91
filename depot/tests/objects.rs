//! Object store behavior: lifecycle, identity, relations, scoped saves.

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;

use depot::{Error, Value};

mod common;

use crate::common::store;

#[test]
fn saved_properties_survive_a_reload() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let account = accounts.create();
    let created = account.updated("oid").unwrap();
    account.set("email", "A@x").unwrap();
    account.save().unwrap();
    let oid = account.oid().unwrap();
    drop(account);

    let reloaded = accounts.get(&oid).unwrap();
    assert_eq!(reloaded.get("email").unwrap(), Value::from("A@x"));
    assert!(reloaded.updated("email").unwrap() >= created);
    assert!(reloaded.updated("oid").unwrap() > created);
}

#[test]
fn one_live_instance_per_oid() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let account = accounts.create();
    account.set("email", "a@x").unwrap();
    account.save().unwrap();
    let oid = account.oid().unwrap();

    let first = accounts.get(&oid).unwrap();
    let second = accounts.get(&oid).unwrap();
    assert!(first.ptr_eq(&second));
    assert!(first.ptr_eq(&account));

    // Once every strong reference is gone, a reload builds an equal object.
    drop(account);
    drop(first);
    drop(second);
    let reloaded = accounts.get(&oid).unwrap();
    assert_eq!(reloaded.get("email").unwrap(), Value::from("a@x"));
}

#[test]
fn ensure_returns_existing_identity_or_an_unsaved_instance() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let account = accounts.create();
    account.set("email", "a@x").unwrap();
    account.save().unwrap();
    let oid = account.oid().unwrap();

    let ensured = accounts.ensure(&oid).unwrap();
    assert!(ensured.ptr_eq(&account));

    let fresh = accounts.ensure("missing-oid").unwrap();
    assert_eq!(fresh.oid().as_deref(), Some("missing-oid"));
    assert!(!accounts.has("missing-oid").unwrap());
    let again = accounts.ensure("missing-oid").unwrap();
    assert!(fresh.ptr_eq(&again));
}

#[test]
fn unknown_and_reserved_properties_are_rejected() {
    let store = store();
    let accounts = store.class("Account").unwrap();
    let account = accounts.create();

    assert_matches!(
        account.set("nickname", "x"),
        Err(Error::UnknownProperty { .. })
    );
    assert_matches!(account.set("oid", "x"), Err(Error::ReservedProperty { .. }));
    assert_matches!(
        account.set("email", "not-an-email"),
        Err(Error::InvalidValue { .. })
    );
}

#[test]
fn update_validates_everything_before_mutating() {
    let store = store();
    let accounts = store.class("Account").unwrap();
    let account = accounts.create();
    account.set("name", "before").unwrap();

    let result = account.update(vec![
        ("name".to_owned(), Value::from("after")),
        ("age".to_owned(), Value::from(-3)),
    ]);
    assert_matches!(result, Err(Error::InvalidValue { .. }));
    assert_eq!(account.get("name").unwrap(), Value::from("before"));

    account
        .update(vec![
            ("name".to_owned(), Value::from("after")),
            ("age".to_owned(), Value::from(30)),
        ])
        .unwrap();
    assert_eq!(account.get("age").unwrap(), Value::from(30));
    assert!(account.updated("age").unwrap() > account.updated("name").unwrap());
}

#[test]
fn plural_relations_stay_duplicate_free() {
    let store = store();
    let comments = store.class("Comment").unwrap();

    let a = comments.create();
    let b = comments.create();
    b.save().unwrap();

    let replies = a.relation("replies").unwrap();
    replies.add(&b).unwrap();
    replies.add(&b).unwrap();
    assert_eq!(replies.len(), 1);
    a.save().unwrap();
    let oid = a.oid().unwrap();
    drop(a);
    drop(replies);

    let reloaded = comments.get(&oid).unwrap();
    let replies = reloaded.relation("replies").unwrap();
    assert_eq!(replies.len(), 1);
    assert!(replies.contains(&b));
}

#[test]
fn relations_enforce_the_declared_target_class() {
    let store = store();
    let comments = store.class("Comment").unwrap();
    let accounts = store.class("Account").unwrap();

    let comment = comments.create();
    let account = accounts.create();
    account.save().unwrap();

    assert_matches!(
        comment.relation("replies").unwrap().add(&account),
        Err(Error::RelationTypeMismatch { .. })
    );
    comment
        .relation("author")
        .unwrap()
        .set(Some(&account))
        .unwrap();
    let resolved = comment.relation("author").unwrap().get().unwrap().unwrap();
    assert!(resolved.ptr_eq(&account));
}

#[test]
fn unsaved_targets_cannot_be_linked() {
    let store = store();
    let comments = store.class("Comment").unwrap();

    let a = comments.create();
    let unsaved = comments.create();
    assert_matches!(
        a.relation("replies").unwrap().add(&unsaved),
        Err(Error::InvalidValue { .. })
    );
}

#[test]
fn dangling_relation_stubs_fail_on_resolution() {
    let store = store();
    let comments = store.class("Comment").unwrap();

    let a = comments.create();
    let b = comments.create();
    b.save().unwrap();
    a.relation("replies").unwrap().add(&b).unwrap();
    a.save().unwrap();

    b.remove().unwrap();
    drop(b);

    let mut resolved = a.relation("replies").unwrap().resolve();
    assert_matches!(resolved.next(), Some(Err(Error::NotFound { .. })));
}

#[test]
fn removal_is_complete() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let account = accounts.create();
    account.set("email", "a@x").unwrap();
    account.save().unwrap();
    let oid = account.oid().unwrap();

    account.remove().unwrap();
    assert!(!accounts.has(&oid).unwrap());
    assert_matches!(accounts.get(&oid), Err(Error::NotFound { .. }));
    assert_eq!(accounts.count().unwrap(), 0);
}

#[test]
fn save_is_idempotent_when_clean() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let account = accounts.create();
    account.set("email", "a@x").unwrap();
    account.save().unwrap();
    assert!(!account.is_dirty());
    let stamp = account.updated("oid").unwrap();

    account.save().unwrap();
    assert_eq!(account.updated("oid").unwrap(), stamp);

    account.set("name", "alice").unwrap();
    assert!(account.is_dirty());
    account.save().unwrap();
    assert!(account.updated("oid").unwrap() > stamp);
}

#[test]
fn depth_one_export_is_stable_across_a_reload() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let account = accounts.create();
    account.set("email", "a@x").unwrap();
    account.set("age", 33).unwrap();
    account.save().unwrap();
    let oid = account.oid().unwrap();
    let before = account.export(1).unwrap();
    drop(account);

    let after = accounts.get(&oid).unwrap().export(1).unwrap();
    assert_eq!(before, after);
}

#[test]
fn exports_at_increasing_depth() {
    let store = store();
    let comments = store.class("Comment").unwrap();
    let accounts = store.class("Account").unwrap();

    let author = accounts.create();
    author.set("email", "a@x").unwrap();
    author.save().unwrap();
    let comment = comments.create();
    comment.set("body", "hello").unwrap();
    comment.relation("author").unwrap().set(Some(&author)).unwrap();
    comment.save().unwrap();

    let stub = comment.export(0).unwrap();
    match &stub {
        Value::Map(entries) => {
            assert_eq!(entries.len(), 2);
            assert_eq!(entries.get("type"), Some(&Value::from("Comment")));
        }
        other => panic!("expected a map, got {:?}", other),
    }

    let shallow = comment.export(1).unwrap();
    let deep = comment.export(2).unwrap();
    let (shallow_author, deep_author) = match (&shallow, &deep) {
        (Value::Map(s), Value::Map(d)) => {
            let pick = |v: &Value| match v {
                Value::Map(m) => m.get("author").cloned().unwrap(),
                _ => unreachable!(),
            };
            (pick(s.get("relations").unwrap()), pick(d.get("relations").unwrap()))
        }
        _ => panic!("expected maps"),
    };
    // Depth 1 keeps the stub; depth 2 inlines the author's own export.
    assert_eq!(shallow_author, author.export(0).unwrap());
    assert_eq!(deep_author, author.export(1).unwrap());
}

#[test]
fn cyclic_exports_terminate() {
    let store = store();
    let comments = store.class("Comment").unwrap();

    let a = comments.create();
    let b = comments.create();
    a.save().unwrap();
    b.save().unwrap();
    a.relation("replies").unwrap().add(&b).unwrap();
    b.relation("replies").unwrap().add(&a).unwrap();
    a.save().unwrap();
    b.save().unwrap();

    let exported = a.export(2).unwrap();
    // The cycle collapses back to a stub of `a` inside `b`'s export.
    let b_export = match &exported {
        Value::Map(entries) => match entries.get("relations").unwrap() {
            Value::Map(rels) => match rels.get("replies").unwrap() {
                Value::List(items) => items[0].clone(),
                other => panic!("expected a list, got {:?}", other),
            },
            _ => unreachable!(),
        },
        _ => unreachable!(),
    };
    match &b_export {
        Value::Map(entries) => match entries.get("relations").unwrap() {
            Value::Map(rels) => match rels.get("replies").unwrap() {
                Value::List(items) => assert_eq!(items[0], a.export(0).unwrap()),
                other => panic!("expected a list, got {:?}", other),
            },
            _ => unreachable!(),
        },
        other => panic!("expected a map, got {:?}", other),
    }
}

#[test]
fn import_round_trips_a_depth_one_export() {
    let source = store();
    let accounts = source.class("Account").unwrap();
    let account = accounts.create();
    account.set("email", "a@x").unwrap();
    account.set("age", 28).unwrap();
    account.save().unwrap();
    let exported = account.export(1).unwrap();

    let target = store();
    let imported = target.class("Account").unwrap().import(&exported).unwrap();
    assert!(imported.is_dirty());
    assert_eq!(imported.oid(), account.oid());
    assert_eq!(imported.get("age").unwrap(), Value::from(28));
    imported.save().unwrap();
    assert_eq!(imported.export(1).unwrap(), exported);
}

#[test]
fn import_rejects_undeclared_properties() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let mut properties = std::collections::BTreeMap::new();
    properties.insert("bogus".to_owned(), Value::from(1));
    let mut value = std::collections::BTreeMap::new();
    value.insert("properties".to_owned(), Value::Map(properties));

    assert_matches!(
        accounts.import(&Value::Map(value)),
        Err(Error::UnknownProperty { .. })
    );
}

#[test]
fn lists_are_ordered_and_paginated() {
    let store = store();
    let accounts = store.class("Account").unwrap();
    for i in 0..5 {
        let account = accounts.create();
        account.set("age", i).unwrap();
        account.save().unwrap();
    }

    assert_eq!(accounts.count().unwrap(), 5);
    let oids = accounts.oids().unwrap();
    let mut sorted = oids.clone();
    sorted.sort();
    assert_eq!(oids, sorted);

    let page = accounts.list(Some(2), Some(1), None).unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].oid().as_deref(), Some(oids[1].as_str()));

    let all: Vec<_> = accounts
        .all()
        .unwrap()
        .collect::<depot::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(all.len(), 5);
}

#[test]
fn scoped_saves_flush_every_dirty_object_once() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let (first, second) = {
        let scope = store.scope();
        let first = accounts.create();
        first.set("email", "one@x").unwrap();
        let second = accounts.create();
        second.set("email", "two@x").unwrap();
        assert!(first.oid().is_none());
        scope.commit().unwrap();
        (first, second)
    };

    assert!(!first.is_dirty());
    assert!(!second.is_dirty());
    assert!(accounts.has(&first.oid().unwrap()).unwrap());
    assert!(accounts.has(&second.oid().unwrap()).unwrap());
}

#[test]
fn dropping_a_scope_flushes_too() {
    let store = store();
    let accounts = store.class("Account").unwrap();

    let account = {
        let _scope = store.scope();
        let account = accounts.create();
        account.set("email", "drop@x").unwrap();
        account
    };
    assert!(accounts.has(&account.oid().unwrap()).unwrap());
}

#[test]
fn class_access_requires_registration() {
    let store = store();
    assert_matches!(store.class("Nope"), Err(Error::NotRegistered { .. }));
}

#[test]
fn parallel_saves_to_distinct_objects_are_safe() {
    let store = store();
    store.class("Account").unwrap();

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                let accounts = store.class("Account").unwrap();
                for j in 0..10 {
                    let account = accounts.create();
                    account.set("age", i * 10 + j).unwrap();
                    account.save().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.class("Account").unwrap().count().unwrap(), 80);
}
