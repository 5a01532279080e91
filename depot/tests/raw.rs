//! Raw store behavior: sibling records, chunked reads, the path probe.

use assert_matches::assert_matches;
use rand::{rngs::StdRng, RngCore, SeedableRng};
use tempfile::TempDir;

use depot::{DirectoryBackend, Error, MemoryBackend, RawSchema, RawStore, Type, Value};

fn image_schema() -> RawSchema {
    RawSchema::new("Image")
        .property("width", Type::Positive)
        .property("height", Type::Positive)
}

fn memory_store() -> RawStore {
    let store = RawStore::new(MemoryBackend::new());
    store.register(image_schema()).unwrap();
    store
}

fn directory_store(dir: &TempDir) -> RawStore {
    let store = RawStore::new(DirectoryBackend::open(dir.path()).unwrap());
    store.register(image_schema()).unwrap();
    store
}

#[test]
fn chunked_reads_cover_the_whole_payload() {
    let store = memory_store();
    let images = store.class("Image").unwrap();

    let mut payload = vec![0_u8; 10 * 1024 * 1024];
    StdRng::seed_from_u64(7).fill_bytes(&mut payload);

    let image = images.create();
    image.set_data(payload.clone());
    image.save().unwrap();
    let oid = image.oid().unwrap();
    drop(image);

    let image = images.get(&oid).unwrap();
    let mut total = 0;
    let mut assembled = Vec::new();
    for chunk in image.data(65_536).unwrap() {
        let chunk = chunk.unwrap();
        assert!(chunk.len() <= 65_536);
        total += chunk.len();
        assembled.extend_from_slice(&chunk);
    }
    assert_eq!(total, 10 * 1024 * 1024);
    assert_eq!(image.load_data().unwrap(), assembled);
    assert_eq!(assembled, payload);
}

#[test]
fn an_empty_blob_yields_zero_chunks() {
    let store = memory_store();
    let images = store.class("Image").unwrap();

    let image = images.create();
    image.save().unwrap();
    assert_eq!(image.data(4096).unwrap().count(), 0);
    assert_eq!(image.load_data().unwrap(), Vec::<u8>::new());
}

#[test]
fn file_backed_chunks_stream_from_disk() {
    let dir = TempDir::new().unwrap();
    let store = directory_store(&dir);
    let images = store.class("Image").unwrap();

    let payload: Vec<u8> = (0..100_000).map(|i| (i % 251) as u8).collect();
    let image = images.create();
    image.set_data(payload.clone());
    image.save().unwrap();
    let oid = image.oid().unwrap();
    drop(image);

    let image = images.get(&oid).unwrap();
    let chunks: Vec<_> = image
        .data(4096)
        .unwrap()
        .collect::<depot::Result<Vec<_>>>()
        .unwrap();
    assert_eq!(chunks.concat(), payload);
    assert!(chunks[..chunks.len() - 1].iter().all(|c| c.len() == 4096));
}

#[test]
fn metadata_and_data_move_together() {
    let store = memory_store();
    let images = store.class("Image").unwrap();

    let image = images.create();
    image.set_meta("width", 640).unwrap();
    image.set_data(vec![1, 2, 3]);
    image.save().unwrap();
    let oid = image.oid().unwrap();
    assert!(images.has(&oid).unwrap());
    assert_eq!(images.count().unwrap(), 1);

    image.remove().unwrap();
    assert!(!images.has(&oid).unwrap());
    assert_eq!(images.count().unwrap(), 0);
    drop(image);
    assert_matches!(images.get(&oid), Err(Error::NotFound { .. }));
}

#[test]
fn metadata_is_validated_against_declared_types() {
    let store = memory_store();
    let images = store.class("Image").unwrap();
    let image = images.create();

    image.set_meta("width", 640).unwrap();
    assert_matches!(
        image.set_meta("width", "wide"),
        Err(Error::InvalidValue { .. })
    );
    assert_matches!(image.set_meta("oid", 1), Err(Error::ReservedProperty { .. }));
    // Undeclared attributes are accepted as primitive trees.
    image.set_meta("comment", "scanned").unwrap();

    image
        .set_meta_many(vec![
            ("width".to_owned(), Value::from(800)),
            ("height".to_owned(), Value::from(600)),
        ])
        .unwrap();
    assert_eq!(image.meta("width"), Value::from(800));
    assert_eq!(image.meta("comment"), Value::from("scanned"));
}

#[test]
fn metadata_survives_a_reload() {
    let store = memory_store();
    let images = store.class("Image").unwrap();

    let image = images.create();
    image.set_meta("width", 640).unwrap();
    image.set_data(vec![9; 16]);
    image.save().unwrap();
    let oid = image.oid().unwrap();
    drop(image);

    let image = images.get(&oid).unwrap();
    assert_eq!(image.meta("width"), Value::from(640));
    assert_eq!(image.meta("height"), Value::Null);
    assert_eq!(image.load_data().unwrap(), vec![9; 16]);
}

#[test]
fn one_live_instance_per_oid() {
    let store = memory_store();
    let images = store.class("Image").unwrap();

    let image = images.create();
    image.save().unwrap();
    let oid = image.oid().unwrap();
    let other = images.get(&oid).unwrap();
    assert!(image.ptr_eq(&other));
}

#[test]
fn path_probe_requires_the_filesystem_capability() {
    let store = memory_store();
    let images = store.class("Image").unwrap();
    let image = images.create();
    image.save().unwrap();
    assert_matches!(image.path(), Err(Error::Unsupported { .. }));

    let dir = TempDir::new().unwrap();
    let store = directory_store(&dir);
    let images = store.class("Image").unwrap();
    let image = images.create();
    image.set_data(b"pixels".to_vec());
    image.save().unwrap();
    let path = image.path().unwrap();
    assert_eq!(std::fs::read(path).unwrap(), b"pixels".to_vec());
}

#[test]
fn untouched_data_is_not_rewritten() {
    let dir = TempDir::new().unwrap();
    let store = directory_store(&dir);
    let images = store.class("Image").unwrap();

    let image = images.create();
    image.set_data(b"original".to_vec());
    image.save().unwrap();
    let oid = image.oid().unwrap();
    let path = image.path().unwrap();
    drop(image);

    // Reload, touch only the metadata, and tamper with the data file to
    // observe whether save rewrites it.
    let image = images.get(&oid).unwrap();
    std::fs::write(&path, b"tampered").unwrap();
    image.set_meta("width", 1).unwrap();
    image.save().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"tampered".to_vec());

    image.set_data(b"fresh".to_vec());
    image.save().unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"fresh".to_vec());
}

#[test]
fn all_iterates_lazily_over_blobs() {
    let store = memory_store();
    let images = store.class("Image").unwrap();
    for i in 0..3 {
        let image = images.create();
        image.set_meta("width", i * 100).unwrap();
        image.save().unwrap();
    }

    let widths: Vec<_> = images
        .all()
        .unwrap()
        .map(|image| image.unwrap().meta("width"))
        .collect();
    assert_eq!(widths.len(), 3);
}
