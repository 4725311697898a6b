use std::io::Read;

use tempfile::TempDir;

use super::{FsObjectStore, ObjectStoreError};

fn store(dir: &TempDir) -> FsObjectStore {
    let s = FsObjectStore::new(dir.path(), "archives", "turnbus").unwrap();
    s.ensure_bucket().unwrap();
    s
}

#[test]
fn key_joins_the_prefix() {
    let dir = TempDir::new().unwrap();
    let s = store(&dir);
    assert_eq!(s.key("threads/t1/a.gz"), "turnbus/threads/t1/a.gz");
    assert_eq!(s.key("/leading/slash"), "turnbus/leading/slash");

    let bare = FsObjectStore::new(dir.path(), "archives", "").unwrap();
    assert_eq!(bare.key("x/y"), "x/y");
}

#[test]
fn put_then_get_round_trips_body_and_metadata() {
    let dir = TempDir::new().unwrap();
    let s = store(&dir);
    let key = s.key("threads/t1/archives/a1.jsonl.gz");
    s.put_object(&key, b"hello", "application/x-ndjson", "gzip")
        .unwrap();

    let mut blob = s.get_object(&key).unwrap();
    let mut body = Vec::new();
    blob.body.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"hello");
    assert_eq!(blob.content_type, "application/x-ndjson");
    assert_eq!(blob.content_encoding, "gzip");
}

#[test]
fn put_overwrites_previous_object() {
    let dir = TempDir::new().unwrap();
    let s = store(&dir);
    s.put_object("k", b"v1", "text/plain", "").unwrap();
    s.put_object("k", b"v2", "text/plain", "").unwrap();
    let mut blob = s.get_object("k").unwrap();
    let mut body = Vec::new();
    blob.body.read_to_end(&mut body).unwrap();
    assert_eq!(body, b"v2");
}

#[test]
fn ensure_bucket_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let s = FsObjectStore::new(dir.path(), "b", "p").unwrap();
    s.ensure_bucket().unwrap();
    s.ensure_bucket().unwrap();
}

#[test]
fn missing_object_reports_not_found() {
    let dir = TempDir::new().unwrap();
    let s = store(&dir);
    assert!(matches!(
        s.get_object("nope"),
        Err(ObjectStoreError::NotFound(_))
    ));
}

#[test]
fn traversal_keys_are_refused() {
    let dir = TempDir::new().unwrap();
    let s = store(&dir);
    for key in ["../outside", "a/../../b", "/etc/passwd"] {
        assert!(
            matches!(
                s.put_object(key, b"x", "", ""),
                Err(ObjectStoreError::KeyEscapesBucket(_))
            ),
            "key {key} must be refused"
        );
    }
    assert!(matches!(
        s.put_object("  ", b"x", "", ""),
        Err(ObjectStoreError::MissingKey)
    ));
}

#[test]
fn empty_bucket_is_refused() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
        FsObjectStore::new(dir.path(), " ", "p"),
        Err(ObjectStoreError::MissingBucket)
    ));
}
