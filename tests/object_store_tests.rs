use std::sync::Arc;

use bytes::Bytes;
use file_lifecycle::object_store::{
    LocalStore, ObjectStore, ObjectStoreError, StoreAdapter, StoreError, StoreSet,
};

#[tokio::test]
async fn test_local_store_put_get() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    let data = Bytes::from("hello world");
    store.put("file-1/original", data.clone()).await.unwrap();

    let retrieved = store.get("file-1/original").await.unwrap();
    assert_eq!(retrieved, data);
}

#[tokio::test]
async fn test_local_store_exists() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    assert!(!store.exists("missing/original").await.unwrap());

    store
        .put("present/original", Bytes::from("data"))
        .await
        .unwrap();
    assert!(store.exists("present/original").await.unwrap());
}

#[tokio::test]
async fn test_local_store_delete() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    store
        .put("to-delete/original", Bytes::from("data"))
        .await
        .unwrap();
    store.delete("to-delete/original").await.unwrap();
    assert!(!store.exists("to-delete/original").await.unwrap());
}

#[tokio::test]
async fn test_local_store_delete_nonexistent() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    // Deleting a nonexistent key should not error
    store.delete("nonexistent/original").await.unwrap();
}

#[tokio::test]
async fn test_local_store_get_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    let result = store.get("missing/original").await;
    assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
}

#[tokio::test]
async fn test_local_store_rejects_escaping_keys() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path().join("objects")).unwrap();

    let result = store.put("../outside", Bytes::from("x")).await;
    assert!(result.is_err());
    assert!(!dir.path().join("outside").exists());
}

#[tokio::test]
async fn test_local_store_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();

    store.put("key/original", Bytes::from("first")).await.unwrap();
    store
        .put("key/original", Bytes::from("second"))
        .await
        .unwrap();

    let data = store.get("key/original").await.unwrap();
    assert_eq!(data, Bytes::from("second"));
}

#[tokio::test]
async fn test_local_store_get_range() {
    let dir = tempfile::tempdir().unwrap();
    let store = LocalStore::new(dir.path()).unwrap();
    store
        .put("ranged/original", Bytes::from("0123456789"))
        .await
        .unwrap();

    let middle = store.get_range("ranged/original", 2, 5).await.unwrap();
    assert_eq!(middle, Bytes::from("2345"));

    let last = store.get_range("ranged/original", 9, 9).await.unwrap();
    assert_eq!(last, Bytes::from("9"));

    let past_end = store.get_range("ranged/original", 5, 10).await;
    assert!(matches!(
        past_end,
        Err(ObjectStoreError::InvalidRange { start: 5, end: 10, .. })
    ));

    let missing = store.get_range("missing/original", 0, 1).await;
    assert!(matches!(missing, Err(ObjectStoreError::NotFound(_))));
}

#[tokio::test]
async fn test_adapter_keys_objects_by_file_and_variant() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(LocalStore::new(dir.path()).unwrap());
    let adapter = StoreAdapter::new("local", backend.clone());

    let stored = adapter
        .put("file-9", "original", Bytes::from("payload"))
        .await
        .unwrap();
    assert_eq!(stored.store_name, "local");
    assert_eq!(stored.remote_id, "file-9/original");
    assert_eq!(stored.byte_size, 7);

    // The backend sees the same key the adapter reports.
    assert_eq!(
        backend.get("file-9/original").await.unwrap(),
        Bytes::from("payload")
    );
    assert!(adapter.exists("file-9", "original").await.unwrap());

    adapter.delete("file-9", "original").await.unwrap();
    let gone = adapter.get("file-9", "original").await;
    assert!(matches!(gone, Err(StoreError::NotFound { .. })));
}

#[tokio::test]
async fn test_adapter_applies_write_transform() {
    let dir = tempfile::tempdir().unwrap();
    let backend = Arc::new(LocalStore::new(dir.path()).unwrap());
    let adapter = StoreAdapter::new("shouty", backend).with_transform(Arc::new(|data: Bytes| {
        Bytes::from(data.to_ascii_uppercase())
    }));

    let stored = adapter
        .put("file-10", "original", Bytes::from("quiet"))
        .await
        .unwrap();
    assert_eq!(stored.byte_size, 5);
    assert_eq!(
        adapter.get("file-10", "original").await.unwrap(),
        Bytes::from("QUIET")
    );
}

#[tokio::test]
async fn test_adapter_range_errors_name_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let adapter = StoreAdapter::new("local", Arc::new(LocalStore::new(dir.path()).unwrap()));
    adapter
        .put("file-11", "original", Bytes::from("abc"))
        .await
        .unwrap();

    match adapter.get_range("file-11", "original", 1, 3).await {
        Err(StoreError::InvalidRange { store, .. }) => assert_eq!(store, "local"),
        other => panic!("expected InvalidRange, got {other:?}"),
    }
}

#[test]
fn test_store_set_preserves_preference_order() {
    let dir = tempfile::tempdir().unwrap();
    let primary = StoreAdapter::new(
        "primary",
        Arc::new(LocalStore::new(dir.path().join("a")).unwrap()),
    );
    let mirror = StoreAdapter::new(
        "mirror",
        Arc::new(LocalStore::new(dir.path().join("b")).unwrap()),
    )
    .with_required(false);

    let set = StoreSet::new(vec![primary, mirror]);
    let names: Vec<&str> = set.iter().map(|a| a.name()).collect();
    assert_eq!(names, vec!["primary", "mirror"]);
    assert!(set.is_required("primary"));
    assert!(!set.is_required("mirror"));
    assert!(!set.is_required("unknown"));
    assert_eq!(set.len(), 2);
}
