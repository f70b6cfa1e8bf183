//! Shared test helpers for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::config::{
    Config, DownloadConfig, NodeConfig, StorageConfig, StoreConfig, TransferConfig, UploadConfig,
};
use crate::object_store::{LocalStore, ObjectStore, ObjectStoreError, StoreAdapter, StoreSet};
use crate::storage::Database;
use crate::transfer::{FetchError, FetchedFile, Fetcher};
use crate::uploads::allow_content_types;
use crate::AppState;

/// Serves canned responses; unknown urls answer 404.
#[derive(Default)]
pub struct StaticFetcher {
    files: Mutex<HashMap<String, (Bytes, String)>>,
    max_size: Option<u64>,
    pub calls: AtomicU32,
}

impl StaticFetcher {
    pub fn with(self, url: &str, data: impl Into<Bytes>, content_type: &str) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(url.to_string(), (data.into(), content_type.to_string()));
        self
    }

    /// Answer `TooLarge` for files bigger than `max`.
    pub fn with_max_size(mut self, max: u64) -> Self {
        self.max_size = Some(max);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedFile, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Give concurrent triggers a window to overlap
        tokio::time::sleep(Duration::from_millis(20)).await;
        match self.files.lock().unwrap().get(url) {
            Some((data, _)) if self.max_size.is_some_and(|max| data.len() as u64 > max) => {
                Err(FetchError::TooLarge {
                    max: self.max_size.unwrap_or_default(),
                })
            }
            Some((data, ct)) => Ok(FetchedFile {
                data: data.clone(),
                content_type: Some(ct.clone()),
            }),
            None => Err(FetchError::Status(404)),
        }
    }
}

pub fn test_config(temp_dir: &tempfile::TempDir) -> Config {
    Config {
        downloads: DownloadConfig::default(),
        node: NodeConfig {
            bind_address: "127.0.0.1:0".to_string(),
            data_dir: temp_dir.path().join("data").to_string_lossy().to_string(),
        },
        storage: StorageConfig {
            stores: vec![StoreConfig::local(
                "local",
                &temp_dir.path().join("files").to_string_lossy(),
            )],
        },
        transfer: TransferConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            fetch_timeout: Duration::from_secs(5),
        },
        uploads: UploadConfig {
            temp_dir: temp_dir.path().join("uploads").to_string_lossy().to_string(),
            ..UploadConfig::default()
        },
        test_mode: true,
        max_upload_size: 10 * 1024 * 1024, // 10MB for tests
    }
}

/// Create a started AppState with a temporary database and one local store.
pub fn test_state(temp_dir: &tempfile::TempDir, fetcher: Arc<StaticFetcher>) -> Arc<AppState> {
    let store = LocalStore::new(temp_dir.path().join("files"))
        .expect("Failed to create test object store");
    test_state_with_store(temp_dir, fetcher, Arc::new(store))
}

/// Like [`test_state`], with `backend` as the single store named "local".
pub fn test_state_with_store(
    temp_dir: &tempfile::TempDir,
    fetcher: Arc<StaticFetcher>,
    backend: Arc<dyn ObjectStore>,
) -> Arc<AppState> {
    let config = test_config(temp_dir);
    let db = Database::open(&config.node.data_dir).expect("Failed to open test database");
    let stores = StoreSet::new(vec![StoreAdapter::new("local", backend)]);
    let admission = allow_content_types(config.uploads.allowed_types.clone());

    let (state, upload_events) =
        AppState::new(config, db, stores, fetcher, admission).expect("Failed to build state");
    state
        .pool
        .start(upload_events)
        .expect("Failed to start transfer pool");
    state
}

/// A local store whose deletes are slow, and fail outright for chosen keys.
pub struct SlowDeleteStore {
    inner: LocalStore,
    delay: Duration,
    failing: Mutex<HashSet<String>>,
}

impl SlowDeleteStore {
    pub fn new(temp_dir: &tempfile::TempDir, delay: Duration) -> Self {
        Self {
            inner: LocalStore::new(temp_dir.path().join("files"))
                .expect("Failed to create test object store"),
            delay,
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Make every delete of `file_id`'s objects fail.
    pub fn fail_deletes_for(&self, file_id: &str) {
        self.failing.lock().unwrap().insert(file_id.to_string());
    }
}

#[async_trait]
impl ObjectStore for SlowDeleteStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError> {
        self.inner.put(key, data).await
    }

    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
        self.inner.get(key).await
    }

    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError> {
        tokio::time::sleep(self.delay).await;
        let file_id = key.split('/').next().unwrap_or_default();
        if self.failing.lock().unwrap().contains(file_id) {
            return Err(ObjectStoreError::Backend("delete refused".to_string()));
        }
        self.inner.delete(key).await
    }

    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError> {
        self.inner.exists(key).await
    }
}

/// Poll until `check` passes or two seconds elapse.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
