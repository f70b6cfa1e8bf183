//! file-lifecycle - A file-record lifecycle engine
//!
//! This crate moves files from a resumable upload or a remote URL into one or
//! more durable stores, and serves them back:
//! - Swappable object storage backends (local filesystem, S3-compatible)
//! - tus resumable uploads staged in a temporary store
//! - Background transfer workers with per-file single-flight and retry
//! - redb embedded database for file records (ACID, MVCC, crash-safe)
//! - REST download endpoint with range support, RPC-style lifecycle methods

pub mod api;
pub mod config;
pub mod downloads;
pub mod lifecycle;
pub mod object_store;
pub mod storage;
#[cfg(test)]
pub mod testutil;
pub mod transfer;
pub mod uploads;

use std::sync::Arc;

use tokio::sync::mpsc;

use config::Config;
use downloads::DownloadManager;
use lifecycle::Lifecycle;
use object_store::StoreSet;
use storage::Database;
use transfer::{Fetcher, RetryPolicy, TransferPool};
use uploads::{AdmissionPredicate, TempStore, UploadEvent};

/// Shared application state
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub downloads: Arc<DownloadManager>,
    pub lifecycle: Arc<Lifecycle>,
    pub pool: Arc<TransferPool>,
    pub stores: StoreSet,
    pub temp: Arc<TempStore>,
}

impl AppState {
    /// Wire the engine together. The transfer pool is not started; pass the
    /// returned receiver to [`TransferPool::start`].
    pub fn new(
        config: Config,
        db: Database,
        stores: StoreSet,
        fetcher: Arc<dyn Fetcher>,
        admission: AdmissionPredicate,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<UploadEvent>), std::io::Error> {
        let (temp, upload_events) = TempStore::new(
            &config.uploads.temp_dir,
            config.max_upload_size,
            config.uploads.session_ttl,
            admission,
        )?;
        let temp = Arc::new(temp);
        let policy = RetryPolicy::from_config(&config.transfer);

        let pool = TransferPool::new(
            db.clone(),
            stores.clone(),
            Arc::clone(&temp),
            fetcher,
            policy.clone(),
        );
        let downloads = Arc::new(DownloadManager::new(
            db.clone(),
            stores.clone(),
            config.downloads.cache_control.clone(),
        ));
        let lifecycle = Lifecycle::new(
            db.clone(),
            stores.clone(),
            Arc::clone(&temp),
            Arc::clone(&pool),
            Arc::clone(&downloads),
            policy,
        );

        Ok((
            Arc::new(AppState {
                config,
                db,
                downloads,
                lifecycle,
                pool,
                stores,
                temp,
            }),
            upload_events,
        ))
    }
}
