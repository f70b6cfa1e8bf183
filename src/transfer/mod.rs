//! Background transfer workers: move a record's bytes from its source (remote
//! URL or temporary upload) into every configured store.

mod claims;
mod fetch;
mod retry;

pub use claims::{Claim, ClaimGuard, ClaimKind, ClaimTable};
pub use fetch::{FetchError, FetchedFile, Fetcher, HttpFetcher};
pub use retry::{retry, retry_if, RetryError, RetryPolicy};

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::object_store::{StoreAdapter, StoreError, StoreSet};
use crate::storage::models::{EntryStatus, FileRecord, FileSource, RecordState, ORIGINAL_VARIANT};
use crate::storage::{Database, DatabaseError};
use crate::uploads::{TempStore, UploadError, UploadEvent};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Fetch failed after {attempts} attempts: {source}")]
    Fetch {
        attempts: u32,
        #[source]
        source: FetchError,
    },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Transfer cancelled")]
    Cancelled,
}

/// A change to a record, published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordEvent {
    EntryChanged {
        file_id: String,
        store_name: String,
        status: EntryStatus,
        state: RecordState,
    },
    /// Every store entry has reached a terminal status.
    Settled { file_id: String, state: RecordState },
    Removed { file_id: String },
}

impl RecordEvent {
    pub fn file_id(&self) -> &str {
        match self {
            RecordEvent::EntryChanged { file_id, .. }
            | RecordEvent::Settled { file_id, .. }
            | RecordEvent::Removed { file_id } => file_id,
        }
    }
}

pub struct TransferPool {
    claims: Arc<ClaimTable>,
    db: Database,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    events: broadcast::Sender<RecordEvent>,
    fetcher: Arc<dyn Fetcher>,
    policy: RetryPolicy,
    shutdown: CancellationToken,
    stores: StoreSet,
    temp: Arc<TempStore>,
}

impl TransferPool {
    pub fn new(
        db: Database,
        stores: StoreSet,
        temp: Arc<TempStore>,
        fetcher: Arc<dyn Fetcher>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        let shutdown = CancellationToken::new();
        let (events, _) = broadcast::channel(256);
        Arc::new(Self {
            claims: ClaimTable::new(shutdown.clone()),
            db,
            dispatcher: Mutex::new(None),
            events,
            fetcher,
            policy,
            shutdown,
            stores,
            temp,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.events.subscribe()
    }

    pub(crate) fn notify(&self, event: RecordEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn is_in_flight(&self, file_id: &str) -> bool {
        self.claims.is_claimed(file_id)
    }

    /// Number of records currently claimed by a worker or a removal.
    pub fn in_flight(&self) -> usize {
        self.claims.len()
    }

    /// Take the removal claim on a record. An in-flight transfer is cancelled
    /// and waited out, a concurrent removal only waited out. Nothing else can
    /// touch the record's stored bytes while the guard lives.
    pub async fn claim_exclusive(&self, file_id: &str) -> ClaimGuard {
        self.claims.claim_exclusive(file_id).await
    }

    /// Recover unfinished records and begin consuming upload events.
    /// Returns the number of records re-queued.
    pub fn start(
        self: &Arc<Self>,
        mut upload_events: mpsc::UnboundedReceiver<UploadEvent>,
    ) -> Result<usize, DatabaseError> {
        let requeued = self.recover()?;

        let pool = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = pool.shutdown.cancelled() => break,
                    event = upload_events.recv() => event,
                };
                match event {
                    Some(event) => pool.handle_upload_event(event),
                    None => break,
                }
            }
            tracing::debug!("Upload event dispatcher stopped");
        });

        if let Some(previous) = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle)
        {
            previous.abort();
        }

        tracing::info!(requeued, stores = self.stores.len(), "Transfer pool started");
        Ok(requeued)
    }

    /// Cancel in-flight transfers and wait for the workers to wind down.
    /// Cancelled entries are left pending for the next start.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let handle = self
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.claims.wait_all().await;
        tracing::info!("Transfer pool stopped");
    }

    /// Start a transfer for `file_id` unless one is already in flight.
    /// Returns whether a new transfer was started.
    pub fn trigger(self: &Arc<Self>, file_id: &str) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let claim = match self.claims.try_claim(file_id) {
            Ok(claim) => claim,
            Err(_) => {
                tracing::debug!(file_id = %file_id, "Transfer already in flight");
                return false;
            }
        };

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            match pool.transfer(&claim).await {
                Ok(()) => {}
                Err(TransferError::Cancelled) => {
                    tracing::debug!(file_id = %claim.id(), "Transfer cancelled");
                }
                Err(e) => {
                    tracing::warn!(file_id = %claim.id(), error = %e, "Transfer failed");
                }
            }
        });
        true
    }

    /// Reset interrupted entries and re-trigger every unfinished record.
    fn recover(self: &Arc<Self>) -> Result<usize, DatabaseError> {
        let mut requeued = 0;
        for record in self.db.get_all_files()? {
            if record.is_settled() {
                continue;
            }
            if record
                .stores
                .iter()
                .any(|e| e.status == EntryStatus::Transferring)
            {
                self.db.update_file(&record.id, |r| {
                    for entry in &mut r.stores {
                        if entry.status == EntryStatus::Transferring {
                            entry.status = EntryStatus::Pending;
                        }
                    }
                })?;
            }
            if self.trigger(&record.id) {
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    fn handle_upload_event(self: &Arc<Self>, event: UploadEvent) {
        match event {
            UploadEvent::ReadyForTransfer { upload_id } => {
                match self.db.get_file_by_upload(&upload_id) {
                    Ok(Some(record)) => {
                        self.trigger(&record.id);
                    }
                    Ok(None) => {
                        tracing::debug!(upload_id = %upload_id, "Upload complete, no file record yet");
                    }
                    Err(e) => {
                        tracing::error!(upload_id = %upload_id, error = %e, "Failed to look up upload");
                    }
                }
            }
            UploadEvent::Expired { upload_id } => {
                match self.db.get_file_by_upload(&upload_id) {
                    Ok(Some(record)) => {
                        let pending: Vec<String> = record
                            .stores
                            .iter()
                            .filter(|e| !e.status.is_terminal())
                            .map(|e| e.store_name.clone())
                            .collect();
                        if let Err(e) =
                            self.fail_entries(&record.id, &pending, "upload expired before completing")
                        {
                            tracing::error!(file_id = %record.id, error = %e, "Failed to mark entries failed");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::error!(upload_id = %upload_id, error = %e, "Failed to look up upload");
                    }
                }
            }
        }
    }

    async fn transfer(self: &Arc<Self>, claim: &ClaimGuard) -> Result<(), TransferError> {
        let file_id = claim.id();
        let cancel = claim.token().clone();

        let Some(record) = self.db.get_file(file_id)? else {
            tracing::debug!(file_id = %file_id, "Record removed before transfer");
            return Ok(());
        };

        let pending: Vec<String> = record
            .stores
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.store_name.clone())
            .collect();
        if pending.is_empty() {
            self.settle(&record).await;
            return Ok(());
        }

        let data = match self.load_source(&record, &cancel).await {
            Ok(data) => data,
            Err(TransferError::Upload(UploadError::Incomplete(upload_id))) => {
                // The completion event will trigger us again.
                tracing::debug!(file_id = %file_id, upload_id = %upload_id, "Upload still in progress");
                return Ok(());
            }
            Err(TransferError::Cancelled) => return Err(TransferError::Cancelled),
            Err(e) => {
                self.fail_entries(file_id, &pending, &e.to_string())?;
                if let Some(record) = self.db.get_file(file_id)? {
                    self.settle(&record).await;
                }
                return Err(e);
            }
        };

        let mut tasks = JoinSet::new();
        for store_name in pending {
            let Some(adapter) = self.stores.get(&store_name).cloned() else {
                self.fail_entries(file_id, &[store_name], "store is no longer configured")?;
                continue;
            };
            let pool = Arc::clone(self);
            let file_id = file_id.to_string();
            let data = data.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move { pool.write_store(&file_id, adapter, data, cancel).await });
        }

        let mut cancelled = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(TransferError::Cancelled)) => cancelled = true,
                Ok(Err(e)) => {
                    tracing::error!(file_id = %file_id, error = %e, "Store transfer task failed");
                }
                Err(e) => {
                    tracing::error!(file_id = %file_id, error = %e, "Store transfer task panicked");
                }
            }
        }
        if cancelled {
            return Err(TransferError::Cancelled);
        }

        if let Some(record) = self.db.get_file(file_id)? {
            self.settle(&record).await;
        }
        Ok(())
    }

    /// Fetch or read the bytes a record should hold.
    async fn load_source(
        &self,
        record: &FileRecord,
        cancel: &CancellationToken,
    ) -> Result<Bytes, TransferError> {
        match &record.source {
            FileSource::Url { url } => {
                // A fetch has no side effects and may be dropped mid-flight.
                let fetched = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(RetryError::Cancelled),
                    r = retry_if(
                        &self.policy,
                        cancel,
                        "fetch",
                        |_| {
                            let fetcher = Arc::clone(&self.fetcher);
                            let url = url.clone();
                            async move { fetcher.fetch(&url).await }
                        },
                        FetchError::is_retryable,
                    ) => r,
                };

                let file = match fetched {
                    Ok((file, attempts)) => {
                        tracing::debug!(file_id = %record.id, attempts, size = file.data.len(), "Fetched remote file");
                        file
                    }
                    Err(RetryError::Cancelled) => return Err(TransferError::Cancelled),
                    Err(RetryError::Exhausted { attempts, last }) => {
                        return Err(TransferError::Fetch {
                            attempts,
                            source: last,
                        })
                    }
                };

                let byte_size = file.data.len() as u64;
                let content_type = file.content_type.clone();
                self.db.update_file(&record.id, |r| {
                    r.byte_size = byte_size;
                    if let Some(ct) = content_type {
                        r.mime_type = ct;
                    }
                })?;
                Ok(file.data)
            }
            FileSource::Upload { upload_id } | FileSource::Clone { upload_id, .. } => {
                Ok(self.temp.read_completed(upload_id).await?)
            }
        }
    }

    /// Write the original variant to one store, retrying with backoff.
    async fn write_store(
        &self,
        file_id: &str,
        adapter: Arc<StoreAdapter>,
        data: Bytes,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        let store_name = adapter.name().to_string();

        let started = self.db.update_file(file_id, |r| {
            if let Some(entry) = r.entry_mut(&store_name) {
                entry.status = EntryStatus::Transferring;
                entry.updated_at = chrono::Utc::now();
            }
        })?;
        let Some(record) = started else {
            return Ok(());
        };
        self.entry_changed(&record, &store_name);

        let outcome = retry(&self.policy, &cancel, &store_name, |_| {
            let adapter = Arc::clone(&adapter);
            let file_id = file_id.to_string();
            let data = data.clone();
            async move { adapter.put(&file_id, ORIGINAL_VARIANT, data).await }
        })
        .await;

        let updated = match outcome {
            Ok((store_ref, attempts)) => {
                tracing::info!(
                    file_id = %file_id,
                    store = %store_name,
                    attempts,
                    size = store_ref.byte_size,
                    "Stored file"
                );
                self.db.update_file(file_id, |r| {
                    if let Some(entry) = r.entry_mut(&store_name) {
                        entry.status = EntryStatus::Complete;
                        entry.remote_id = Some(store_ref.remote_id);
                        entry.byte_size = Some(store_ref.byte_size);
                        entry.attempts += attempts;
                        entry.last_error = None;
                        entry.updated_at = chrono::Utc::now();
                    }
                })?
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                tracing::warn!(
                    file_id = %file_id,
                    store = %store_name,
                    attempts,
                    error = %last,
                    "Giving up on store"
                );
                self.db.update_file(file_id, |r| {
                    if let Some(entry) = r.entry_mut(&store_name) {
                        entry.status = EntryStatus::Failed;
                        entry.attempts += attempts;
                        entry.last_error = Some(last.to_string());
                        entry.updated_at = chrono::Utc::now();
                    }
                })?
            }
            Err(RetryError::Cancelled) => {
                if let Some(record) = self.db.update_file(file_id, |r| {
                    if let Some(entry) = r.entry_mut(&store_name) {
                        entry.status = EntryStatus::Pending;
                        entry.updated_at = chrono::Utc::now();
                    }
                })? {
                    self.entry_changed(&record, &store_name);
                }
                return Err(TransferError::Cancelled);
            }
        };

        if let Some(record) = updated {
            self.entry_changed(&record, &store_name);
        }
        Ok(())
    }

    fn fail_entries(
        &self,
        file_id: &str,
        store_names: &[String],
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let updated = self.db.update_file(file_id, |r| {
            for entry in &mut r.stores {
                if store_names.contains(&entry.store_name) && !entry.status.is_terminal() {
                    entry.status = EntryStatus::Failed;
                    entry.last_error = Some(reason.to_string());
                    entry.updated_at = chrono::Utc::now();
                }
            }
        })?;
        if let Some(record) = updated {
            for name in store_names {
                self.entry_changed(&record, name);
            }
        }
        Ok(())
    }

    fn entry_changed(&self, record: &FileRecord, store_name: &str) {
        if let Some(entry) = record.entry(store_name) {
            self.notify(RecordEvent::EntryChanged {
                file_id: record.id.clone(),
                store_name: store_name.to_string(),
                status: entry.status,
                state: record.state(),
            });
        }
    }

    /// Once every entry is terminal, staged bytes are no longer needed.
    async fn settle(&self, record: &FileRecord) {
        if !record.is_settled() {
            return;
        }
        if let Some(upload_id) = record.source.upload_id() {
            self.temp.discard(upload_id).await;
        }
        tracing::debug!(file_id = %record.id, state = ?record.state(), "Record settled");
        self.notify(RecordEvent::Settled {
            file_id: record.id.clone(),
            state: record.state(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{LocalStore, ObjectStore, ObjectStoreError};
    use crate::testutil::{eventually, StaticFetcher};
    use crate::uploads::allow_content_types;
    use async_trait::async_trait;
    use std::time::Duration;

    const URL: &str = "https://example.com/a.png";

    /// Refuses every write.
    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        async fn put(&self, _key: &str, _data: Bytes) -> Result<(), ObjectStoreError> {
            Err(ObjectStoreError::Backend("disk on fire".to_string()))
        }
        async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError> {
            Err(ObjectStoreError::NotFound(key.to_string()))
        }
        async fn delete(&self, _key: &str) -> Result<(), ObjectStoreError> {
            Ok(())
        }
        async fn exists(&self, _key: &str) -> Result<bool, ObjectStoreError> {
            Ok(false)
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        db: Database,
        fetcher: Arc<StaticFetcher>,
        pool: Arc<TransferPool>,
        upload_events: Option<mpsc::UnboundedReceiver<UploadEvent>>,
    }

    fn harness(mirror: Arc<dyn ObjectStore>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("data")).unwrap();
        let primary = LocalStore::new(dir.path().join("a")).unwrap();
        let stores = StoreSet::new(vec![
            StoreAdapter::new("a", Arc::new(primary)),
            StoreAdapter::new("b", mirror).with_required(false),
        ]);
        let (temp, upload_events) = TempStore::new(
            dir.path().join("uploads"),
            1024,
            Duration::from_secs(60),
            allow_content_types(Vec::new()),
        )
        .unwrap();
        let fetcher = Arc::new(StaticFetcher::default().with(URL, &b"pixels"[..], "image/png"));
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(10),
        };
        let pool = TransferPool::new(
            db.clone(),
            stores,
            Arc::new(temp),
            fetcher.clone(),
            policy,
        );
        Harness {
            _dir: dir,
            db,
            fetcher,
            pool,
            upload_events: Some(upload_events),
        }
    }

    fn local_mirror(dir: &tempfile::TempDir) -> Arc<dyn ObjectStore> {
        Arc::new(LocalStore::new(dir.path().join("b")).unwrap())
    }

    fn url_record(id: &str) -> FileRecord {
        FileRecord::new(
            id.to_string(),
            "a.png".to_string(),
            "image/png".to_string(),
            0,
            FileSource::Url {
                url: URL.to_string(),
            },
            [("a", true), ("b", false)],
        )
    }

    fn record_state(db: &Database, id: &str) -> Option<RecordState> {
        db.get_file(id).ok().flatten().map(|r| r.state())
    }

    #[tokio::test]
    async fn test_start_recovers_interrupted_records() {
        let mirror_dir = tempfile::tempdir().unwrap();
        let mut h = harness(local_mirror(&mirror_dir));

        let mut interrupted = url_record("interrupted");
        interrupted.entry_mut("a").unwrap().status = EntryStatus::Transferring;
        h.db.put_file(&interrupted).unwrap();

        let mut given_up = url_record("given-up");
        for entry in &mut given_up.stores {
            entry.status = EntryStatus::Failed;
        }
        h.db.put_file(&given_up).unwrap();

        let requeued = h.pool.start(h.upload_events.take().unwrap()).unwrap();
        assert_eq!(requeued, 1);

        let settled = eventually(|| {
            h.db.get_file("interrupted")
                .ok()
                .flatten()
                .is_some_and(|r| r.is_settled())
        })
        .await;
        assert!(settled);

        let record = h.db.get_file("interrupted").unwrap().unwrap();
        assert_eq!(record.state(), RecordState::Ready);
        assert_eq!(record.byte_size, 6);
        assert!(record.stores.iter().all(|e| e.status == EntryStatus::Complete));
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(record_state(&h.db, "given-up"), Some(RecordState::Failed));
    }

    #[tokio::test]
    async fn test_transfer_broadcasts_events() {
        let mirror_dir = tempfile::tempdir().unwrap();
        let mut h = harness(local_mirror(&mirror_dir));
        h.pool.start(h.upload_events.take().unwrap()).unwrap();
        let mut events = h.pool.subscribe();

        h.db.put_file(&url_record("watched")).unwrap();
        assert!(h.pool.trigger("watched"));

        let mut seen = Vec::new();
        let settled = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                let done = matches!(event, RecordEvent::Settled { .. });
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await;
        assert!(settled.is_ok(), "no Settled event, saw {seen:?}");

        assert!(seen.iter().all(|e| e.file_id() == "watched"));
        assert!(seen.contains(&RecordEvent::EntryChanged {
            file_id: "watched".to_string(),
            store_name: "a".to_string(),
            status: EntryStatus::Transferring,
            state: RecordState::Transferring,
        }));
        assert_eq!(
            seen.last(),
            Some(&RecordEvent::Settled {
                file_id: "watched".to_string(),
                state: RecordState::Ready,
            })
        );
    }

    #[tokio::test]
    async fn test_failing_optional_store_does_not_block_ready() {
        let mut h = harness(Arc::new(BrokenStore));
        h.pool.start(h.upload_events.take().unwrap()).unwrap();

        h.db.put_file(&url_record("partial")).unwrap();
        h.pool.trigger("partial");

        let settled = eventually(|| {
            h.db.get_file("partial")
                .ok()
                .flatten()
                .is_some_and(|r| r.is_settled())
        })
        .await;
        assert!(settled);

        let record = h.db.get_file("partial").unwrap().unwrap();
        assert_eq!(record.state(), RecordState::Ready);
        let mirror = record.entry("b").unwrap();
        assert_eq!(mirror.status, EntryStatus::Failed);
        assert_eq!(mirror.attempts, 2);
        assert!(mirror
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("disk on fire"));
    }

    #[tokio::test]
    async fn test_stop_leaves_entries_pending() {
        let mirror_dir = tempfile::tempdir().unwrap();
        let mut h = harness(local_mirror(&mirror_dir));
        h.pool.start(h.upload_events.take().unwrap()).unwrap();

        h.db.put_file(&url_record("halted")).unwrap();
        assert!(h.pool.trigger("halted"));
        h.pool.stop().await;

        assert!(!h.pool.is_in_flight("halted"));
        assert!(!h.pool.trigger("halted"));
        let record = h.db.get_file("halted").unwrap().unwrap();
        assert!(record
            .stores
            .iter()
            .all(|e| e.status == EntryStatus::Pending));
    }

    #[tokio::test]
    async fn test_trigger_for_removed_record_is_harmless() {
        let mirror_dir = tempfile::tempdir().unwrap();
        let mut h = harness(local_mirror(&mirror_dir));
        h.pool.start(h.upload_events.take().unwrap()).unwrap();

        assert!(h.pool.trigger("ghost"));
        assert!(eventually(|| !h.pool.is_in_flight("ghost")).await);
        assert!(h.db.get_file("ghost").unwrap().is_none());
        assert_eq!(h.fetcher.calls(), 0);
    }
}
