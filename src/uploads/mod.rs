//! Temporary upload store: resumable chunked uploads staged on local disk
//! until a transfer worker moves them into durable storage.

mod metadata;
mod session;

pub use metadata::UploadMetadata;
pub use session::{ByteRanges, UploadSession};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload not found: {0}")]
    NotFound(String),
    #[error("Offset mismatch: expected {expected}, got {got}")]
    OffsetMismatch { expected: u64, got: u64 },
    #[error("Chunk of {len} bytes at offset {offset} exceeds declared length {total}")]
    ChunkTooLarge { offset: u64, len: u64, total: u64 },
    #[error("Upload length {length} exceeds maximum of {max} bytes")]
    TooLarge { length: u64, max: u64 },
    #[error("Another chunk is being written to upload {0}")]
    Busy(String),
    #[error("Upload rejected: {0}")]
    Rejected(String),
    #[error("Invalid upload metadata: {0}")]
    InvalidMetadata(String),
    #[error("Upload {0} is not complete")]
    Incomplete(String),
    #[error("Upload {0} already has a file record")]
    AlreadyClaimed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Signals from the temporary store to the transfer worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadEvent {
    /// All bytes have arrived; the upload can be moved to durable storage.
    ReadyForTransfer { upload_id: String },
    /// The session was purged before completing.
    Expired { upload_id: String },
}

/// Decides whether a new upload may be created, given its declared metadata.
pub type AdmissionPredicate = Arc<dyn Fn(&UploadMetadata) -> bool + Send + Sync>;

/// Admit uploads whose declared content type starts with one of `prefixes`.
/// An empty list admits everything.
pub fn allow_content_types(prefixes: Vec<String>) -> AdmissionPredicate {
    Arc::new(move |meta: &UploadMetadata| {
        if prefixes.is_empty() {
            return true;
        }
        match meta.content_type.as_deref() {
            Some(ct) => prefixes.iter().any(|p| ct.starts_with(p.as_str())),
            None => false,
        }
    })
}

pub struct TempStore {
    admission: AdmissionPredicate,
    dir: PathBuf,
    events: mpsc::UnboundedSender<UploadEvent>,
    max_size: u64,
    sessions: Mutex<HashMap<String, UploadSession>>,
    ttl: Duration,
}

/// Clears a session's write flag however the write ends.
struct WriteGuard<'a> {
    store: &'a TempStore,
    id: &'a str,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        let mut sessions = self.store.lock();
        if let Some(session) = sessions.get_mut(self.id) {
            session.writing = false;
        }
    }
}

impl TempStore {
    /// Create a store staging files under `dir`. The returned receiver carries
    /// [`UploadEvent`]s for the transfer worker pool.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        max_size: u64,
        ttl: Duration,
        admission: AdmissionPredicate,
    ) -> Result<(Self, mpsc::UnboundedReceiver<UploadEvent>), std::io::Error> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        let (events, rx) = mpsc::unbounded_channel();

        Ok((
            Self {
                admission,
                dir,
                events,
                max_size,
                sessions: Mutex::new(HashMap::new()),
                ttl,
            },
            rx,
        ))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, UploadSession>> {
        // A poisoned map is still structurally valid; keep serving.
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: UploadEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("No transfer pool is listening for upload events");
        }
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// Start a new upload session.
    pub async fn create(
        &self,
        total_size: u64,
        metadata: UploadMetadata,
    ) -> Result<UploadSession, UploadError> {
        if total_size > self.max_size {
            return Err(UploadError::TooLarge {
                length: total_size,
                max: self.max_size,
            });
        }

        if !(self.admission)(&metadata) {
            tracing::info!(
                content_type = ?metadata.content_type,
                "Upload denied by admission predicate"
            );
            return Err(UploadError::Rejected(format!(
                "uploads of type {:?} are not allowed",
                metadata.content_type.as_deref().unwrap_or("unknown")
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let path = self.dir.join(format!("{id}.part"));
        tokio::fs::File::create(&path).await?;

        let session = UploadSession::new(id.clone(), total_size, metadata, path);
        let complete = session.is_complete();
        self.lock().insert(id.clone(), session.clone());

        tracing::debug!(upload_id = %id, total_size, "Created upload session");
        if complete {
            self.emit(UploadEvent::ReadyForTransfer { upload_id: id });
        }
        Ok(session)
    }

    /// Current snapshot of a session.
    pub fn get(&self, id: &str) -> Option<UploadSession> {
        self.lock().get(id).cloned()
    }

    /// Append `data` at `offset`, which must equal the bytes received so far.
    /// Returns the new offset. A rejected chunk leaves the session untouched.
    pub async fn write_chunk(&self, id: &str, offset: u64, data: Bytes) -> Result<u64, UploadError> {
        let len = data.len() as u64;
        let path = {
            let mut sessions = self.lock();
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| UploadError::NotFound(id.to_string()))?;

            if session.writing {
                return Err(UploadError::Busy(id.to_string()));
            }
            let expected = session.offset();
            if offset != expected {
                return Err(UploadError::OffsetMismatch {
                    expected,
                    got: offset,
                });
            }
            if offset + len > session.total_size {
                return Err(UploadError::ChunkTooLarge {
                    offset,
                    len,
                    total: session.total_size,
                });
            }

            session.writing = true;
            session.last_activity = Instant::now();
            session.path.clone()
        };
        let _guard = WriteGuard { store: self, id };

        // Anything past `offset` is left over from an interrupted write.
        let mut file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
        file.set_len(offset).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_data().await?;

        let progress = {
            let mut sessions = self.lock();
            sessions.get_mut(id).map(|session| {
                session.received.insert(offset, offset + len);
                session.last_activity = Instant::now();
                (session.offset(), session.is_complete())
            })
        };
        let Some((new_offset, complete)) = progress else {
            // Terminated while we were writing
            let _ = tokio::fs::remove_file(&path).await;
            return Err(UploadError::NotFound(id.to_string()));
        };

        if complete {
            tracing::debug!(upload_id = %id, size = new_offset, "Upload complete");
            self.emit(UploadEvent::ReadyForTransfer {
                upload_id: id.to_string(),
            });
        }
        Ok(new_offset)
    }

    /// Mark a session as owned by a file record. Fails if another record owns it.
    pub fn claim(&self, id: &str) -> Result<UploadSession, UploadError> {
        let mut sessions = self.lock();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;
        if session.claimed {
            return Err(UploadError::AlreadyClaimed(id.to_string()));
        }
        session.claimed = true;
        session.last_activity = Instant::now();
        Ok(session.clone())
    }

    /// Undo [`claim`](Self::claim) when record creation fails.
    pub fn release_claim(&self, id: &str) {
        if let Some(session) = self.lock().get_mut(id) {
            session.claimed = false;
        }
    }

    /// Read the assembled bytes of a completed upload.
    pub async fn read_completed(&self, id: &str) -> Result<Bytes, UploadError> {
        let session = self
            .get(id)
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;
        if !session.is_complete() {
            return Err(UploadError::Incomplete(id.to_string()));
        }
        let data = tokio::fs::read(&session.path).await?;
        Ok(Bytes::from(data))
    }

    /// Stage bytes that are already complete and owned by a record.
    pub async fn stage(
        &self,
        data: Bytes,
        metadata: UploadMetadata,
    ) -> Result<UploadSession, UploadError> {
        let id = uuid::Uuid::new_v4().to_string();
        let path = self.dir.join(format!("{id}.part"));
        tokio::fs::write(&path, &data).await?;

        let mut session = UploadSession::new(id.clone(), data.len() as u64, metadata, path);
        session.received.insert(0, data.len() as u64);
        session.claimed = true;
        self.lock().insert(id, session.clone());
        Ok(session)
    }

    /// Terminate a session and delete its data.
    pub async fn terminate(&self, id: &str) -> Result<(), UploadError> {
        let session = self
            .lock()
            .remove(id)
            .ok_or_else(|| UploadError::NotFound(id.to_string()))?;
        remove_data(&session.path).await;
        tracing::debug!(upload_id = %id, "Terminated upload session");
        Ok(())
    }

    /// Delete a session's data if it is still present.
    pub async fn discard(&self, id: &str) {
        let removed = self.lock().remove(id);
        if let Some(session) = removed {
            remove_data(&session.path).await;
            tracing::debug!(upload_id = %id, "Released staged upload");
        }
    }

    /// Purge sessions idle for longer than the TTL. Incomplete sessions are
    /// purged whether or not a record owns them; complete ones only when
    /// unclaimed. Returns the purged ids.
    pub async fn purge_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<UploadSession> = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .values()
                .filter(|s| !s.writing && now.duration_since(s.last_activity) > self.ttl)
                .filter(|s| !s.is_complete() || !s.claimed)
                .map(|s| s.id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        let mut purged = Vec::with_capacity(expired.len());
        for session in expired {
            remove_data(&session.path).await;
            if session.claimed {
                self.emit(UploadEvent::Expired {
                    upload_id: session.id.clone(),
                });
            }
            tracing::info!(
                upload_id = %session.id,
                received = session.offset(),
                total = session.total_size,
                "Purged expired upload session"
            );
            purged.push(session.id);
        }
        purged
    }

    /// Run [`purge_expired`](Self::purge_expired) every `interval` until cancelled.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        store.purge_expired().await;
                    }
                }
            }
        })
    }
}

async fn remove_data(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete upload data");
        }
    }
}
