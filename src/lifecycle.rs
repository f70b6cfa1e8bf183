//! Lifecycle operations: create records from URLs, uploads and clones, and
//! remove them along with every stored copy.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinSet;

use crate::downloads::{DownloadError, DownloadManager};
use crate::object_store::StoreSet;
use crate::storage::models::{FileRecord, FileSource, RecordState, ORIGINAL_VARIANT};
use crate::storage::{Database, DatabaseError};
use crate::transfer::{retry, RecordEvent, RetryError, RetryPolicy, TransferPool};
use crate::uploads::{TempStore, UploadError, UploadMetadata};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0}")]
    Validation(String),
    #[error("No file record has id {0}")]
    NotFound(String),
    /// Shutdown stopped a removal; the record is kept so it can be removed again.
    #[error("Removal of {0} was interrupted by shutdown")]
    Interrupted(String),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),
    #[error("Download error: {0}")]
    Download(#[from] DownloadError),
}

/// Identifies a finished (or finishing) upload to turn into a file record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDescriptor {
    pub upload_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveOutcome {
    pub id: String,
    /// Stores whose copy was deleted
    pub deleted_from: Vec<String>,
    /// Stores whose copy could not be deleted and may linger
    pub orphaned: Vec<String>,
}

pub struct Lifecycle {
    db: Database,
    downloads: Arc<DownloadManager>,
    policy: RetryPolicy,
    pool: Arc<TransferPool>,
    stores: StoreSet,
    temp: Arc<TempStore>,
}

impl Lifecycle {
    pub fn new(
        db: Database,
        stores: StoreSet,
        temp: Arc<TempStore>,
        pool: Arc<TransferPool>,
        downloads: Arc<DownloadManager>,
        policy: RetryPolicy,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            downloads,
            policy,
            pool,
            stores,
            temp,
        })
    }

    fn new_record(
        &self,
        name: String,
        mime_type: String,
        byte_size: u64,
        source: FileSource,
    ) -> FileRecord {
        FileRecord::new(
            uuid::Uuid::new_v4().to_string(),
            name,
            mime_type,
            byte_size,
            source,
            self.stores.iter().map(|a| (a.name(), a.is_required())),
        )
    }

    pub fn get(&self, id: &str) -> Result<FileRecord, LifecycleError> {
        self.db
            .get_file(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))
    }

    pub fn list(&self, state: Option<RecordState>) -> Result<Vec<FileRecord>, LifecycleError> {
        Ok(self.db.list_files(state)?)
    }

    /// Create a pending record for a remote file and start fetching it.
    /// Returns without waiting for the fetch.
    pub fn insert_from_url(&self, url: &str) -> Result<FileRecord, LifecycleError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(LifecycleError::Validation("url must not be empty".into()));
        }
        let parsed = reqwest::Url::parse(url)
            .map_err(|e| LifecycleError::Validation(format!("invalid url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
            return Err(LifecycleError::Validation(format!(
                "url must be an absolute http(s) url: '{url}'"
            )));
        }

        let name = parsed
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("file")
            .to_string();
        let mime_type = mime_guess::from_path(&name)
            .first_or_octet_stream()
            .to_string();

        let record = self.new_record(
            name,
            mime_type,
            0,
            FileSource::Url {
                url: parsed.to_string(),
            },
        );
        self.db.put_file(&record)?;
        self.pool.trigger(&record.id);

        tracing::info!(file_id = %record.id, url = %url, "Inserted remote file");
        Ok(record)
    }

    /// Create a record from an upload in the temporary store. The transfer
    /// starts now if the upload is complete, otherwise when it completes.
    pub fn insert_from_upload(
        &self,
        descriptor: &UploadDescriptor,
    ) -> Result<FileRecord, LifecycleError> {
        let upload_id = descriptor.upload_id.trim();
        if upload_id.is_empty() {
            return Err(LifecycleError::Validation("upload_id must not be empty".into()));
        }
        if let Some(ct) = &descriptor.content_type {
            if !ct.contains('/') {
                return Err(LifecycleError::Validation(format!(
                    "content_type '{ct}' is not a MIME type"
                )));
            }
        }
        if self.db.upload_claimed(upload_id)? {
            return Err(LifecycleError::Validation(format!(
                "upload {upload_id} already has a file record"
            )));
        }

        let session = self.temp.claim(upload_id).map_err(|e| match e {
            UploadError::NotFound(_) => {
                LifecycleError::Validation(format!("unknown upload {upload_id}"))
            }
            UploadError::AlreadyClaimed(_) => LifecycleError::Validation(format!(
                "upload {upload_id} already has a file record"
            )),
            other => LifecycleError::Upload(other),
        })?;

        let declared = session.metadata.content_type.as_deref();
        if let (Some(given), Some(declared)) = (descriptor.content_type.as_deref(), declared) {
            if !given.eq_ignore_ascii_case(declared) {
                self.temp.release_claim(upload_id);
                return Err(LifecycleError::Validation(format!(
                    "content_type '{given}' does not match uploaded type '{declared}'"
                )));
            }
        }

        let name = descriptor
            .name
            .clone()
            .or_else(|| session.metadata.filename.clone())
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "upload".to_string());
        let mime_type = descriptor
            .content_type
            .clone()
            .or_else(|| session.metadata.content_type.clone())
            .unwrap_or_else(|| mime_guess::from_path(&name).first_or_octet_stream().to_string());

        let record = self.new_record(
            name,
            mime_type.to_lowercase(),
            session.total_size,
            FileSource::Upload {
                upload_id: upload_id.to_string(),
            },
        );
        if let Err(e) = self.db.put_file(&record) {
            self.temp.release_claim(upload_id);
            return Err(e.into());
        }

        // Re-check after the record exists: a completion that raced with
        // creation found no record to trigger.
        if self.temp.get(upload_id).is_some_and(|s| s.is_complete()) {
            self.pool.trigger(&record.id);
        }

        tracing::info!(file_id = %record.id, upload_id = %upload_id, "Inserted uploaded file");
        Ok(record)
    }

    /// Delete every stored copy of a record, then the record itself.
    pub async fn remove(&self, id: &str) -> Result<RemoveOutcome, LifecycleError> {
        if self.db.get_file(id)?.is_none() {
            return Err(LifecycleError::NotFound(id.to_string()));
        }

        // Held until the record is gone, so no transfer can write behind us.
        let claim = self.pool.claim_exclusive(id).await;
        let record = self
            .db
            .get_file(id)?
            .ok_or_else(|| LifecycleError::NotFound(id.to_string()))?;

        let mut outcome = RemoveOutcome {
            id: id.to_string(),
            deleted_from: Vec::new(),
            orphaned: Vec::new(),
        };

        for entry in &record.stores {
            let Some(adapter) = self.stores.get(&entry.store_name).cloned() else {
                tracing::warn!(file_id = %id, store = %entry.store_name, "Store no longer configured");
                outcome.orphaned.push(entry.store_name.clone());
                continue;
            };

            let deleted = retry(&self.policy, claim.token(), "delete", |_| {
                let adapter = Arc::clone(&adapter);
                let id = id.to_string();
                async move { adapter.delete(&id, ORIGINAL_VARIANT).await }
            })
            .await;

            match deleted {
                Ok(_) => outcome.deleted_from.push(entry.store_name.clone()),
                Err(RetryError::Exhausted { attempts, last }) => {
                    tracing::warn!(
                        file_id = %id,
                        store = %entry.store_name,
                        attempts,
                        error = %last,
                        "Failed to delete stored copy"
                    );
                    outcome.orphaned.push(entry.store_name.clone());
                }
                Err(RetryError::Cancelled) => {
                    tracing::warn!(
                        file_id = %id,
                        store = %entry.store_name,
                        deleted = ?outcome.deleted_from,
                        "Removal interrupted by shutdown, keeping record"
                    );
                    return Err(LifecycleError::Interrupted(id.to_string()));
                }
            }
        }

        self.db.delete_file(id)?;
        if let Some(upload_id) = record.source.upload_id() {
            self.temp.discard(upload_id).await;
        }
        drop(claim);

        self.pool.notify(RecordEvent::Removed {
            file_id: id.to_string(),
        });
        tracing::info!(
            file_id = %id,
            deleted = outcome.deleted_from.len(),
            orphaned = outcome.orphaned.len(),
            "Removed file"
        );
        Ok(outcome)
    }

    /// Remove every record concurrently. One failure does not stop the others.
    pub async fn remove_all(
        self: &Arc<Self>,
    ) -> Result<Vec<(String, Result<RemoveOutcome, LifecycleError>)>, LifecycleError> {
        let records = self.db.get_all_files()?;

        let mut tasks = JoinSet::new();
        for record in records {
            let lifecycle = Arc::clone(self);
            tasks.spawn(async move {
                let result = lifecycle.remove(&record.id).await;
                (record.id, result)
            });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(error = %e, "Remove task panicked"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// Copy a ready record's bytes into a new, independent record.
    pub async fn clone_file(&self, id: &str) -> Result<FileRecord, LifecycleError> {
        let source = self.get(id)?;
        if !source.is_ready() {
            return Err(LifecycleError::Validation(format!(
                "file {id} is not ready to clone"
            )));
        }

        let data = self.downloads.read_original(&source).await?;
        let byte_size = data.len() as u64;
        let staged = self
            .temp
            .stage(
                data,
                UploadMetadata {
                    filename: Some(source.name.clone()),
                    content_type: Some(source.mime_type.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let record = self.new_record(
            source.name.clone(),
            source.mime_type.clone(),
            byte_size,
            FileSource::Clone {
                source_id: source.id.clone(),
                upload_id: staged.id.clone(),
            },
        );
        if let Err(e) = self.db.put_file(&record) {
            self.temp.discard(&staged.id).await;
            return Err(e.into());
        }
        self.pool.trigger(&record.id);

        tracing::info!(file_id = %record.id, source_id = %id, "Cloned file");
        Ok(record)
    }

    /// Check whether a store still holds a record's original bytes.
    pub async fn stored_in(&self, id: &str, store_name: &str) -> Result<bool, LifecycleError> {
        let Some(adapter) = self.stores.get(store_name) else {
            return Err(LifecycleError::Validation(format!(
                "unknown store '{store_name}'"
            )));
        };
        adapter
            .exists(id, ORIGINAL_VARIANT)
            .await
            .map_err(|e| LifecycleError::Download(DownloadError::Store(e)))
    }
}
