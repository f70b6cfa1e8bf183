mod adapter;
mod local;
mod s3;

pub use adapter::{StoreAdapter, StoreError, StoreRef, StoreSet, TransformWrite};
pub use local::LocalStore;
pub use s3::S3Store;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Object not found: {0}")]
    NotFound(String),
    #[error("Requested range {start}-{end} is outside object {key}")]
    InvalidRange { key: String, start: u64, end: u64 },
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Abstraction over object storage backends.
/// Keys are `{file_id}/{variant}` -- the raw blobs are meaningless without the metadata DB.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), ObjectStoreError>;
    async fn get(&self, key: &str) -> Result<Bytes, ObjectStoreError>;
    async fn delete(&self, key: &str) -> Result<(), ObjectStoreError>;
    async fn exists(&self, key: &str) -> Result<bool, ObjectStoreError>;

    /// Read the inclusive byte range `start..=end`.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes, ObjectStoreError> {
        let data = self.get(key).await?;
        if start > end || end >= data.len() as u64 {
            return Err(ObjectStoreError::InvalidRange {
                key: key.to_string(),
                start,
                end,
            });
        }
        Ok(data.slice(start as usize..=end as usize))
    }
}
