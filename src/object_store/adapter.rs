use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

use super::{LocalStore, ObjectStore, ObjectStoreError, S3Store};
use crate::config::{ObjectAcl, StorageBackend, StoreConfig};

/// Pure transformation applied to bytes before they are written to a store.
pub type TransformWrite = Arc<dyn Fn(Bytes) -> Bytes + Send + Sync>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("write to store '{store}' failed: {source}")]
    Write {
        store: String,
        #[source]
        source: ObjectStoreError,
    },
    #[error("'{key}' not found in store '{store}'")]
    NotFound { store: String, key: String },
    #[error("range {start}-{end} not satisfiable for '{key}' in store '{store}'")]
    InvalidRange {
        store: String,
        key: String,
        start: u64,
        end: u64,
    },
    #[error("read from store '{store}' failed: {source}")]
    Read {
        store: String,
        #[source]
        source: ObjectStoreError,
    },
    #[error("delete from store '{store}' failed: {source}")]
    Delete {
        store: String,
        #[source]
        source: ObjectStoreError,
    },
}

/// Where a store placed a written variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRef {
    pub store_name: String,
    pub remote_id: String,
    /// Size of the stored object, after any write transform
    pub byte_size: u64,
}

/// A named durable store: an object store backend plus the policy applied to it.
pub struct StoreAdapter {
    acl: ObjectAcl,
    backend: Arc<dyn ObjectStore>,
    name: String,
    required: bool,
    transform_write: Option<TransformWrite>,
}

impl fmt::Debug for StoreAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreAdapter")
            .field("name", &self.name)
            .field("acl", &self.acl)
            .field("required", &self.required)
            .field("transform_write", &self.transform_write.is_some())
            .finish()
    }
}

impl StoreAdapter {
    pub fn new(name: impl Into<String>, backend: Arc<dyn ObjectStore>) -> Self {
        Self {
            acl: ObjectAcl::default(),
            backend,
            name: name.into(),
            required: true,
            transform_write: None,
        }
    }

    /// Build an adapter and its backend from configuration.
    pub fn from_config(config: &StoreConfig) -> Result<Self, anyhow::Error> {
        let backend: Arc<dyn ObjectStore> = match config.backend {
            StorageBackend::Local => Arc::new(LocalStore::new(&config.local_path)?),
            StorageBackend::S3 => {
                let s3 = config
                    .s3
                    .as_ref()
                    .ok_or_else(|| anyhow::anyhow!("store '{}' has no s3 settings", config.name))?;
                Arc::new(S3Store::new(s3, config.acl)?)
            }
        };

        Ok(Self::new(config.name.clone(), backend)
            .with_acl(config.acl)
            .with_required(config.required))
    }

    pub fn with_acl(mut self, acl: ObjectAcl) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_transform(mut self, transform: TransformWrite) -> Self {
        self.transform_write = Some(transform);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acl(&self) -> ObjectAcl {
        self.acl
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn object_key(file_id: &str, variant: &str) -> String {
        format!("{file_id}/{variant}")
    }

    pub async fn put(
        &self,
        file_id: &str,
        variant: &str,
        data: Bytes,
    ) -> Result<StoreRef, StoreError> {
        let data = match &self.transform_write {
            Some(transform) => transform(data),
            None => data,
        };
        let byte_size = data.len() as u64;
        let key = Self::object_key(file_id, variant);

        self.backend
            .put(&key, data)
            .await
            .map_err(|source| StoreError::Write {
                store: self.name.clone(),
                source,
            })?;

        Ok(StoreRef {
            store_name: self.name.clone(),
            remote_id: key,
            byte_size,
        })
    }

    pub async fn get(&self, file_id: &str, variant: &str) -> Result<Bytes, StoreError> {
        let key = Self::object_key(file_id, variant);
        self.backend
            .get(&key)
            .await
            .map_err(|e| self.read_error(key, e))
    }

    /// Read the inclusive byte range `start..=end` of a stored variant.
    pub async fn get_range(
        &self,
        file_id: &str,
        variant: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, StoreError> {
        let key = Self::object_key(file_id, variant);
        self.backend
            .get_range(&key, start, end)
            .await
            .map_err(|e| self.read_error(key, e))
    }

    pub async fn delete(&self, file_id: &str, variant: &str) -> Result<(), StoreError> {
        let key = Self::object_key(file_id, variant);
        self.backend
            .delete(&key)
            .await
            .map_err(|source| StoreError::Delete {
                store: self.name.clone(),
                source,
            })
    }

    pub async fn exists(&self, file_id: &str, variant: &str) -> Result<bool, StoreError> {
        let key = Self::object_key(file_id, variant);
        self.backend
            .exists(&key)
            .await
            .map_err(|e| self.read_error(key, e))
    }

    fn read_error(&self, key: String, e: ObjectStoreError) -> StoreError {
        match e {
            ObjectStoreError::NotFound(_) => StoreError::NotFound {
                store: self.name.clone(),
                key,
            },
            ObjectStoreError::InvalidRange { start, end, .. } => StoreError::InvalidRange {
                store: self.name.clone(),
                key,
                start,
                end,
            },
            source => StoreError::Read {
                store: self.name.clone(),
                source,
            },
        }
    }
}

/// The configured stores, in download preference order.
#[derive(Debug, Clone, Default)]
pub struct StoreSet {
    adapters: Vec<Arc<StoreAdapter>>,
}

impl StoreSet {
    pub fn new(adapters: Vec<StoreAdapter>) -> Self {
        Self {
            adapters: adapters.into_iter().map(Arc::new).collect(),
        }
    }

    pub fn from_config(stores: &[StoreConfig]) -> Result<Self, anyhow::Error> {
        let adapters = stores
            .iter()
            .map(StoreAdapter::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(adapters))
    }

    pub fn get(&self, name: &str) -> Option<&Arc<StoreAdapter>> {
        self.adapters.iter().find(|a| a.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<StoreAdapter>> {
        self.adapters.iter()
    }

    pub fn is_required(&self, name: &str) -> bool {
        self.get(name).map(|a| a.is_required()).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
