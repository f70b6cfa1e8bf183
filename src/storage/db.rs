use redb::{Database as RedbDatabase, ReadTransaction, ReadableTable, WriteTransaction};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::tables::{FILES, UPLOAD_FILES};

const DB_FILE: &str = "file-lifecycle.redb";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Redb(Box<redb::Error>),
    #[error("Could not decode record: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),
    #[error("Could not encode record: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// redb splits its failures across several types; they all collapse into
/// `redb::Error`, boxed to keep `DatabaseError` small.
macro_rules! from_redb {
    ($($ty:ty),+) => {
        $(impl From<$ty> for DatabaseError {
            fn from(e: $ty) -> Self {
                DatabaseError::Redb(Box::new(e.into()))
            }
        })+
    };
}

from_redb!(
    redb::Error,
    redb::CommitError,
    redb::DatabaseError,
    redb::StorageError,
    redb::TableError,
    redb::TransactionError
);

/// Handle to the record database. Clones share one redb instance.
#[derive(Clone)]
pub struct Database {
    db: Arc<RedbDatabase>,
}

#[derive(Debug, Default)]
pub struct PurgeStats {
    /// File records dropped
    pub files: u64,
}

impl Database {
    /// Open (creating if needed) `file-lifecycle.redb` under `data_dir`.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self, DatabaseError> {
        std::fs::create_dir_all(data_dir.as_ref())?;
        let db = RedbDatabase::create(data_dir.as_ref().join(DB_FILE))?;

        let write_txn = db.begin_write()?;
        write_txn.open_table(FILES)?;
        write_txn.open_table(UPLOAD_FILES)?;
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn begin_read(&self) -> Result<ReadTransaction, DatabaseError> {
        Ok(self.db.begin_read()?)
    }

    pub fn begin_write(&self) -> Result<WriteTransaction, DatabaseError> {
        Ok(self.db.begin_write()?)
    }

    /// Drop every record and the upload index in one transaction.
    /// Stored objects are left alone.
    pub fn purge_all(&self) -> Result<PurgeStats, DatabaseError> {
        let write_txn = self.begin_write()?;
        let files = write_txn.open_table(FILES)?.iter()?.count() as u64;

        write_txn.delete_table(FILES)?;
        write_txn.delete_table(UPLOAD_FILES)?;
        write_txn.open_table(FILES)?;
        write_txn.open_table(UPLOAD_FILES)?;
        write_txn.commit()?;

        tracing::info!(files, "Purged record database");
        Ok(PurgeStats { files })
    }
}
