use redb::ReadableTable;

use super::db::{Database, DatabaseError};
use super::models::{FileRecord, RecordState};
use super::tables::*;

impl Database {
    // ========================================================================
    // File operations
    // ========================================================================

    /// Store a file record and index it by its temporary-store upload, if any
    pub fn put_file(&self, file: &FileRecord) -> Result<(), DatabaseError> {
        debug_assert!(!file.id.is_empty(), "file id must not be empty");

        let write_txn = self.begin_write()?;
        {
            let mut table = write_txn.open_table(FILES)?;
            let data = rmp_serde::to_vec_named(file)?;
            table.insert(file.id.as_str(), data.as_slice())?;

            if let Some(upload_id) = file.source.upload_id() {
                let mut upload_table = write_txn.open_table(UPLOAD_FILES)?;
                upload_table.insert(upload_id, file.id.as_str())?;
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Get a file by its UUID
    pub fn get_file(&self, id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        match table.get(id)? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Get the file created from an upload (resolves upload id -> uuid -> file)
    pub fn get_file_by_upload(&self, upload_id: &str) -> Result<Option<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let upload_table = read_txn.open_table(UPLOAD_FILES)?;

        let id = match upload_table.get(upload_id)? {
            Some(data) => data.value().to_string(),
            None => return Ok(None),
        };

        let files_table = read_txn.open_table(FILES)?;
        match files_table.get(id.as_str())? {
            Some(data) => {
                let file: FileRecord = rmp_serde::from_slice(data.value())?;
                Ok(Some(file))
            }
            None => Ok(None),
        }
    }

    /// Check if a record has already been created from an upload
    pub fn upload_claimed(&self, upload_id: &str) -> Result<bool, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(UPLOAD_FILES)?;
        Ok(table.get(upload_id)?.is_some())
    }

    /// Delete a file by its UUID and clean up the upload index
    pub fn delete_file(&self, id: &str) -> Result<bool, DatabaseError> {
        let write_txn = self.begin_write()?;

        let existing: Option<FileRecord> = {
            let table = write_txn.open_table(FILES)?;
            let result = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        let deleted = match existing {
            Some(file) => {
                {
                    let mut table = write_txn.open_table(FILES)?;
                    table.remove(id)?;
                }
                if let Some(upload_id) = file.source.upload_id() {
                    let mut upload_table = write_txn.open_table(UPLOAD_FILES)?;
                    upload_table.remove(upload_id)?;
                }
                true
            }
            None => false,
        };

        write_txn.commit()?;
        Ok(deleted)
    }

    /// Apply `f` to a stored record inside one write transaction.
    ///
    /// Returns the updated record, or `None` if the record no longer exists.
    /// A missing record is never re-created, so a late worker write cannot
    /// resurrect a deleted file.
    pub fn update_file<F>(&self, id: &str, f: F) -> Result<Option<FileRecord>, DatabaseError>
    where
        F: FnOnce(&mut FileRecord),
    {
        let write_txn = self.begin_write()?;

        let existing: Option<FileRecord> = {
            let table = write_txn.open_table(FILES)?;
            let result = match table.get(id)? {
                Some(data) => Some(rmp_serde::from_slice(data.value())?),
                None => None,
            };
            result
        };

        let updated = match existing {
            Some(mut file) => {
                f(&mut file);
                file.updated_at = chrono::Utc::now();

                let serialized = rmp_serde::to_vec_named(&file)?;
                let mut table = write_txn.open_table(FILES)?;
                table.insert(id, serialized.as_slice())?;
                Some(file)
            }
            None => None,
        };

        write_txn.commit()?;
        Ok(updated)
    }

    /// Get all files, ordered by id
    pub fn get_all_files(&self) -> Result<Vec<FileRecord>, DatabaseError> {
        let read_txn = self.begin_read()?;
        let table = read_txn.open_table(FILES)?;

        let mut files = Vec::new();
        for result in table.iter()? {
            let (_, value) = result?;
            let file: FileRecord = rmp_serde::from_slice(value.value())?;
            files.push(file);
        }

        Ok(files)
    }

    /// List files newest first, optionally filtered by derived state
    pub fn list_files(&self, state: Option<RecordState>) -> Result<Vec<FileRecord>, DatabaseError> {
        let mut files = self.get_all_files()?;
        if let Some(state) = state {
            files.retain(|f| f.state() == state);
        }
        files.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(files)
    }
}
