//! Serves stored bytes for a file record from the first store holding a
//! complete copy, in configured preference order.

use bytes::Bytes;
use thiserror::Error;

use crate::object_store::{StoreError, StoreSet};
use crate::storage::models::{EntryStatus, FileRecord, ORIGINAL_VARIANT};
use crate::storage::{Database, DatabaseError};

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("File not found: {0}")]
    NotFound(String),
    #[error("Range not satisfiable for a {size}-byte file")]
    RangeNotSatisfiable { size: u64 },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// A single range from a `Range: bytes=...` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteRangeSpec {
    /// `bytes=a-b`
    FromTo(u64, u64),
    /// `bytes=a-`
    From(u64),
    /// `bytes=-n`: the last n bytes
    Suffix(u64),
}

impl ByteRangeSpec {
    /// Parse a `Range` header. Multiple ranges and malformed headers yield
    /// `None`, which callers treat as a request for the whole file.
    pub fn parse(header: &str) -> Option<Self> {
        let ranges = header.trim().strip_prefix("bytes=")?.trim();
        if ranges.contains(',') {
            return None;
        }
        let (start, end) = ranges.split_once('-')?;
        let (start, end) = (start.trim(), end.trim());

        match (start.is_empty(), end.is_empty()) {
            (true, false) => end.parse().ok().map(ByteRangeSpec::Suffix),
            (false, true) => start.parse().ok().map(ByteRangeSpec::From),
            (false, false) => {
                let (a, b): (u64, u64) = (start.parse().ok()?, end.parse().ok()?);
                (a <= b).then_some(ByteRangeSpec::FromTo(a, b))
            }
            (true, true) => None,
        }
    }

    /// Resolve against a file size to an inclusive `(start, end)`, or `None`
    /// if unsatisfiable.
    pub fn resolve(&self, size: u64) -> Option<(u64, u64)> {
        if size == 0 {
            return None;
        }
        match *self {
            ByteRangeSpec::FromTo(a, b) if a < size => Some((a, b.min(size - 1))),
            ByteRangeSpec::From(a) if a < size => Some((a, size - 1)),
            ByteRangeSpec::Suffix(n) if n > 0 => Some((size.saturating_sub(n), size - 1)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Download {
    pub file_id: String,
    pub name: String,
    pub content_type: String,
    pub store_name: String,
    /// Size of the whole stored variant
    pub total_size: u64,
    /// Inclusive range served, when the request asked for one
    pub range: Option<(u64, u64)>,
    pub data: Bytes,
    pub cache_control: String,
}

pub struct DownloadManager {
    cache_control: String,
    db: Database,
    stores: StoreSet,
}

impl DownloadManager {
    pub fn new(db: Database, stores: StoreSet, cache_control: impl Into<String>) -> Self {
        Self {
            cache_control: cache_control.into(),
            db,
            stores,
        }
    }

    pub async fn serve(
        &self,
        file_id: &str,
        variant: &str,
        range: Option<ByteRangeSpec>,
    ) -> Result<Download, DownloadError> {
        let record = self
            .db
            .get_file(file_id)?
            .ok_or_else(|| DownloadError::NotFound(file_id.to_string()))?;
        self.serve_record(&record, variant, range).await
    }

    /// Read a record's whole original bytes.
    pub async fn read_original(&self, record: &FileRecord) -> Result<Bytes, DownloadError> {
        Ok(self
            .serve_record(record, ORIGINAL_VARIANT, None)
            .await?
            .data)
    }

    async fn serve_record(
        &self,
        record: &FileRecord,
        variant: &str,
        range: Option<ByteRangeSpec>,
    ) -> Result<Download, DownloadError> {
        let mut last_error: Option<StoreError> = None;

        for adapter in self.stores.iter() {
            let Some(entry) = record.entry(adapter.name()) else {
                continue;
            };
            if entry.status != EntryStatus::Complete {
                continue;
            }

            // Only the original's stored size is recorded; other variants are
            // sized by reading them.
            let known_size = (variant == ORIGINAL_VARIANT)
                .then(|| entry.byte_size.unwrap_or(record.byte_size));

            let result = match (range, known_size) {
                (Some(wanted), Some(size)) => {
                    let (start, end) = wanted
                        .resolve(size)
                        .ok_or(DownloadError::RangeNotSatisfiable { size })?;
                    adapter
                        .get_range(&record.id, variant, start, end)
                        .await
                        .map(|data| (data, size, Some((start, end))))
                }
                (Some(wanted), None) => match adapter.get(&record.id, variant).await {
                    Ok(data) => {
                        let size = data.len() as u64;
                        let (start, end) = wanted
                            .resolve(size)
                            .ok_or(DownloadError::RangeNotSatisfiable { size })?;
                        Ok((
                            data.slice(start as usize..=end as usize),
                            size,
                            Some((start, end)),
                        ))
                    }
                    Err(e) => Err(e),
                },
                (None, _) => adapter
                    .get(&record.id, variant)
                    .await
                    .map(|data| {
                        let size = data.len() as u64;
                        (data, size, None)
                    }),
            };

            match result {
                Ok((data, total_size, range)) => {
                    return Ok(Download {
                        file_id: record.id.clone(),
                        name: record.name.clone(),
                        content_type: record.mime_type.clone(),
                        store_name: adapter.name().to_string(),
                        total_size,
                        range,
                        data,
                        cache_control: self.cache_control.clone(),
                    });
                }
                Err(StoreError::InvalidRange { .. }) => {
                    let size = known_size.unwrap_or(record.byte_size);
                    return Err(DownloadError::RangeNotSatisfiable { size });
                }
                Err(e) => {
                    tracing::warn!(
                        file_id = %record.id,
                        store = %adapter.name(),
                        variant,
                        error = %e,
                        "Store could not serve file, trying next"
                    );
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e @ StoreError::Read { .. }) => Err(DownloadError::Store(e)),
            _ => Err(DownloadError::NotFound(record.id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_forms() {
        assert_eq!(
            ByteRangeSpec::parse("bytes=0-99"),
            Some(ByteRangeSpec::FromTo(0, 99))
        );
        assert_eq!(
            ByteRangeSpec::parse("bytes=500-"),
            Some(ByteRangeSpec::From(500))
        );
        assert_eq!(
            ByteRangeSpec::parse("bytes=-20"),
            Some(ByteRangeSpec::Suffix(20))
        );
    }

    #[test]
    fn test_parse_range_ignores_unsupported() {
        assert_eq!(ByteRangeSpec::parse("bytes=0-1,5-6"), None);
        assert_eq!(ByteRangeSpec::parse("items=0-1"), None);
        assert_eq!(ByteRangeSpec::parse("bytes=9-3"), None);
        assert_eq!(ByteRangeSpec::parse("bytes=-"), None);
        assert_eq!(ByteRangeSpec::parse("bytes=a-b"), None);
    }

    #[test]
    fn test_resolve_clamps_end() {
        assert_eq!(ByteRangeSpec::FromTo(5, 1000).resolve(100), Some((5, 99)));
        assert_eq!(ByteRangeSpec::From(10).resolve(100), Some((10, 99)));
        assert_eq!(ByteRangeSpec::Suffix(30).resolve(100), Some((70, 99)));
        assert_eq!(ByteRangeSpec::Suffix(300).resolve(100), Some((0, 99)));
    }

    #[test]
    fn test_resolve_unsatisfiable() {
        assert_eq!(ByteRangeSpec::From(100).resolve(100), None);
        assert_eq!(ByteRangeSpec::FromTo(200, 300).resolve(100), None);
        assert_eq!(ByteRangeSpec::Suffix(0).resolve(100), None);
        assert_eq!(ByteRangeSpec::From(0).resolve(0), None);
    }
}
