use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The rendition written by the transfer workers.
pub const ORIGINAL_VARIANT: &str = "original";

/// Transfer status of one store's copy of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    Pending,
    Transferring,
    Complete,
    Failed,
}

impl EntryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, EntryStatus::Complete | EntryStatus::Failed)
    }
}

/// Overall state of a record, derived from its store entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordState {
    Pending,
    Transferring,
    Ready,
    Failed,
}

impl std::str::FromStr for RecordState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordState::Pending),
            "transferring" => Ok(RecordState::Transferring),
            "ready" => Ok(RecordState::Ready),
            "failed" => Ok(RecordState::Failed),
            other => Err(format!("unknown record state '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreEntry {
    pub store_name: String,
    pub required: bool,
    pub status: EntryStatus,
    #[serde(default)]
    pub remote_id: Option<String>,
    /// Size of the stored object, which differs from the record size when the
    /// store transforms writes
    #[serde(default)]
    pub byte_size: Option<u64>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl StoreEntry {
    pub fn pending(store_name: &str, required: bool) -> Self {
        Self {
            store_name: store_name.to_string(),
            required,
            status: EntryStatus::Pending,
            remote_id: None,
            byte_size: None,
            attempts: 0,
            last_error: None,
            updated_at: Utc::now(),
        }
    }
}

/// Where a record's bytes come from. Lookup only; the record never owns its source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSource {
    Url { url: String },
    Upload { upload_id: String },
    /// Bytes copied from another record and staged in the temporary store
    Clone { source_id: String, upload_id: String },
}

impl FileSource {
    /// The temporary-store session holding this record's bytes, if any.
    pub fn upload_id(&self) -> Option<&str> {
        match self {
            FileSource::Url { .. } => None,
            FileSource::Upload { upload_id } | FileSource::Clone { upload_id, .. } => {
                Some(upload_id)
            }
        }
    }
}

/// A file record stored in redb
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: String,
    /// Original filename
    pub name: String,
    pub mime_type: String,
    pub byte_size: u64,
    pub source: FileSource,
    /// One entry per configured store, in preference order
    pub stores: Vec<StoreEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new<'a>(
        id: String,
        name: String,
        mime_type: String,
        byte_size: u64,
        source: FileSource,
        stores: impl IntoIterator<Item = (&'a str, bool)>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            name,
            mime_type,
            byte_size,
            source,
            stores: stores
                .into_iter()
                .map(|(name, required)| StoreEntry::pending(name, required))
                .collect(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn entry(&self, store_name: &str) -> Option<&StoreEntry> {
        self.stores.iter().find(|e| e.store_name == store_name)
    }

    pub fn entry_mut(&mut self, store_name: &str) -> Option<&mut StoreEntry> {
        self.stores.iter_mut().find(|e| e.store_name == store_name)
    }

    /// Ready once any required store holds a complete copy.
    pub fn is_ready(&self) -> bool {
        self.stores
            .iter()
            .any(|e| e.required && e.status == EntryStatus::Complete)
    }

    pub fn state(&self) -> RecordState {
        if self.is_ready() {
            return RecordState::Ready;
        }
        let mut required = self.stores.iter().filter(|e| e.required).peekable();
        if required.peek().is_some() && required.all(|e| e.status == EntryStatus::Failed) {
            return RecordState::Failed;
        }
        if self
            .stores
            .iter()
            .any(|e| e.status == EntryStatus::Transferring)
        {
            return RecordState::Transferring;
        }
        RecordState::Pending
    }

    /// True when no entry will change without outside intervention.
    pub fn is_settled(&self) -> bool {
        self.stores.iter().all(|e| e.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(stores: &[(&str, bool)]) -> FileRecord {
        FileRecord::new(
            "f1".to_string(),
            "cat.png".to_string(),
            "image/png".to_string(),
            10,
            FileSource::Url {
                url: "https://example.com/cat.png".to_string(),
            },
            stores.iter().copied(),
        )
    }

    #[test]
    fn test_new_record_is_pending() {
        let r = record(&[("a", true), ("b", false)]);
        assert_eq!(r.state(), RecordState::Pending);
        assert!(!r.is_ready());
        assert!(!r.is_settled());
        assert_eq!(r.stores.len(), 2);
    }

    #[test]
    fn test_ready_when_required_entry_complete() {
        let mut r = record(&[("a", true), ("b", true)]);
        r.entry_mut("b").unwrap().status = EntryStatus::Complete;
        r.entry_mut("a").unwrap().status = EntryStatus::Transferring;
        assert_eq!(r.state(), RecordState::Ready);
        assert!(r.is_ready());
    }

    #[test]
    fn test_optional_entry_does_not_make_ready() {
        let mut r = record(&[("a", true), ("b", false)]);
        r.entry_mut("b").unwrap().status = EntryStatus::Complete;
        assert!(!r.is_ready());
        assert_eq!(r.state(), RecordState::Pending);
    }

    #[test]
    fn test_failed_when_all_required_failed() {
        let mut r = record(&[("a", true), ("b", false)]);
        r.entry_mut("a").unwrap().status = EntryStatus::Failed;
        r.entry_mut("b").unwrap().status = EntryStatus::Transferring;
        assert_eq!(r.state(), RecordState::Failed);
    }

    #[test]
    fn test_transferring_state() {
        let mut r = record(&[("a", true), ("b", true)]);
        r.entry_mut("a").unwrap().status = EntryStatus::Failed;
        r.entry_mut("b").unwrap().status = EntryStatus::Transferring;
        assert_eq!(r.state(), RecordState::Transferring);
    }

    #[test]
    fn test_source_upload_id() {
        let clone = FileSource::Clone {
            source_id: "f0".to_string(),
            upload_id: "u1".to_string(),
        };
        assert_eq!(clone.upload_id(), Some("u1"));
        let url = FileSource::Url {
            url: "https://example.com".to_string(),
        };
        assert_eq!(url.upload_id(), None);
    }
}
