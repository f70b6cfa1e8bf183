use std::path::PathBuf;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::UploadMetadata;

/// Sorted set of non-overlapping half-open byte intervals.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ByteRanges {
    ranges: Vec<(u64, u64)>,
}

impl ByteRanges {
    /// Add `[start, end)`, merging with any touching or overlapping interval.
    pub fn insert(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let mut merged = (start, end);
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;

        for &(s, e) in &self.ranges {
            if e < merged.0 {
                out.push((s, e));
            } else if s > merged.1 {
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push((s, e));
            } else {
                merged = (merged.0.min(s), merged.1.max(e));
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Length of the gap-free prefix starting at byte 0.
    pub fn contiguous_len(&self) -> u64 {
        match self.ranges.first() {
            Some(&(0, end)) => end,
            _ => 0,
        }
    }

    pub fn covers(&self, total: u64) -> bool {
        total == 0 || self.contiguous_len() >= total
    }

    pub fn as_slice(&self) -> &[(u64, u64)] {
        &self.ranges
    }
}

/// A resumable upload held by the temporary store.
#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: String,
    pub total_size: u64,
    pub received: ByteRanges,
    pub metadata: UploadMetadata,
    /// Backing file in the staging directory
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_activity: Instant,
    /// Set once a file record has been created from this upload
    pub claimed: bool,
    pub(super) writing: bool,
}

impl UploadSession {
    pub(super) fn new(id: String, total_size: u64, metadata: UploadMetadata, path: PathBuf) -> Self {
        Self {
            id,
            total_size,
            received: ByteRanges::default(),
            metadata,
            path,
            created_at: Utc::now(),
            last_activity: Instant::now(),
            claimed: false,
            writing: false,
        }
    }

    /// The offset the next chunk must start at.
    pub fn offset(&self) -> u64 {
        self.received.contiguous_len()
    }

    pub fn is_complete(&self) -> bool {
        self.received.covers(self.total_size)
    }
}
