//! Units of work handed to a storage provider's batch executor.

use crate::models::metadata::EntryMetadata;
use std::path::PathBuf;

/// What a batch entry does to its key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BatchOp {
    /// Upload the file at `path` (already encoded) under the entry key.
    Write { path: PathBuf, metadata: EntryMetadata },
    /// Remove the key.
    Delete,
}

/// One key-level write or delete inside an `apply_batch` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchEntry {
    pub key: String,
    /// Size of the bytes at `path` (0 for deletes).
    pub size: u64,
    pub op: BatchOp,
}

impl BatchEntry {
    pub fn write(key: impl Into<String>, path: impl Into<PathBuf>, size: u64, metadata: EntryMetadata) -> Self {
        Self {
            key: key.into(),
            size,
            op: BatchOp::Write {
                path: path.into(),
                metadata,
            },
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            op: BatchOp::Delete,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self.op, BatchOp::Write { .. })
    }
}

/// Per-entry results of a batch run. Failures never abort siblings.
#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    /// `(key, error message)` for every entry that exhausted its retries
    /// or hit a non-retryable error.
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    pub fn merge(&mut self, other: BatchReport) {
        self.succeeded.extend(other.succeeded);
        self.failed.extend(other.failed);
    }
}
