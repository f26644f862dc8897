//! Storage provider contract and the backends that implement it.
//!
//! Callers hold a [`Backend`] (or any [`StorageProvider`]) and never branch on
//! which concrete store sits behind it. Each backend decides for itself how
//! listing is paginated, whether objects must be chunked, and how metadata is
//! carried on the wire.

pub mod kv;
pub mod local;
#[cfg(test)]
pub mod memory;
pub mod s3;

use crate::models::{
    asset::AssetVariantMetadata,
    batch::{BatchEntry, BatchReport},
    metadata::EntryMetadata,
};
use crate::services::{
    batch::{self, BatchOptions},
    keys::chunk_key,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::io;
use thiserror::Error;

pub use kv::{KvConfig, KvStore};
pub use local::LocalStore;
pub use s3::{S3Config, S3Store};

/// HTTP statuses that signal a transient condition on the backend side.
pub const RETRYABLE_STATUSES: [u16; 8] = [408, 409, 423, 429, 500, 502, 503, 504];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("backend returned HTTP {status} for `{key}`: {body}")]
    Http { status: u16, key: String, body: String },
    #[error("backend service error: {message}")]
    Service { message: String, retryable: bool },
    #[error("object `{key}` is incomplete: {reason}")]
    Inconsistent { key: String, reason: String },
    #[error("invalid object key `{0}`")]
    InvalidKey(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl StorageError {
    /// Whether the failed call may succeed if repeated later.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Transport(_) => true,
            StorageError::Http { status, .. } => RETRYABLE_STATUSES.contains(status),
            StorageError::Service { retryable, .. } => *retryable,
            StorageError::Sqlx(sqlx::Error::PoolTimedOut) => true,
            StorageError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Short label used in retry logs.
    pub fn reason(&self) -> String {
        match self {
            StorageError::Transport(err) if err.is_timeout() => "timeout".into(),
            StorageError::Transport(err) if err.is_connect() => "connect".into(),
            StorageError::Transport(_) => "transport".into(),
            StorageError::Http { status, .. } => format!("http {status}"),
            StorageError::Service { .. } => "service".into(),
            StorageError::Inconsistent { .. } => "inconsistent".into(),
            StorageError::InvalidKey(_) => "invalid key".into(),
            StorageError::Sqlx(_) => "sqlite".into(),
            StorageError::Io(_) => "io".into(),
            StorageError::Json(_) => "json".into(),
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Object body plus metadata.
#[derive(Clone, Debug)]
pub struct Entry {
    pub body: Bytes,
    pub metadata: EntryMetadata,
}

/// Metadata probe result; the body is not transferred.
#[derive(Clone, Debug)]
pub struct EntryInfo {
    pub metadata: EntryMetadata,
    /// Stored size when the backend reports it.
    pub size: Option<u64>,
}

#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Maximum bytes per stored object, `None` when unbounded.
    fn chunk_size(&self) -> Option<u64>;

    /// Every key starting with `prefix`, following pagination to the end.
    ///
    /// `Ok(None)` means the backend cannot enumerate keys at all.
    async fn list(&self, prefix: &str) -> StorageResult<Option<Vec<String>>>;

    /// `Ok(None)` when the key is absent.
    async fn get_entry(&self, key: &str) -> StorageResult<Option<Entry>>;

    async fn get_entry_info(&self, key: &str) -> StorageResult<Option<EntryInfo>>;

    /// Create or overwrite `key`.
    async fn submit_entry(&self, key: &str, body: Bytes, metadata: &EntryMetadata)
    -> StorageResult<()>;

    /// Remove `key`. Absent keys are not an error.
    async fn delete_entry(&self, key: &str) -> StorageResult<()>;

    /// Run writes and deletes through the bounded, retrying worker pool.
    async fn apply_batch(&self, entries: Vec<BatchEntry>, options: &BatchOptions) -> BatchReport {
        batch::run_batch(self, entries, options).await
    }

    /// Variant metadata recorded on an existing object, used to skip
    /// redundant uploads. This is a hint: chunk presence is not verified.
    async fn existing_variant(&self, key: &str) -> StorageResult<Option<AssetVariantMetadata>> {
        Ok(self
            .get_entry_info(key)
            .await?
            .and_then(|info| AssetVariantMetadata::from_metadata(&info.metadata)))
    }
}

/// Read a content object, reassembling chunks in order.
///
/// A primary key that claims `numChunks > 1` but is missing any chunk is a
/// consistency error, not an absent object.
pub async fn read_object<P>(provider: &P, key: &str) -> StorageResult<Option<Entry>>
where
    P: StorageProvider + ?Sized,
{
    let Some(primary) = provider.get_entry(key).await? else {
        return Ok(None);
    };
    let chunks = primary
        .metadata
        .get_u64(crate::models::asset::META_NUM_CHUNKS)
        .unwrap_or(1);
    if chunks <= 1 {
        return Ok(Some(primary));
    }

    let mut body = BytesMut::from(&primary.body[..]);
    for n in 1..chunks {
        let part_key = chunk_key(key, n);
        let part = provider
            .get_entry(&part_key)
            .await?
            .ok_or_else(|| StorageError::Inconsistent {
                key: key.to_string(),
                reason: format!("chunk {n} of {chunks} (`{part_key}`) is missing"),
            })?;
        body.extend_from_slice(&part.body);
    }
    Ok(Some(Entry {
        body: body.freeze(),
        metadata: primary.metadata,
    }))
}

/// The configured backend, chosen once at startup.
pub enum Backend {
    Kv(KvStore),
    S3(S3Store),
    Local(LocalStore),
}

#[async_trait]
impl StorageProvider for Backend {
    fn kind(&self) -> &'static str {
        match self {
            Backend::Kv(s) => s.kind(),
            Backend::S3(s) => s.kind(),
            Backend::Local(s) => s.kind(),
        }
    }

    fn chunk_size(&self) -> Option<u64> {
        match self {
            Backend::Kv(s) => s.chunk_size(),
            Backend::S3(s) => s.chunk_size(),
            Backend::Local(s) => s.chunk_size(),
        }
    }

    async fn list(&self, prefix: &str) -> StorageResult<Option<Vec<String>>> {
        match self {
            Backend::Kv(s) => s.list(prefix).await,
            Backend::S3(s) => s.list(prefix).await,
            Backend::Local(s) => s.list(prefix).await,
        }
    }

    async fn get_entry(&self, key: &str) -> StorageResult<Option<Entry>> {
        match self {
            Backend::Kv(s) => s.get_entry(key).await,
            Backend::S3(s) => s.get_entry(key).await,
            Backend::Local(s) => s.get_entry(key).await,
        }
    }

    async fn get_entry_info(&self, key: &str) -> StorageResult<Option<EntryInfo>> {
        match self {
            Backend::Kv(s) => s.get_entry_info(key).await,
            Backend::S3(s) => s.get_entry_info(key).await,
            Backend::Local(s) => s.get_entry_info(key).await,
        }
    }

    async fn submit_entry(
        &self,
        key: &str,
        body: Bytes,
        metadata: &EntryMetadata,
    ) -> StorageResult<()> {
        match self {
            Backend::Kv(s) => s.submit_entry(key, body, metadata).await,
            Backend::S3(s) => s.submit_entry(key, body, metadata).await,
            Backend::Local(s) => s.submit_entry(key, body, metadata).await,
        }
    }

    async fn delete_entry(&self, key: &str) -> StorageResult<()> {
        match self {
            Backend::Kv(s) => s.delete_entry(key).await,
            Backend::S3(s) => s.delete_entry(key).await,
            Backend::Local(s) => s.delete_entry(key).await,
        }
    }
}
