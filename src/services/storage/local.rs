//! LocalStore: simulated backend for local development and tests.
//!
//! Metadata lives in SQLite; payloads live on disk sharded beneath
//! `base_path/objects/{shard}/{shard}/{key}`. Objects above the configured
//! chunk size are split by the batch executor exactly as they would be for
//! the remote KV store, so chunked reads can be exercised offline.

use super::{Entry, EntryInfo, StorageError, StorageProvider, StorageResult};
use crate::models::{metadata::EntryMetadata, object::StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Same per-object limit as the remote KV store.
pub const DEFAULT_LOCAL_CHUNK_SIZE: u64 = 25 * 1024 * 1024;

const MAX_OBJECT_KEY_LEN: usize = 512;
const LIST_PAGE_SIZE: i64 = 1000;
const MIGRATION_SQL: &str = include_str!("../../../migrations/0001_init.sql");

#[derive(Clone)]
pub struct LocalStore {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Directory on disk where object payloads are stored.
    pub base_path: PathBuf,

    chunk_size: Option<u64>,
}

impl LocalStore {
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>, chunk_size: Option<u64>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            chunk_size,
        }
    }

    /// Open (or create) a store rooted at `dir` and apply the schema.
    pub async fn open(dir: impl AsRef<Path>, chunk_size: Option<u64>) -> StorageResult<Self> {
        let dir = dir.as_ref();
        let objects = dir.join("objects");
        fs::create_dir_all(&objects).await?;

        let options = SqliteConnectOptions::new()
            .filename(dir.join("meta.db"))
            .create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        run_migrations(&db).await?;

        debug!(dir = %dir.display(), ?chunk_size, "opened local store");
        Ok(Self::new(Arc::new(db), objects, chunk_size))
    }

    /// Reject keys that could escape the payload directory.
    fn ensure_key_safe(&self, key: &str) -> StorageResult<()> {
        let unsafe_key = key.is_empty()
            || key.len() > MAX_OBJECT_KEY_LEN
            || key.contains('/')
            || key.contains("..")
            || key
                .bytes()
                .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0');
        if unsafe_key {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Two-level shard directories from MD5(key), as lowercase hex bytes.
    fn object_shards(key: &str) -> (String, String) {
        let digest = md5::compute(key);
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    fn object_path(&self, key: &str) -> PathBuf {
        let (shard_a, shard_b) = Self::object_shards(key);
        let mut path = self.base_path.clone();
        path.push(shard_a);
        path.push(shard_b);
        path.push(key);
        path
    }

    async fn fetch_object(&self, key: &str) -> StorageResult<Option<StoredObject>> {
        let row = sqlx::query_as::<_, StoredObject>(
            "SELECT key, size_bytes, metadata FROM objects WHERE key = ?",
        )
        .bind(key)
        .fetch_optional(&*self.db)
        .await?;
        Ok(row)
    }

    /// Write to a temp file, fsync, then rename into place.
    async fn write_payload(&self, path: &Path, body: &[u8]) -> StorageResult<()> {
        let parent = path.parent().map(Path::to_path_buf).ok_or_else(|| {
            StorageError::Io(io::Error::new(
                ErrorKind::Other,
                "object path missing parent directory",
            ))
        })?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));

        let result = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(body).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::rename(&tmp_path, path).await
        }
        .await;
        if let Err(err) = result {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(StorageError::Io(err));
        }
        Ok(())
    }

    /// Remove empty shard directories up to `base_path`.
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.base_path) && current != self.base_path {
            match fs::remove_dir(&current).await {
                Ok(_) => match current.parent() {
                    Some(parent) => current = parent.to_path_buf(),
                    None => break,
                },
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

/// Apply the embedded schema, one statement at a time.
async fn run_migrations(db: &SqlitePool) -> StorageResult<()> {
    let statements = MIGRATION_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty());
    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }
    Ok(())
}

fn parse_metadata(row: &StoredObject) -> StorageResult<EntryMetadata> {
    Ok(serde_json::from_str(&row.metadata)?)
}

#[async_trait]
impl StorageProvider for LocalStore {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn chunk_size(&self) -> Option<u64> {
        self.chunk_size
    }

    async fn list(&self, prefix: &str) -> StorageResult<Option<Vec<String>>> {
        let mut keys = Vec::new();
        let mut cursor = String::new();
        loop {
            let page: Vec<String> = sqlx::query_scalar(
                "SELECT key FROM objects WHERE instr(key, ?) = 1 AND key > ? ORDER BY key ASC LIMIT ?",
            )
            .bind(prefix)
            .bind(&cursor)
            .bind(LIST_PAGE_SIZE)
            .fetch_all(&*self.db)
            .await?;

            let done = (page.len() as i64) < LIST_PAGE_SIZE;
            if let Some(last) = page.last() {
                cursor = last.clone();
            }
            keys.extend(page);
            if done {
                break;
            }
        }
        Ok(Some(keys))
    }

    async fn get_entry(&self, key: &str) -> StorageResult<Option<Entry>> {
        self.ensure_key_safe(key)?;
        let Some(row) = self.fetch_object(key).await? else {
            return Ok(None);
        };
        let body = match fs::read(self.object_path(key)).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(key, "metadata row without payload");
                return Ok(None);
            }
            Err(err) => return Err(StorageError::Io(err)),
        };
        Ok(Some(Entry {
            body,
            metadata: parse_metadata(&row)?,
        }))
    }

    async fn get_entry_info(&self, key: &str) -> StorageResult<Option<EntryInfo>> {
        self.ensure_key_safe(key)?;
        let Some(row) = self.fetch_object(key).await? else {
            return Ok(None);
        };
        Ok(Some(EntryInfo {
            metadata: parse_metadata(&row)?,
            size: u64::try_from(row.size_bytes).ok(),
        }))
    }

    async fn submit_entry(
        &self,
        key: &str,
        body: Bytes,
        metadata: &EntryMetadata,
    ) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        let path = self.object_path(key);
        self.write_payload(&path, &body).await?;

        let result = sqlx::query(
            r#"
            INSERT INTO objects (key, size_bytes, metadata)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                size_bytes = excluded.size_bytes,
                metadata = excluded.metadata
            "#,
        )
        .bind(key)
        .bind(body.len() as i64)
        .bind(serde_json::to_string(metadata)?)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let _ = fs::remove_file(&path).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    async fn delete_entry(&self, key: &str) -> StorageResult<()> {
        self.ensure_key_safe(key)?;
        sqlx::query("DELETE FROM objects WHERE key = ?")
            .bind(key)
            .execute(&*self.db)
            .await?;

        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(_) => debug!("removed physical file {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("file {} already missing", path.display());
            }
            Err(err) => return Err(StorageError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }
}
