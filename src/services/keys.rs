//! Backend key grammar and the per-deployment publish ID.
//!
//! ```text
//! <publishId>_index_<collection>        collection index document
//! <publishId>_settings_<collection>_<hex>  collection settings document
//! <publishId>_files_sha256_<hex>        content object (chunk 0)
//! <publishId>_files_sha256_<hex>_<n>    content object chunk n (n >= 1)
//! ```

use crate::models::asset::ContentEncoding;
use std::{
    fmt,
    io::{self, ErrorKind},
    path::Path,
};
use thiserror::Error;
use tokio::fs;
use tracing::info;
use uuid::Uuid;

const PUBLISH_ID_FILE: &str = "publish-id";
const COLLECTION_NAME_MAX_LEN: usize = 100;
const HASH_SCHEME: &str = "sha256_";
const SHA256_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum KeyError {
    #[error("publish id `{0}` is invalid: only ASCII letters, digits and `-` are allowed")]
    InvalidPublishId(String),
    #[error("collection name `{name}` invalid: {reason}")]
    InvalidCollectionName { name: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Namespace prefix for every key one deployed application writes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PublishId(String);

impl PublishId {
    pub fn new(value: impl Into<String>) -> Result<Self, KeyError> {
        let value = value.into();
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return Err(KeyError::InvalidPublishId(value));
        }
        Ok(Self(value))
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Read the persisted ID from `state_dir`, creating it on first run.
    pub async fn load_or_create(state_dir: &Path) -> Result<Self, KeyError> {
        let path = state_dir.join(PUBLISH_ID_FILE);
        match fs::read_to_string(&path).await {
            Ok(contents) => Self::new(contents.trim()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(state_dir).await?;
                let id = Self::generate();
                fs::write(&path, format!("{}\n", id.0)).await?;
                info!(publish_id = %id, path = %path.display(), "generated new publish id");
                Ok(id)
            }
            Err(err) => Err(KeyError::Io(err)),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn index_prefix(&self) -> String {
        format!("{}_index_", self.0)
    }

    pub fn settings_prefix(&self) -> String {
        format!("{}_settings_", self.0)
    }

    pub fn files_prefix(&self) -> String {
        format!("{}_files_", self.0)
    }

    pub fn index_key(&self, collection: &str) -> String {
        format!("{}{}", self.index_prefix(), collection)
    }

    /// Settings documents are content addressed, so a publish never
    /// overwrites the settings the current index points at.
    pub fn settings_key(&self, collection: &str, hash: &str) -> String {
        format!("{}{}_{}", self.settings_prefix(), collection, hash)
    }

    /// Primary key of a content object.
    ///
    /// The encoding does not appear in the key: the hash already covers
    /// the encoded bytes, so equal bytes share one object.
    pub fn storage_key(&self, hash: &str, _encoding: ContentEncoding) -> String {
        format!("{}{}{}", self.files_prefix(), HASH_SCHEME, hash)
    }

    /// Collection name for an index key under this publish ID.
    pub fn collection_from_index_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(&self.index_prefix()).filter(|n| !n.is_empty())
    }

    /// Collection name and content hash of a settings key.
    pub fn settings_from_key<'a>(&self, key: &'a str) -> Option<(&'a str, &'a str)> {
        let (name, hash) = key.strip_prefix(&self.settings_prefix())?.rsplit_once('_')?;
        let is_hash = hash.len() == SHA256_HEX_LEN && hash.bytes().all(|b| b.is_ascii_hexdigit());
        (!name.is_empty() && is_hash).then_some((name, hash))
    }

    /// Canonical hash of a content object key, with any chunk suffix removed.
    pub fn hash_from_object_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let rest = key
            .strip_prefix(&self.files_prefix())?
            .strip_prefix(HASH_SCHEME)?;
        let hash = match rest.split_once('_') {
            Some((hash, chunk)) if !chunk.is_empty() && chunk.bytes().all(|b| b.is_ascii_digit()) => hash,
            Some(_) => return None,
            None => rest,
        };
        (!hash.is_empty() && hash.bytes().all(|b| b.is_ascii_hexdigit())).then_some(hash)
    }
}

impl fmt::Display for PublishId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Key of chunk `n` of an object. Chunk 0 lives under the primary key.
pub fn chunk_key(primary: &str, n: u64) -> String {
    if n == 0 {
        primary.to_string()
    } else {
        format!("{primary}_{n}")
    }
}

/// Validate a collection name before it is embedded in a key.
pub fn ensure_collection_name_safe(name: &str) -> Result<(), KeyError> {
    let invalid = |reason: &str| KeyError::InvalidCollectionName {
        name: name.to_string(),
        reason: reason.into(),
    };

    if name.is_empty() || name.len() > COLLECTION_NAME_MAX_LEN {
        return Err(invalid("must be between 1 and 100 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(invalid(
            "allowed characters are letters, digits, dots, hyphens and underscores",
        ));
    }
    if name.starts_with('.') || name.starts_with('-') {
        return Err(invalid("must start with a letter, digit or underscore"));
    }
    Ok(())
}
