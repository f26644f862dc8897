//! Publish a local file tree as a named collection.
//!
//! Files are hashed and encoded into variants, staged on disk under their
//! content hash, and uploaded only when the backend does not already hold
//! an object with the same hash, size and chunk count. The collection index
//! is written last, after every upload has settled, so a reader never sees
//! an index that points at content still in flight.

use crate::models::{
    asset::{AssetEntry, AssetVariantMetadata, ContentEncoding},
    batch::BatchEntry,
    index::{CollectionIndex, CollectionSettings, IndexMetadata},
    metadata::EntryMetadata,
};
use crate::services::{
    batch::{BatchOptions, GlobalBackoff, with_retries},
    hashing,
    keys::{self, KeyError, PublishId},
    storage::{StorageError, StorageProvider},
    walk::{self, LocalFile},
};
use bytes::Bytes;
use chrono::Utc;
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("failed to prepare `{path}`: {source}")]
    Prepare {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("background task failed: {0}")]
    Task(#[from] task::JoinError),
    #[error("{failed} of {total} uploads failed; collection `{collection}` was left unchanged")]
    Incomplete {
        collection: String,
        failed: usize,
        total: usize,
    },
    #[error("index for `{collection}` is {size} bytes, over the backend object limit of {limit}")]
    IndexTooLarge {
        collection: String,
        size: u64,
        limit: u64,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Debug)]
pub struct PublishOptions {
    pub collection: String,
    /// Compressed encodings to try for compressible files.
    pub encodings: Vec<ContentEncoding>,
    pub settings: CollectionSettings,
    /// Lifetime of the collection, counted from the publish time.
    pub expires_in: Option<Duration>,
    /// Directory holding content-addressed copies of every variant.
    pub staging_dir: PathBuf,
    pub batch: BatchOptions,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishSummary {
    pub collection: String,
    pub index_key: String,
    pub assets: usize,
    /// Distinct content objects referenced by the index.
    pub objects: usize,
    pub uploaded: usize,
    pub deduplicated: usize,
    #[serde(flatten)]
    pub metadata: IndexMetadata,
}

/// A variant whose bytes sit in the staging directory.
#[derive(Clone, Debug)]
struct StagedVariant {
    variant: AssetVariantMetadata,
    path: PathBuf,
}

/// Walk `root` and publish everything under it.
pub async fn publish_directory<P>(
    provider: &P,
    publish_id: &PublishId,
    root: &Path,
    options: &PublishOptions,
) -> Result<PublishSummary, PublishError>
where
    P: StorageProvider + ?Sized,
{
    let walk_root = root.to_path_buf();
    let files = task::spawn_blocking(move || walk::walk_tree(&walk_root))
        .await?
        .map_err(|source| PublishError::Prepare {
            path: root.to_path_buf(),
            source,
        })?;
    info!(root = %root.display(), files = files.len(), "collected files");
    publish_files(provider, publish_id, files, options).await
}

/// Upload `files` and swap the collection index to point at them.
pub async fn publish_files<P>(
    provider: &P,
    publish_id: &PublishId,
    files: Vec<LocalFile>,
    options: &PublishOptions,
) -> Result<PublishSummary, PublishError>
where
    P: StorageProvider + ?Sized,
{
    keys::ensure_collection_name_safe(&options.collection)?;
    tokio::fs::create_dir_all(&options.staging_dir)
        .await
        .map_err(|source| PublishError::Prepare {
            path: options.staging_dir.clone(),
            source,
        })?;

    let chunk_size = provider.chunk_size();
    let width = options.batch.concurrency.max(1);

    let prepared: Vec<Result<(AssetEntry, Vec<StagedVariant>), PublishError>> =
        stream::iter(files)
            .map(|file| {
                let encodings = options.encodings.clone();
                let staging_dir = options.staging_dir.clone();
                let is_static =
                    walk::is_static_asset(&file.asset_key, &options.settings.static_prefixes);
                async move {
                    let path = file.path.clone();
                    task::spawn_blocking(move || {
                        prepare_asset(&file, &encodings, &staging_dir, chunk_size, is_static)
                    })
                    .await?
                    .map_err(|source| PublishError::Prepare { path, source })
                }
            })
            .buffered(width)
            .collect()
            .await;

    let mut assets = Vec::with_capacity(prepared.len());
    let mut unique: BTreeMap<String, StagedVariant> = BTreeMap::new();
    for result in prepared {
        let (asset, staged) = result?;
        for s in staged {
            unique.entry(s.variant.hash.clone()).or_insert(s);
        }
        assets.push(asset);
    }

    let checks: Vec<(String, StagedVariant, bool)> = stream::iter(unique.into_values())
        .map(|staged| async move {
            let key = publish_id.storage_key(&staged.variant.hash, staged.variant.content_encoding);
            let present = match provider.existing_variant(&key).await {
                Ok(Some(existing)) => {
                    existing.size == staged.variant.size
                        && existing.chunk_count() == staged.variant.chunk_count()
                }
                Ok(None) => false,
                Err(err) => {
                    warn!(key = %key, reason = %err.reason(), "existence check failed, uploading: {}", err);
                    false
                }
            };
            (key, staged, present)
        })
        .buffer_unordered(width)
        .collect()
        .await;

    let objects = checks.len();
    let mut uploads = Vec::new();
    let mut deduplicated = 0;
    for (key, staged, present) in checks {
        if present {
            debug!(key = %key, "object already stored");
            deduplicated += 1;
        } else {
            uploads.push(BatchEntry::write(
                key,
                staged.path,
                staged.variant.size,
                staged.variant.to_metadata(),
            ));
        }
    }

    let total = uploads.len();
    info!(
        collection = %options.collection,
        assets = assets.len(),
        objects,
        uploading = total,
        deduplicated,
        "uploading content"
    );
    let report = provider.apply_batch(uploads, &options.batch).await;
    if report.has_failures() {
        return Err(PublishError::Incomplete {
            collection: options.collection.clone(),
            failed: report.failed.len(),
            total,
        });
    }

    let settings_body = Bytes::from(serde_json::to_vec(&options.settings)?);
    let settings_hash = hashing::sha256_hex(&settings_body);

    let now = Utc::now().timestamp();
    let metadata = IndexMetadata {
        published_time: Some(now),
        expiration_time: options
            .expires_in
            .map(|d| now.saturating_add(i64::try_from(d.as_secs()).unwrap_or(i64::MAX))),
        settings_hash: Some(settings_hash.clone()),
    };
    let index: CollectionIndex = assets.into_iter().collect();
    let index_body = Bytes::from(index.to_json()?);
    if let Some(limit) = chunk_size {
        if index_body.len() as u64 > limit {
            return Err(PublishError::IndexTooLarge {
                collection: options.collection.clone(),
                size: index_body.len() as u64,
                limit,
            });
        }
    }

    // Settings go under their own hash and only become visible through the
    // index written below, which is the single switch point.
    let backoff = GlobalBackoff::new();
    let settings_key = publish_id.settings_key(&options.collection, &settings_hash);
    let empty = EntryMetadata::new();
    with_retries(&settings_key, &backoff, &options.batch, || {
        provider.submit_entry(&settings_key, settings_body.clone(), &empty)
    })
    .await?;

    let index_key = publish_id.index_key(&options.collection);
    let index_meta = metadata.to_metadata();
    with_retries(&index_key, &backoff, &options.batch, || {
        provider.submit_entry(&index_key, index_body.clone(), &index_meta)
    })
    .await?;

    info!(
        collection = %options.collection,
        index_key = %index_key,
        assets = index.len(),
        uploaded = report.succeeded.len(),
        deduplicated,
        "collection published"
    );

    Ok(PublishSummary {
        collection: options.collection.clone(),
        index_key: index_key.clone(),
        assets: index.len(),
        objects,
        uploaded: report.succeeded.len(),
        deduplicated,
        metadata,
    })
}

/// Read, encode and stage one file. Runs on the blocking pool.
fn prepare_asset(
    file: &LocalFile,
    encodings: &[ContentEncoding],
    staging_dir: &Path,
    chunk_size: Option<u64>,
    is_static: bool,
) -> io::Result<(AssetEntry, Vec<StagedVariant>)> {
    let identity = std::fs::read(&file.path)?;
    let mut staged = vec![stage(&identity, ContentEncoding::Identity, staging_dir, chunk_size)?];

    if hashing::is_compressible(&file.content_type) {
        for &encoding in encodings {
            if encoding == ContentEncoding::Identity {
                continue;
            }
            let encoded = hashing::encode(&identity, encoding)?;
            if encoded.len() < identity.len() {
                staged.push(stage(&encoded, encoding, staging_dir, chunk_size)?);
            }
        }
    }

    let entry = AssetEntry {
        key: file.asset_key.clone(),
        size: identity.len() as u64,
        content_type: file.content_type.clone(),
        last_modified_time: file.last_modified_time,
        is_static,
        variants: staged.iter().map(|s| s.variant.clone()).collect(),
    };
    Ok((entry, staged))
}

fn stage(
    bytes: &[u8],
    encoding: ContentEncoding,
    staging_dir: &Path,
    chunk_size: Option<u64>,
) -> io::Result<StagedVariant> {
    let hash = hashing::sha256_hex(bytes);
    let size = bytes.len() as u64;
    let path = staging_dir.join(format!("sha256_{hash}"));

    // A staged copy is reused only when it still holds exactly these bytes.
    let up_to_date = std::fs::metadata(&path).is_ok_and(|m| m.len() == size)
        && std::fs::read(&path).is_ok_and(|staged| staged == bytes);
    if !up_to_date {
        let tmp = staging_dir.join(format!(".tmp-{}", Uuid::new_v4()));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
    }

    let chunks = hashing::chunk_count(size, chunk_size);
    Ok(StagedVariant {
        variant: AssetVariantMetadata {
            content_encoding: encoding,
            size,
            hash,
            num_chunks: (chunks > 1).then_some(chunks),
        },
        path,
    })
}
