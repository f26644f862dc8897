//! Listing, loading and deleting published collections.

use crate::models::{
    batch::{BatchEntry, BatchReport},
    index::{CollectionIndex, CollectionSettings, IndexMetadata},
};
use crate::services::{
    batch::BatchOptions,
    keys::{self, KeyError, PublishId},
    storage::{StorageError, StorageProvider, read_object},
};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

/// Collection that edge servers read when none is named.
pub const DEFAULT_COLLECTION: &str = "live";

#[derive(Debug, Error)]
pub enum CollectionError {
    #[error(transparent)]
    Key(#[from] KeyError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("backend cannot list keys, so collections cannot be enumerated")]
    ListingUnsupported,
    #[error("collection `{0}` does not exist")]
    NotFound(String),
    #[error("collection `{0}` is the default collection; pass --force to delete it")]
    Protected(String),
    #[error("index for collection `{name}` is unreadable: {source}")]
    CorruptIndex {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{failed} of {total} deletions failed")]
    Incomplete { failed: usize, total: usize },
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionInfo {
    pub name: String,
    #[serde(flatten)]
    pub metadata: IndexMetadata,
}

/// Every collection with an index under `publish_id`, sorted by name.
pub async fn list_collections<P>(
    provider: &P,
    publish_id: &PublishId,
) -> Result<Vec<CollectionInfo>, CollectionError>
where
    P: StorageProvider + ?Sized,
{
    let keys = provider
        .list(&publish_id.index_prefix())
        .await?
        .ok_or(CollectionError::ListingUnsupported)?;

    let mut collections = Vec::with_capacity(keys.len());
    for key in &keys {
        let Some(name) = publish_id.collection_from_index_key(key) else {
            continue;
        };
        // Listed but gone by the time we ask: deleted concurrently.
        let Some(info) = provider.get_entry_info(key).await? else {
            continue;
        };
        collections.push(CollectionInfo {
            name: name.to_string(),
            metadata: IndexMetadata::from_metadata(&info.metadata),
        });
    }
    collections.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(collections)
}

/// The index of `name`, or `None` when the collection was never published.
pub async fn load_index<P>(
    provider: &P,
    publish_id: &PublishId,
    name: &str,
) -> Result<Option<(CollectionIndex, IndexMetadata)>, CollectionError>
where
    P: StorageProvider + ?Sized,
{
    keys::ensure_collection_name_safe(name)?;
    let Some(entry) = read_object(provider, &publish_id.index_key(name)).await? else {
        return Ok(None);
    };
    let index = CollectionIndex::from_json(&entry.body).map_err(|source| {
        CollectionError::CorruptIndex {
            name: name.to_string(),
            source,
        }
    })?;
    Ok(Some((index, IndexMetadata::from_metadata(&entry.metadata))))
}

/// Settings the index of `name` was published with; defaults when the index
/// references none.
pub async fn load_settings<P>(
    provider: &P,
    publish_id: &PublishId,
    name: &str,
    metadata: &IndexMetadata,
) -> Result<CollectionSettings, CollectionError>
where
    P: StorageProvider + ?Sized,
{
    keys::ensure_collection_name_safe(name)?;
    let Some(hash) = metadata.settings_hash.as_deref() else {
        return Ok(CollectionSettings::default());
    };
    let key = publish_id.settings_key(name, hash);
    let entry = provider
        .get_entry(&key)
        .await?
        .ok_or_else(|| StorageError::Inconsistent {
            key: key.clone(),
            reason: "settings referenced by the index are missing".into(),
        })?;
    Ok(serde_json::from_slice(&entry.body).map_err(StorageError::from)?)
}

/// Remove the index and settings of `name`.
///
/// Content objects are left for `clean` to collect, since other collections
/// may reference them.
pub async fn delete_collection<P>(
    provider: &P,
    publish_id: &PublishId,
    name: &str,
    force: bool,
    options: &BatchOptions,
) -> Result<BatchReport, CollectionError>
where
    P: StorageProvider + ?Sized,
{
    keys::ensure_collection_name_safe(name)?;
    if name == DEFAULT_COLLECTION && !force {
        return Err(CollectionError::Protected(name.to_string()));
    }
    let index_key = publish_id.index_key(name);
    let Some(info) = provider.get_entry_info(&index_key).await? else {
        return Err(CollectionError::NotFound(name.to_string()));
    };
    let metadata = IndexMetadata::from_metadata(&info.metadata);

    let entries = retire_entries(publish_id, name, &metadata);
    let total = entries.len();
    let report = provider.apply_batch(entries, options).await;
    if report.has_failures() {
        return Err(CollectionError::Incomplete {
            failed: report.failed.len(),
            total,
        });
    }
    info!(collection = name, "collection deleted");
    Ok(report)
}

/// Deletions that remove collection `name`: its index, then its settings.
pub(crate) fn retire_entries(
    publish_id: &PublishId,
    name: &str,
    metadata: &IndexMetadata,
) -> Vec<BatchEntry> {
    let mut entries = vec![BatchEntry::delete(publish_id.index_key(name))];
    if let Some(hash) = &metadata.settings_hash {
        entries.push(BatchEntry::delete(publish_id.settings_key(name, hash)));
    }
    entries
}
