//! Mark-and-sweep collection of content no live collection references.
//!
//! The mark phase reads every live index and unions the hashes it references.
//! The sweep phase lists content keys and deletes those whose hash is not in
//! that set. Any failure to enumerate or read an index aborts before deletion.

use crate::models::batch::{BatchEntry, BatchReport};
use crate::services::{
    batch::BatchOptions,
    collections::{self, CollectionError},
    keys::PublishId,
    storage::StorageProvider,
};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Clone, Debug)]
pub struct CleanOptions {
    /// Also remove collections whose expiration time has passed.
    pub delete_expired_collections: bool,
    /// Report what would be deleted without deleting it.
    pub dry_run: bool,
    /// Unix seconds used for expiry decisions.
    pub now: i64,
    pub batch: BatchOptions,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanSummary {
    pub live_collections: Vec<String>,
    pub expired_collections: Vec<String>,
    pub referenced_hashes: usize,
    pub objects_scanned: usize,
    /// Keys deleted, or that would be deleted on a dry run.
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

pub async fn clean<P>(
    provider: &P,
    publish_id: &PublishId,
    options: &CleanOptions,
) -> Result<CleanSummary, CollectionError>
where
    P: StorageProvider + ?Sized,
{
    let mut summary = CleanSummary::default();
    let mut report = BatchReport::default();

    let mut retired = Vec::new();
    for collection in collections::list_collections(provider, publish_id).await? {
        if options.delete_expired_collections && collection.metadata.is_expired(options.now) {
            retired.extend(collections::retire_entries(
                publish_id,
                &collection.name,
                &collection.metadata,
            ));
            summary.expired_collections.push(collection.name);
        } else {
            summary.live_collections.push(collection.name);
        }
    }

    // Retire expired indexes before sweeping, so no index ever points at
    // content that is already gone.
    if !retired.is_empty() {
        info!(collections = ?summary.expired_collections, "removing expired collections");
        report.merge(execute(provider, retired, options).await);
        if report.has_failures() {
            summary.failed = report.failed;
            return Ok(summary);
        }
    }

    let mut referenced = BTreeSet::new();
    let mut referenced_settings = BTreeSet::new();
    for name in &summary.live_collections {
        match collections::load_index(provider, publish_id, name).await? {
            Some((index, metadata)) => {
                referenced.extend(index.referenced_hashes());
                if let Some(hash) = metadata.settings_hash {
                    referenced_settings.insert(publish_id.settings_key(name, &hash));
                }
            }
            None => warn!(collection = %name, "index disappeared during clean"),
        }
    }
    summary.referenced_hashes = referenced.len();

    let content_keys = provider
        .list(&publish_id.files_prefix())
        .await?
        .ok_or(CollectionError::ListingUnsupported)?;
    summary.objects_scanned = content_keys.len();

    let mut doomed = Vec::new();
    for key in content_keys {
        match publish_id.hash_from_object_key(&key) {
            Some(hash) if referenced.contains(hash) => {}
            Some(_) => doomed.push(BatchEntry::delete(key)),
            None => warn!(key = %key, "skipping unrecognised content key"),
        }
    }

    let settings_keys = provider
        .list(&publish_id.settings_prefix())
        .await?
        .ok_or(CollectionError::ListingUnsupported)?;
    for key in settings_keys {
        if referenced_settings.contains(&key) {
            continue;
        }
        match publish_id.settings_from_key(&key) {
            Some(_) => doomed.push(BatchEntry::delete(key)),
            None => warn!(key = %key, "skipping unrecognised settings key"),
        }
    }

    info!(
        live = summary.live_collections.len(),
        referenced = summary.referenced_hashes,
        scanned = summary.objects_scanned,
        unreferenced = doomed.len(),
        dry_run = options.dry_run,
        "sweeping unreferenced objects"
    );
    report.merge(execute(provider, doomed, options).await);

    summary.deleted = report.succeeded;
    summary.failed = report.failed;
    Ok(summary)
}

async fn execute<P>(provider: &P, entries: Vec<BatchEntry>, options: &CleanOptions) -> BatchReport
where
    P: StorageProvider + ?Sized,
{
    if options.dry_run {
        for entry in &entries {
            info!(key = %entry.key, "would delete");
        }
        return BatchReport {
            succeeded: entries.into_iter().map(|e| e.key).collect(),
            failed: Vec::new(),
        };
    }
    provider.apply_batch(entries, &options.batch).await
}
