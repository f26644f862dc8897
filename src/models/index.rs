//! Collection index documents and their per-collection settings.

use crate::models::{asset::AssetEntry, metadata::EntryMetadata};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const META_PUBLISHED_TIME: &str = "publishedTime";
pub const META_EXPIRATION_TIME: &str = "expirationTime";
pub const META_SETTINGS_HASH: &str = "settingsHash";

/// Snapshot of every asset in one collection, keyed by asset key.
///
/// Serialized as a plain JSON object `{ "/path": AssetEntry, ... }` and
/// stored as the body of the collection's index object. Never patched in
/// place; a publish writes a whole new document.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct CollectionIndex(BTreeMap<String, AssetEntry>);

impl CollectionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: AssetEntry) {
        self.0.insert(entry.key.clone(), entry);
    }

    pub fn get(&self, asset_key: &str) -> Option<&AssetEntry> {
        self.0.get(asset_key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &AssetEntry> {
        self.0.values()
    }

    /// Union of content hashes across every variant of every asset.
    pub fn referenced_hashes(&self) -> BTreeSet<String> {
        self.entries()
            .flat_map(|entry| entry.content_hashes())
            .map(str::to_string)
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

impl FromIterator<AssetEntry> for CollectionIndex {
    fn from_iter<I: IntoIterator<Item = AssetEntry>>(iter: I) -> Self {
        Self(iter.into_iter().map(|e| (e.key.clone(), e)).collect())
    }
}

/// Fields carried in the index object's backend metadata.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IndexMetadata {
    /// Unix seconds.
    pub published_time: Option<i64>,
    /// Unix seconds. A collection past this instant is eligible for removal.
    pub expiration_time: Option<i64>,
    /// Hash of the settings document this index was published with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings_hash: Option<String>,
}

impl IndexMetadata {
    pub fn to_metadata(&self) -> EntryMetadata {
        let mut meta = EntryMetadata::new();
        if let Some(t) = self.published_time {
            meta.insert(META_PUBLISHED_TIME, t.to_string());
        }
        if let Some(t) = self.expiration_time {
            meta.insert(META_EXPIRATION_TIME, t.to_string());
        }
        if let Some(hash) = &self.settings_hash {
            meta.insert(META_SETTINGS_HASH, hash.clone());
        }
        meta
    }

    pub fn from_metadata(meta: &EntryMetadata) -> Self {
        let read = |key| meta.get(key).and_then(|v| v.trim().parse::<i64>().ok());
        Self {
            published_time: read(META_PUBLISHED_TIME),
            expiration_time: read(META_EXPIRATION_TIME),
            settings_hash: meta
                .get(META_SETTINGS_HASH)
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string),
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expiration_time.is_some_and(|t| t < now)
    }
}

/// Edge-server behaviour for one collection.
///
/// Stored as its own content-addressed object and referenced from the index
/// metadata, so it switches together with the index.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSettings {
    /// Asset key prefixes served with long-lived cache headers.
    #[serde(default)]
    pub static_prefixes: Vec<String>,

    /// Asset served for unknown paths with status 200 (single-page apps).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spa_fallback: Option<String>,

    /// Asset served for unknown paths with status 404.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_found_page: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::asset::{AssetVariantMetadata, ContentEncoding};

    fn entry(key: &str, hashes: &[&str]) -> AssetEntry {
        AssetEntry {
            key: key.into(),
            size: 10,
            content_type: "text/plain".into(),
            last_modified_time: 1_700_000_000,
            is_static: false,
            variants: hashes
                .iter()
                .enumerate()
                .map(|(i, h)| AssetVariantMetadata {
                    content_encoding: if i == 0 {
                        ContentEncoding::Identity
                    } else {
                        ContentEncoding::Gzip
                    },
                    size: 10,
                    hash: (*h).into(),
                    num_chunks: None,
                })
                .collect(),
        }
    }

    #[test]
    fn index_serializes_as_plain_mapping() {
        let index: CollectionIndex = [entry("/a.txt", &["h1"])].into_iter().collect();
        let value: serde_json::Value = serde_json::from_slice(&index.to_json().unwrap()).unwrap();
        assert!(value.get("/a.txt").is_some());
        assert_eq!(CollectionIndex::from_json(&index.to_json().unwrap()).unwrap(), index);
    }

    #[test]
    fn referenced_hashes_unions_all_variants() {
        let index: CollectionIndex = [entry("/a", &["h1", "h2"]), entry("/b", &["h1", "h3"])]
            .into_iter()
            .collect();
        let hashes: Vec<_> = index.referenced_hashes().into_iter().collect();
        assert_eq!(hashes, vec!["h1", "h2", "h3"]);
    }

    #[test]
    fn index_metadata_expiry() {
        let meta = IndexMetadata {
            published_time: Some(100),
            expiration_time: Some(200),
            settings_hash: Some("ab".repeat(32)),
        };
        let back = IndexMetadata::from_metadata(&meta.to_metadata());
        assert_eq!(back, meta);
        assert!(!back.is_expired(200));
        assert!(back.is_expired(201));
        assert!(!IndexMetadata::default().is_expired(i64::MAX));
    }
}
