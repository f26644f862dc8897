//! Published assets and their stored variants.

use crate::models::metadata::EntryMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Encoding applied to the bytes of one stored variant.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum ContentEncoding {
    #[default]
    #[serde(rename = "identity")]
    Identity,
    #[serde(rename = "gzip")]
    Gzip,
    #[serde(rename = "br")]
    Brotli,
}

impl ContentEncoding {
    /// Token used in `Content-Encoding` / `Accept-Encoding` headers.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentEncoding::Identity => "identity",
            ContentEncoding::Gzip => "gzip",
            ContentEncoding::Brotli => "br",
        }
    }
}

impl fmt::Display for ContentEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "" => Ok(ContentEncoding::Identity),
            "gzip" | "x-gzip" => Ok(ContentEncoding::Gzip),
            "br" | "brotli" => Ok(ContentEncoding::Brotli),
            other => Err(format!("unsupported content encoding `{other}`")),
        }
    }
}

/// Metadata keys written on every content object.
pub const META_CONTENT_ENCODING: &str = "contentEncoding";
pub const META_SIZE: &str = "size";
pub const META_HASH: &str = "hash";
pub const META_NUM_CHUNKS: &str = "numChunks";

/// One stored blob: the exact bytes of one encoding of one file.
///
/// `hash` is the identity of the blob. Two variants with the same hash are
/// the same stored object no matter which asset references them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetVariantMetadata {
    #[serde(default)]
    pub content_encoding: ContentEncoding,

    /// Size of the stored bytes before chunking.
    pub size: u64,

    /// Lowercase hex SHA-256 of the stored bytes.
    pub hash: String,

    /// Absent or 1 means the object is stored under a single key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_chunks: Option<u64>,
}

impl AssetVariantMetadata {
    pub fn chunk_count(&self) -> u64 {
        self.num_chunks.unwrap_or(1).max(1)
    }

    /// Serialize into the flat string map carried on the backend object.
    pub fn to_metadata(&self) -> EntryMetadata {
        let mut meta = EntryMetadata::new()
            .with(META_CONTENT_ENCODING, self.content_encoding.as_str())
            .with(META_SIZE, self.size.to_string())
            .with(META_HASH, self.hash.clone());
        if let Some(n) = self.num_chunks {
            meta.insert(META_NUM_CHUNKS, n.to_string());
        }
        meta
    }

    /// Read variant fields back from backend metadata.
    ///
    /// Returns `None` when the object was not written by the publisher
    /// (no size or hash recorded).
    pub fn from_metadata(meta: &EntryMetadata) -> Option<Self> {
        let size = meta.get_u64(META_SIZE)?;
        let hash = meta.get(META_HASH)?.to_string();
        let content_encoding = meta
            .get(META_CONTENT_ENCODING)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();
        Some(Self {
            content_encoding,
            size,
            hash,
            num_chunks: meta.get_u64(META_NUM_CHUNKS),
        })
    }
}

/// One logical file inside one collection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AssetEntry {
    /// Request-facing path, e.g. `/index.html`.
    pub key: String,

    /// Size of the identity bytes.
    pub size: u64,

    pub content_type: String,

    /// Unix seconds.
    pub last_modified_time: i64,

    /// Long-lived, cacheable asset.
    #[serde(default)]
    pub is_static: bool,

    /// Available encodings, identity first.
    pub variants: Vec<AssetVariantMetadata>,
}

impl AssetEntry {
    pub fn variant(&self, encoding: ContentEncoding) -> Option<&AssetVariantMetadata> {
        self.variants
            .iter()
            .find(|v| v.content_encoding == encoding)
    }

    pub fn identity(&self) -> Option<&AssetVariantMetadata> {
        self.variant(ContentEncoding::Identity)
    }

    /// Every content hash this asset references.
    pub fn content_hashes(&self) -> impl Iterator<Item = &str> {
        self.variants.iter().map(|v| v.hash.as_str())
    }
}
