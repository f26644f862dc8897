//! Flat string metadata attached to every backend object.
//!
//! Backends disagree on key casing: S3 lowercases `x-amz-meta-*` names and
//! some KV gateways canonicalize too. All reads go through [`EntryMetadata::get`],
//! which matches case-insensitively and falls back to the lowercase spelling.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Key-value metadata stored alongside an object body.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct EntryMetadata(BTreeMap<String, String>);

impl EntryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value. The key is stored with the casing given.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    /// Look up `key` regardless of how the backend cased it.
    ///
    /// Exact match wins, then the lowercase spelling, then any key equal
    /// under ASCII case folding.
    pub fn get(&self, key: &str) -> Option<&str> {
        if let Some(value) = self.0.get(key) {
            return Some(value.as_str());
        }
        if let Some(value) = self.0.get(&key.to_ascii_lowercase()) {
            return Some(value.as_str());
        }
        self.0
            .iter()
            .find(|(candidate, _)| candidate.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    /// Parse a numeric field, ignoring values that are not numbers.
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for EntryMetadata {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
