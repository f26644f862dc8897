//! In-memory provider with fault injection, for unit tests.

use super::{Entry, EntryInfo, StorageError, StorageProvider, StorageResult};
use crate::models::metadata::EntryMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
    time::Duration,
};

#[derive(Default)]
pub struct MemoryStore {
    chunk_size: Option<u64>,
    objects: Mutex<BTreeMap<String, (Bytes, EntryMetadata)>>,
    /// key -> (status, remaining failures; `u32::MAX` means forever)
    faults: Mutex<HashMap<String, (u16, u32)>>,
    /// key -> number of upcoming reads that still report the key absent
    invisible: Mutex<HashMap<String, u32>>,
    /// key -> time every `get_entry` takes before answering
    delays: Mutex<HashMap<String, Duration>>,
    calls: Mutex<HashMap<String, u32>>,
    pub listing_disabled: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(chunk_size: u64) -> Self {
        Self {
            chunk_size: Some(chunk_size),
            ..Self::default()
        }
    }

    pub fn fail_always(&self, key: &str, status: u16) {
        self.fail_times(key, status, u32::MAX);
    }

    pub fn fail_times(&self, key: &str, status: u16, times: u32) {
        self.faults
            .lock()
            .unwrap()
            .insert(key.to_string(), (status, times));
    }

    /// Make the next `reads` `get_entry` calls for `key` miss.
    pub fn hide_for_reads(&self, key: &str, reads: u32) {
        self.invisible
            .lock()
            .unwrap()
            .insert(key.to_string(), reads);
    }

    /// Make every `get_entry` for `key` take `delay`.
    pub fn delay_reads(&self, key: &str, delay: Duration) {
        self.delays.lock().unwrap().insert(key.to_string(), delay);
    }

    pub fn calls(&self, key: &str) -> u32 {
        self.calls.lock().unwrap().get(key).copied().unwrap_or(0)
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn body(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().unwrap().get(key).map(|(b, _)| b.clone())
    }

    pub fn insert(&self, key: &str, body: impl Into<Bytes>, metadata: EntryMetadata) {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), (body.into(), metadata));
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    fn record(&self, key: &str) -> StorageResult<()> {
        *self.calls.lock().unwrap().entry(key.to_string()).or_default() += 1;
        let mut faults = self.faults.lock().unwrap();
        if let Some((status, remaining)) = faults.get_mut(key) {
            if *remaining > 0 {
                if *remaining != u32::MAX {
                    *remaining -= 1;
                }
                return Err(StorageError::Http {
                    status: *status,
                    key: key.to_string(),
                    body: "injected".into(),
                });
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn chunk_size(&self) -> Option<u64> {
        self.chunk_size
    }

    async fn list(&self, prefix: &str) -> StorageResult<Option<Vec<String>>> {
        if self.listing_disabled {
            return Ok(None);
        }
        Ok(Some(
            self.objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect(),
        ))
    }

    async fn get_entry(&self, key: &str) -> StorageResult<Option<Entry>> {
        self.record(key)?;
        let delay = self.delays.lock().unwrap().get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(remaining) = self.invisible.lock().unwrap().get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
        }
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(body, metadata)| Entry {
                body: body.clone(),
                metadata: metadata.clone(),
            }))
    }

    async fn get_entry_info(&self, key: &str) -> StorageResult<Option<EntryInfo>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(key)
            .map(|(body, metadata)| EntryInfo {
                metadata: metadata.clone(),
                size: Some(body.len() as u64),
            }))
    }

    async fn submit_entry(
        &self,
        key: &str,
        body: Bytes,
        metadata: &EntryMetadata,
    ) -> StorageResult<()> {
        self.record(key)?;
        self.insert(key, body, metadata.clone());
        Ok(())
    }

    async fn delete_entry(&self, key: &str) -> StorageResult<()> {
        self.record(key)?;
        self.remove(key);
        Ok(())
    }
}
