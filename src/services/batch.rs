//! Bounded-concurrency batch execution with a pool-wide backoff deadline.
//!
//! Workers claim entries by bumping a shared atomic index, so every entry is
//! processed exactly once without a locked queue. A retryable failure on any
//! worker pushes a single shared deadline forward; every worker waits for it
//! before its next attempt, which throttles the whole pool when the backend
//! starts rejecting requests.

use crate::models::{
    asset::META_NUM_CHUNKS,
    batch::{BatchEntry, BatchOp, BatchReport},
};
use crate::services::{
    hashing::chunk_ranges,
    keys::chunk_key,
    storage::{StorageError, StorageProvider, StorageResult},
};
use bytes::Bytes;
use futures::future::join_all;
use std::{
    future::Future,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};
use tokio::{fs, time::Instant};
use tracing::{debug, error, info, warn};

pub const DEFAULT_CONCURRENCY: usize = 12;
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct BatchOptions {
    /// Number of workers pulling from the entry list.
    pub concurrency: usize,
    /// Total attempts per entry, including the first.
    pub max_retries: u32,
    /// Backoff after attempt `n` is `n * initial_backoff`.
    pub initial_backoff: Duration,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
        }
    }
}

/// Monotonic "no requests before" instant shared by all workers.
///
/// Stored as milliseconds since `origin`; zero means no deadline. The value
/// only ever moves forward.
#[derive(Debug)]
pub struct GlobalBackoff {
    origin: Instant,
    deadline_ms: AtomicU64,
}

impl Default for GlobalBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalBackoff {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            deadline_ms: AtomicU64::new(0),
        }
    }

    /// Push the deadline to `now + attempt * initial`, unless it is already later.
    ///
    /// Returns the deadline in effect afterwards.
    pub fn push(&self, attempt: u32, initial: Duration) -> Instant {
        let delay = initial.saturating_mul(attempt);
        let candidate = (Instant::now() + delay).duration_since(self.origin);
        let candidate_ms = u64::try_from(candidate.as_millis()).unwrap_or(u64::MAX);
        let previous = self.deadline_ms.fetch_max(candidate_ms, Ordering::AcqRel);
        self.origin + Duration::from_millis(previous.max(candidate_ms))
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self.deadline_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(self.origin + Duration::from_millis(ms)),
        }
    }

    /// Sleep until the current deadline, if it lies in the future.
    pub async fn wait(&self) {
        if let Some(deadline) = self.deadline() {
            if deadline > Instant::now() {
                tokio::time::sleep_until(deadline).await;
            }
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or runs out of attempts.
pub async fn with_retries<T, F, Fut>(
    key: &str,
    backoff: &GlobalBackoff,
    options: &BatchOptions,
    mut op: F,
) -> StorageResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StorageResult<T>>,
{
    let max_attempts = options.max_retries.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        backoff.wait().await;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let deadline = backoff.push(attempt, options.initial_backoff);
                let delay_ms = deadline
                    .saturating_duration_since(Instant::now())
                    .as_millis() as u64;
                warn!(
                    key,
                    attempt,
                    reason = %err.reason(),
                    delay_ms,
                    "retryable failure, backing off: {}",
                    err
                );
            }
            Err(err) => return Err(err),
        }
    }
}

/// Execute every entry against `provider`, collecting per-entry outcomes.
pub async fn run_batch<P>(provider: &P, entries: Vec<BatchEntry>, options: &BatchOptions) -> BatchReport
where
    P: StorageProvider + ?Sized,
{
    if entries.is_empty() {
        return BatchReport::default();
    }

    let next = AtomicUsize::new(0);
    let backoff = GlobalBackoff::new();
    let width = options.concurrency.clamp(1, entries.len());
    debug!(entries = entries.len(), workers = width, backend = provider.kind(), "starting batch");

    let (next, backoff, entries) = (&next, &backoff, &entries);
    let workers = (0..width).map(|worker| async move {
        let mut report = BatchReport::default();
        loop {
            let index = next.fetch_add(1, Ordering::Relaxed);
            let Some(entry) = entries.get(index) else {
                break;
            };
            let result = with_retries(&entry.key, backoff, options, || execute(provider, entry)).await;
            match result {
                Ok(()) => {
                    info!(worker, key = %entry.key, write = entry.is_write(), "entry applied");
                    report.succeeded.push(entry.key.clone());
                }
                Err(err) => {
                    error!(worker, key = %entry.key, reason = %err.reason(), "entry failed: {}", err);
                    report.failed.push((entry.key.clone(), err.to_string()));
                }
            }
        }
        report
    });

    let mut report = BatchReport::default();
    for worker_report in join_all(workers).await {
        report.merge(worker_report);
    }
    report
}

/// One attempt at one entry.
///
/// Oversized writes go out as chunk keys first and the primary key last, so a
/// visible primary always carries the final `numChunks`.
async fn execute<P>(provider: &P, entry: &BatchEntry) -> StorageResult<()>
where
    P: StorageProvider + ?Sized,
{
    match &entry.op {
        BatchOp::Delete => provider.delete_entry(&entry.key).await,
        BatchOp::Write { path, metadata } => {
            let bytes = Bytes::from(fs::read(path).await?);
            if bytes.len() as u64 != entry.size {
                return Err(StorageError::Inconsistent {
                    key: entry.key.clone(),
                    reason: format!(
                        "staged file {} has {} bytes, expected {}",
                        path.display(),
                        bytes.len(),
                        entry.size
                    ),
                });
            }

            let ranges = chunk_ranges(entry.size, provider.chunk_size());
            if ranges.len() == 1 {
                return provider.submit_entry(&entry.key, bytes, metadata).await;
            }

            let mut metadata = metadata.clone();
            metadata.insert(META_NUM_CHUNKS, ranges.len().to_string());
            for (n, range) in ranges.iter().enumerate().skip(1) {
                let part = bytes.slice(range.start as usize..range.end as usize);
                provider
                    .submit_entry(&chunk_key(&entry.key, n as u64), part, &Default::default())
                    .await?;
            }
            let first = bytes.slice(ranges[0].start as usize..ranges[0].end as usize);
            provider.submit_entry(&entry.key, first, &metadata).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::EntryMetadata;
    use crate::services::storage::{memory::MemoryStore, read_object};
    use std::sync::Arc;
    use tempfile::TempDir;

    fn fast() -> BatchOptions {
        BatchOptions {
            concurrency: 4,
            max_retries: 3,
            initial_backoff: Duration::from_millis(10),
        }
    }

    async fn staged(dir: &TempDir, name: &str, bytes: &[u8]) -> BatchEntry {
        let path = dir.path().join(name);
        fs::write(&path, bytes).await.unwrap();
        BatchEntry::write(name, path, bytes.len() as u64, EntryMetadata::new())
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_deadline_only_moves_forward() {
        let backoff = GlobalBackoff::new();
        assert!(backoff.deadline().is_none());

        let d3 = backoff.push(3, Duration::from_secs(60));
        let d1 = backoff.push(1, Duration::from_secs(60));
        assert_eq!(d1, d3, "smaller push must not pull the deadline back");

        tokio::time::advance(Duration::from_secs(170)).await;
        let d2 = backoff.push(2, Duration::from_secs(60));
        assert!(d2 > d3);
        assert_eq!(backoff.deadline(), Some(d2));
    }

    #[tokio::test(start_paused = true)]
    async fn shared_deadline_delays_other_workers() {
        let backoff = GlobalBackoff::new();
        let start = Instant::now();
        backoff.push(2, Duration::from_secs(60));
        backoff.wait().await;
        assert!(Instant::now() - start >= Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn one_failing_entry_does_not_abort_the_batch() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        let mut entries = Vec::new();
        for i in 0..10 {
            entries.push(staged(&dir, &format!("k{i}"), format!("v{i}").as_bytes()).await);
        }
        store.fail_always("k7", 503);

        let report = run_batch(&store, entries, &fast()).await;
        assert_eq!(report.succeeded.len(), 9);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "k7");
        assert_eq!(store.calls("k7"), 3, "retried up to max attempts");
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_to_success() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.fail_times("k", 429, 2);
        let report = run_batch(&store, vec![staged(&dir, "k", b"body").await], &fast()).await;
        assert!(!report.has_failures());
        assert_eq!(store.calls("k"), 3);
        assert_eq!(store.body("k").as_deref(), Some(&b"body"[..]));
    }

    #[tokio::test]
    async fn non_retryable_status_fails_once() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.fail_always("k", 403);
        let report = run_batch(&store, vec![staged(&dir, "k", b"x").await], &fast()).await;
        assert_eq!(report.failed.len(), 1);
        assert_eq!(store.calls("k"), 1);
    }

    #[tokio::test]
    async fn every_entry_is_processed_exactly_once() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut entries = Vec::new();
        for i in 0..50 {
            entries.push(staged(&dir, &format!("e{i}"), b"z").await);
        }
        let report = run_batch(store.as_ref(), entries, &BatchOptions::default()).await;
        assert_eq!(report.succeeded.len(), 50);
        for i in 0..50 {
            assert_eq!(store.calls(&format!("e{i}")), 1);
        }
    }

    #[tokio::test]
    async fn oversized_writes_are_chunked_and_reassemble() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::with_chunk_size(16);
        let body: Vec<u8> = (0..(3 * 16 + 1)).map(|i| i as u8).collect();
        let report = run_batch(&store, vec![staged(&dir, "big", &body).await], &fast()).await;
        assert!(!report.has_failures());

        assert_eq!(store.keys(), vec!["big", "big_1", "big_2", "big_3"]);
        let entry = read_object(&store, "big").await.unwrap().unwrap();
        assert_eq!(entry.body.as_ref(), body.as_slice());
        assert_eq!(entry.metadata.get_u64("numChunks"), Some(4));
    }

    #[tokio::test]
    async fn deletes_of_absent_keys_succeed() {
        let store = MemoryStore::new();
        let report = run_batch(&store, vec![BatchEntry::delete("nope")], &fast()).await;
        assert_eq!(report.succeeded, vec!["nope".to_string()]);
    }
}
