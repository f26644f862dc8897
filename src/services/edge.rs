//! Shared state for the edge server: the backend plus a cached snapshot of
//! the served collection's index and settings.

use crate::models::index::{CollectionIndex, CollectionSettings};
use crate::services::{
    collections::{self, CollectionError},
    keys::PublishId,
    storage::StorageProvider,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{Mutex, RwLock},
    time::Instant,
};
use tracing::{info, warn};

pub const DEFAULT_INDEX_TTL: Duration = Duration::from_secs(5);

/// One consistent view of a collection.
#[derive(Debug)]
pub struct Snapshot {
    pub index: CollectionIndex,
    pub settings: CollectionSettings,
    loaded_at: Instant,
}

#[derive(Clone)]
pub struct EdgeService {
    pub provider: Arc<dyn StorageProvider>,
    pub publish_id: PublishId,
    pub collection: String,
    /// How long a loaded index is served before it is read again.
    pub index_ttl: Duration,
    cache: Arc<RwLock<Option<Arc<Snapshot>>>>,
    reload: Arc<Mutex<()>>,
}

impl EdgeService {
    pub fn new(
        provider: Arc<dyn StorageProvider>,
        publish_id: PublishId,
        collection: impl Into<String>,
        index_ttl: Duration,
    ) -> Self {
        Self {
            provider,
            publish_id,
            collection: collection.into(),
            index_ttl,
            cache: Arc::new(RwLock::new(None)),
            reload: Arc::new(Mutex::new(())),
        }
    }

    /// Current snapshot, reloading it once the TTL has passed.
    ///
    /// One caller reloads at a time. While it does, everyone else is served
    /// the previous snapshot; only when there is none yet do they wait. A
    /// failed reload keeps serving the previous snapshot, if any.
    pub async fn snapshot(&self) -> Result<Arc<Snapshot>, CollectionError> {
        let current = self.cache.read().await.clone();
        if let Some(snapshot) = self.fresh(&current) {
            return Ok(snapshot);
        }

        let _reloading = match self.reload.try_lock() {
            Ok(guard) => guard,
            Err(_) => match &current {
                Some(stale) => return Ok(stale.clone()),
                None => self.reload.lock().await,
            },
        };

        // The reload we waited on may already have refreshed the cache.
        let current = self.cache.read().await.clone();
        if let Some(snapshot) = self.fresh(&current) {
            return Ok(snapshot);
        }

        match self.load().await {
            Ok(snapshot) => {
                let snapshot = Arc::new(snapshot);
                *self.cache.write().await = Some(snapshot.clone());
                Ok(snapshot)
            }
            Err(err) => match current {
                Some(stale) => {
                    warn!(collection = %self.collection, "index reload failed, serving previous: {}", err);
                    Ok(stale)
                }
                None => Err(err),
            },
        }
    }

    fn fresh(&self, cached: &Option<Arc<Snapshot>>) -> Option<Arc<Snapshot>> {
        cached
            .as_ref()
            .filter(|s| s.loaded_at.elapsed() < self.index_ttl)
            .cloned()
    }

    async fn load(&self) -> Result<Snapshot, CollectionError> {
        let provider = self.provider.as_ref();
        let (index, metadata) =
            collections::load_index(provider, &self.publish_id, &self.collection)
                .await?
                .ok_or_else(|| CollectionError::NotFound(self.collection.clone()))?;
        let settings =
            collections::load_settings(provider, &self.publish_id, &self.collection, &metadata)
                .await?;
        info!(collection = %self.collection, assets = index.len(), "loaded collection index");
        Ok(Snapshot {
            index,
            settings,
            loaded_at: Instant::now(),
        })
    }
}
