#![allow(dead_code)]

use static_publish::{
    models::{asset::ContentEncoding, index::CollectionSettings},
    services::{
        batch::BatchOptions, keys::PublishId, publish::PublishOptions, storage::LocalStore,
    },
};
use std::{fs, path::PathBuf, time::Duration};
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub store: LocalStore,
    pub publish_id: PublishId,
}

impl Fixture {
    pub async fn new(chunk_size: Option<u64>) -> Self {
        let dir = TempDir::new().unwrap();
        let store = LocalStore::open(dir.path().join("store"), chunk_size)
            .await
            .unwrap();
        let publish_id = PublishId::load_or_create(&dir.path().join("state"))
            .await
            .unwrap();
        Self {
            dir,
            store,
            publish_id,
        }
    }

    /// Create a site directory named `name` with the given files.
    pub fn site(&self, name: &str, files: &[(&str, &[u8])]) -> PathBuf {
        let root = self.dir.path().join(name);
        for (path, body) in files {
            let path = root.join(path);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, body).unwrap();
        }
        root
    }

    pub fn options(&self, collection: &str) -> PublishOptions {
        PublishOptions {
            collection: collection.into(),
            encodings: vec![ContentEncoding::Brotli, ContentEncoding::Gzip],
            settings: CollectionSettings {
                static_prefixes: vec!["/static/".into()],
                spa_fallback: None,
                not_found_page: Some("/404.html".into()),
            },
            expires_in: None,
            staging_dir: self.dir.path().join("state/staging"),
            batch: fast_batch(),
        }
    }
}

pub fn fast_batch() -> BatchOptions {
    BatchOptions {
        concurrency: 4,
        max_retries: 2,
        initial_backoff: Duration::from_millis(5),
    }
}

pub fn html(body: &str) -> Vec<u8> {
    format!("<!doctype html><html><body>{}</body></html>", body.repeat(40)).into_bytes()
}
