mod common;

use common::{Fixture, fast_batch, html};
use static_publish::{
    models::{
        asset::{AssetVariantMetadata, ContentEncoding},
        index::IndexMetadata,
    },
    services::{
        clean::{self, CleanOptions},
        collections::{self, CollectionError},
        hashing,
        keys::chunk_key,
        publish::{self, PublishError},
        resolve,
        storage::{StorageError, StorageProvider, read_object},
    },
};
use bytes::Bytes;
use std::time::Duration;

fn clean_options(now: i64, delete_expired: bool) -> CleanOptions {
    CleanOptions {
        delete_expired_collections: delete_expired,
        dry_run: false,
        now,
        batch: fast_batch(),
    }
}

#[tokio::test]
async fn republishing_is_idempotent() {
    let fx = Fixture::new(None).await;
    let index_html = html("hello");
    let root = fx.site(
        "site",
        &[
            ("index.html", index_html.as_slice()),
            ("static/app.js", &b"console.log('app');"[..]),
            ("img/logo.png", &[0x89u8, b'P', b'N', b'G'][..]),
        ],
    );
    let opts = fx.options("live");

    let first = publish::publish_directory(&fx.store, &fx.publish_id, &root, &opts)
        .await
        .unwrap();
    assert_eq!(first.assets, 3);
    assert!(first.uploaded > 0);

    let (index_a, _) = collections::load_index(&fx.store, &fx.publish_id, "live")
        .await
        .unwrap()
        .unwrap();
    let second = publish::publish_directory(&fx.store, &fx.publish_id, &root, &opts)
        .await
        .unwrap();
    let (index_b, _) = collections::load_index(&fx.store, &fx.publish_id, "live")
        .await
        .unwrap()
        .unwrap();

    assert_eq!(second.uploaded, 0);
    assert_eq!(second.deduplicated, first.objects);
    assert_eq!(index_a, index_b);
}

#[tokio::test]
async fn identical_files_are_stored_once() {
    let fx = Fixture::new(None).await;
    let root = fx.site("site", &[("a/same.bin", &b"\x00\x01same"[..]), ("b/same.bin", &b"\x00\x01same"[..])]);

    let summary = publish::publish_directory(&fx.store, &fx.publish_id, &root, &fx.options("live"))
        .await
        .unwrap();
    assert_eq!(summary.assets, 2);
    assert_eq!(summary.objects, 1);

    let files = fx
        .store
        .list(&fx.publish_id.files_prefix())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(files.len(), 1);
}

#[tokio::test]
async fn large_objects_are_chunked_and_reassembled() {
    let fx = Fixture::new(Some(1024)).await;
    let body: Vec<u8> = (0..(3 * 1024 + 1)).map(|i| (i * 7 % 251) as u8).collect();
    let root = fx.site("site", &[("blob.bin", body.as_slice())]);

    publish::publish_directory(&fx.store, &fx.publish_id, &root, &fx.options("live"))
        .await
        .unwrap();

    let hash = hashing::sha256_hex(&body);
    let primary = fx.publish_id.storage_key(&hash, ContentEncoding::Identity);
    let mut keys = fx
        .store
        .list(&fx.publish_id.files_prefix())
        .await
        .unwrap()
        .unwrap();
    keys.sort();
    let mut expected: Vec<String> = (0..4).map(|n| chunk_key(&primary, n)).collect();
    expected.sort();
    assert_eq!(keys, expected);

    let entry = read_object(&fx.store, &primary).await.unwrap().unwrap();
    assert_eq!(entry.body.as_ref(), body.as_slice());
    assert_eq!(entry.metadata.get_u64("numChunks"), Some(4));

    let (index, _) = collections::load_index(&fx.store, &fx.publish_id, "live")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(index.get("/blob.bin").unwrap().identity().unwrap().num_chunks, Some(4));
}

#[tokio::test]
async fn gc_keeps_every_hash_a_live_index_references() {
    let fx = Fixture::new(None).await;
    let shared = html("shared");
    let only_a = html("only in a");
    let only_b = html("only in b");
    let site_a = fx.site("a", &[("index.html", shared.as_slice()), ("a.html", only_a.as_slice())]);
    let site_b = fx.site("b", &[("index.html", shared.as_slice()), ("b.html", only_b.as_slice())]);

    publish::publish_directory(&fx.store, &fx.publish_id, &site_a, &fx.options("preview"))
        .await
        .unwrap();
    publish::publish_directory(&fx.store, &fx.publish_id, &site_b, &fx.options("live"))
        .await
        .unwrap();

    // Nothing is unreferenced yet.
    let summary = clean::clean(&fx.store, &fx.publish_id, &clean_options(0, false))
        .await
        .unwrap();
    assert!(summary.deleted.is_empty());

    collections::delete_collection(&fx.store, &fx.publish_id, "preview", false, &fast_batch())
        .await
        .unwrap();
    let summary = clean::clean(&fx.store, &fx.publish_id, &clean_options(0, false))
        .await
        .unwrap();
    assert!(!summary.deleted.is_empty());
    assert!(summary.failed.is_empty());

    // Every variant of the surviving collection is still readable.
    let (live, _) = collections::load_index(&fx.store, &fx.publish_id, "live")
        .await
        .unwrap()
        .unwrap();
    for entry in live.entries() {
        for variant in &entry.variants {
            resolve::fetch_variant(&fx.store, &fx.publish_id, variant)
                .await
                .unwrap();
        }
    }

    // And nothing that only the deleted collection used survives.
    let only_a_key = fx
        .publish_id
        .storage_key(&hashing::sha256_hex(&only_a), ContentEncoding::Identity);
    assert!(fx.store.get_entry_info(&only_a_key).await.unwrap().is_none());
    let stored = fx
        .store
        .list(&fx.publish_id.files_prefix())
        .await
        .unwrap()
        .unwrap();
    let referenced = live.referenced_hashes();
    for key in stored {
        let hash = fx.publish_id.hash_from_object_key(&key).unwrap();
        assert!(referenced.contains(hash), "{key} should have been collected");
    }
}

#[tokio::test]
async fn expired_collections_are_removed_on_request() {
    let fx = Fixture::new(None).await;
    let root = fx.site("pr", &[("index.html", html("pr build").as_slice())]);
    let mut opts = fx.options("pr-12");
    opts.expires_in = Some(Duration::from_secs(60));
    let summary = publish::publish_directory(&fx.store, &fx.publish_id, &root, &opts)
        .await
        .unwrap();
    let expires = summary.metadata.expiration_time.unwrap();

    let listed = collections::list_collections(&fx.store, &fx.publish_id)
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].metadata.expiration_time, Some(expires));

    let cleaned = clean::clean(&fx.store, &fx.publish_id, &clean_options(expires - 1, true))
        .await
        .unwrap();
    assert!(cleaned.expired_collections.is_empty());

    let cleaned = clean::clean(&fx.store, &fx.publish_id, &clean_options(expires + 1, true))
        .await
        .unwrap();
    assert_eq!(cleaned.expired_collections, vec!["pr-12".to_string()]);
    assert!(collections::list_collections(&fx.store, &fx.publish_id).await.unwrap().is_empty());
    assert!(
        fx.store
            .list(&fx.publish_id.files_prefix())
            .await
            .unwrap()
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn false_positive_dedup_is_contained() {
    let fx = Fixture::new(Some(1024)).await;
    let body: Vec<u8> = (0..2500).map(|i| (i % 256) as u8).collect();
    let hash = hashing::sha256_hex(&body);
    let primary = fx.publish_id.storage_key(&hash, ContentEncoding::Identity);

    // A primary that claims three chunks although the others were never written.
    let claimed = AssetVariantMetadata {
        content_encoding: ContentEncoding::Identity,
        size: body.len() as u64,
        hash: hash.clone(),
        num_chunks: Some(3),
    };
    fx.store
        .submit_entry(&primary, Bytes::copy_from_slice(&body[..1024]), &claimed.to_metadata())
        .await
        .unwrap();

    let root = fx.site("site", &[("data.bin", body.as_slice()), ("ok.bin", &b"\x00fine"[..])]);
    let summary = publish::publish_directory(&fx.store, &fx.publish_id, &root, &fx.options("live"))
        .await
        .unwrap();
    assert_eq!(summary.deduplicated, 1);

    // The bad object surfaces as an error, never as wrong bytes.
    let err = resolve::fetch_variant(&fx.store, &fx.publish_id, &claimed)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        resolve::ResolveError::Storage(StorageError::Inconsistent { .. })
    ));

    // Other assets of the same publish are unaffected.
    let (index, meta) = collections::load_index(&fx.store, &fx.publish_id, "live")
        .await
        .unwrap()
        .unwrap();
    assert!(meta.published_time.is_some());
    let ok = index.get("/ok.bin").unwrap().identity().unwrap();
    let entry = resolve::fetch_variant(&fx.store, &fx.publish_id, ok).await.unwrap();
    assert_eq!(entry.body.as_ref(), b"\x00fine");
}

#[tokio::test]
async fn oversized_index_is_rejected() {
    let fx = Fixture::new(Some(256)).await;
    let files: Vec<(String, Vec<u8>)> = (0..20)
        .map(|i| (format!("f{i:02}.bin"), vec![i as u8; 4]))
        .collect();
    let refs: Vec<(&str, &[u8])> = files.iter().map(|(p, b)| (p.as_str(), b.as_slice())).collect();
    let root = fx.site("site", &refs);

    let err = publish::publish_directory(&fx.store, &fx.publish_id, &root, &fx.options("live"))
        .await
        .unwrap_err();
    assert!(matches!(err, PublishError::IndexTooLarge { .. }));
    assert!(
        collections::load_index(&fx.store, &fx.publish_id, "live")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn default_collection_is_protected() {
    let fx = Fixture::new(None).await;
    let root = fx.site("site", &[("index.html", html("x").as_slice())]);
    publish::publish_directory(&fx.store, &fx.publish_id, &root, &fx.options("live"))
        .await
        .unwrap();

    let err = collections::delete_collection(&fx.store, &fx.publish_id, "live", false, &fast_batch())
        .await
        .unwrap_err();
    assert!(matches!(err, CollectionError::Protected(_)));
    let listed = collections::list_collections(&fx.store, &fx.publish_id).await.unwrap();
    assert_eq!(listed[0].name, "live");
    assert_eq!(
        IndexMetadata::from_metadata(
            &fx.store
                .get_entry_info(&fx.publish_id.index_key("live"))
                .await
                .unwrap()
                .unwrap()
                .metadata
        ),
        listed[0].metadata
    );
}
