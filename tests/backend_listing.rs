use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use serde_json::json;
use static_publish::services::storage::{KvConfig, KvStore, S3Config, S3Store, StorageProvider};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::net::TcpListener;

/// Query parameters of every listing request a stub received, plus the
/// `authorization` header under that name.
type Seen = Arc<Mutex<Vec<HashMap<String, String>>>>;

const KV_KEYS_ROUTE: &str = "/accounts/{account}/storage/kv/namespaces/{namespace}/keys";

async fn spawn(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await });
    format!("http://{addr}")
}

fn record(seen: &Seen, headers: &HeaderMap, mut query: HashMap<String, String>) -> HashMap<String, String> {
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    query.insert("authorization".into(), auth);
    seen.lock().unwrap().push(query.clone());
    query
}

async fn kv_keys(
    State(seen): State<Seen>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let query = record(&seen, &headers, query);
    match query.get("cursor").map(String::as_str) {
        None => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "result": [{ "name": "p_files_a" }, { "name": "p_files_b" }],
                "result_info": { "cursor": "page-2", "count": 2 }
            })),
        ),
        Some("page-2") => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "result": [{ "name": "p_files_c" }],
                "result_info": { "cursor": "", "count": 1 }
            })),
        ),
        Some(_) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "errors": [{ "code": 10001, "message": "bad cursor" }] })),
        ),
    }
}

async fn s3_list(
    State(seen): State<Seen>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
    Query(mut query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    query.insert("bucket".into(), bucket);
    let query = record(&seen, &headers, query);
    let xml = [(header::CONTENT_TYPE, "application/xml")];
    match query.get("continuation-token").map(String::as_str) {
        None => (
            StatusCode::OK,
            xml,
            concat!(
                "<ListBucketResult><Name>site</Name><IsTruncated>true</IsTruncated>",
                "<NextContinuationToken>tok/+1</NextContinuationToken>",
                "<Contents><Key>p_files_a&amp;b</Key><Size>1</Size></Contents>",
                "<Contents><Key>p_files_c</Key><Size>2</Size></Contents>",
                "</ListBucketResult>"
            ),
        ),
        Some("tok/+1") => (
            StatusCode::OK,
            xml,
            concat!(
                "<ListBucketResult><Name>site</Name><IsTruncated>false</IsTruncated>",
                "<Contents><Key>p_files_d</Key><Size>3</Size></Contents>",
                "</ListBucketResult>"
            ),
        ),
        Some(_) => (StatusCode::BAD_REQUEST, xml, "<Error><Code>InvalidArgument</Code></Error>"),
    }
}

fn kv_store(api_url: String) -> KvStore {
    KvStore::new(&KvConfig {
        api_url,
        account_id: "acct".into(),
        namespace_id: "ns".into(),
        api_token: "token".into(),
    })
    .unwrap()
}

#[tokio::test]
async fn kv_listing_follows_cursors() {
    let seen = Seen::default();
    let app = Router::new()
        .route(KV_KEYS_ROUTE, get(kv_keys))
        .with_state(seen.clone());
    let store = kv_store(spawn(app).await);

    let keys = store.list("p_files_").await.unwrap().unwrap();
    assert_eq!(keys, vec!["p_files_a", "p_files_b", "p_files_c"]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|q| q["prefix"] == "p_files_"));
    assert!(seen.iter().all(|q| q["authorization"] == "Bearer token"));
    assert!(!seen[0].contains_key("cursor"));
    assert_eq!(seen[1]["cursor"], "page-2");
}

#[tokio::test]
async fn kv_listing_reports_unsupported_backends() {
    let app = Router::new().route(KV_KEYS_ROUTE, get(|| async { StatusCode::METHOD_NOT_ALLOWED }));
    let store = kv_store(spawn(app).await);

    assert!(store.list("p_").await.unwrap().is_none());
}

#[tokio::test]
async fn s3_listing_follows_continuation_tokens() {
    let seen = Seen::default();
    let app = Router::new()
        .route("/{bucket}", get(s3_list))
        .with_state(seen.clone());
    let store = S3Store::new(&S3Config {
        endpoint: spawn(app).await,
        bucket: "site".into(),
        region: "us-east-1".into(),
        access_key_id: "AKIDEXAMPLE".into(),
        secret_access_key: "secret".into(),
    })
    .unwrap();

    let keys = store.list("p_files_").await.unwrap().unwrap();
    assert_eq!(keys, vec!["p_files_a&b", "p_files_c", "p_files_d"]);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    for query in seen.iter() {
        assert_eq!(query["bucket"], "site");
        assert_eq!(query["list-type"], "2");
        assert_eq!(query["prefix"], "p_files_");
        assert!(query["authorization"].starts_with("AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"));
    }
    assert_eq!(seen[1]["continuation-token"], "tok/+1");
}
