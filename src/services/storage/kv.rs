//! Remote key-value store reached over its HTTP API.
//!
//! ## Endpoints (relative to `{api_url}/accounts/{account}/storage/kv/namespaces/{namespace}`)
//! - `GET    /keys?prefix=&cursor=` : paginated key listing
//! - `GET    /values/{key}`         : object body
//! - `GET    /metadata/{key}`       : object metadata only
//! - `PUT    /values/{key}`         : multipart form: `value` + JSON `metadata`
//! - `DELETE /values/{key}`         : remove object
//!
//! Values are capped at 25 MiB, so larger objects are chunked by the caller.

use super::{Entry, EntryInfo, StorageError, StorageProvider, StorageResult};
use crate::models::metadata::EntryMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, StatusCode, multipart};
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use tracing::{debug, warn};

pub const KV_CHUNK_SIZE: u64 = 25 * 1024 * 1024;
pub const DEFAULT_KV_API_URL: &str = "https://api.cloudflare.com/client/v4";
const LIST_LIMIT: u32 = 1000;

#[derive(Clone, Debug)]
pub struct KvConfig {
    pub api_url: String,
    pub account_id: String,
    pub namespace_id: String,
    pub api_token: String,
}

pub struct KvStore {
    client: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    #[serde(default)]
    success: bool,
    result: Option<T>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
    #[serde(default)]
    errors: Vec<ApiMessage>,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct KeyItem {
    name: String,
}

/// Metadata values may come back as strings or bare JSON scalars.
fn flatten_metadata(raw: BTreeMap<String, serde_json::Value>) -> EntryMetadata {
    raw.into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            };
            (k, value)
        })
        .collect()
}

impl KvStore {
    pub fn new(config: &KvConfig) -> StorageResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        let base_url = format!(
            "{}/accounts/{}/storage/kv/namespaces/{}",
            config.api_url.trim_end_matches('/'),
            config.account_id,
            config.namespace_id
        );
        Ok(Self {
            client,
            base_url,
            token: config.api_token.clone(),
        })
    }

    fn url(&self, section: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, section, urlencoding::encode(key))
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.bearer_auth(&self.token)
    }

    /// Turn a non-success response into a classified error.
    async fn check(response: Response, key: &str) -> StorageResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StorageError::Http {
            status: status.as_u16(),
            key: key.to_string(),
            body,
        })
    }

    async fn fetch_metadata(&self, key: &str) -> StorageResult<Option<EntryMetadata>> {
        let response = self
            .authed(self.client.get(self.url("metadata", key)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope: ApiEnvelope<Option<BTreeMap<String, serde_json::Value>>> =
            Self::check(response, key).await?.json().await?;
        if !envelope.success {
            return Err(service_error(&envelope.errors));
        }
        Ok(Some(flatten_metadata(
            envelope.result.flatten().unwrap_or_default(),
        )))
    }
}

/// The API reports throttling and internal faults with these error codes.
fn service_error(errors: &[ApiMessage]) -> StorageError {
    let retryable = errors
        .iter()
        .any(|e| matches!(e.code, 10013 | 10048 | 10051 | 10000));
    let message = errors
        .iter()
        .map(|e| format!("{} ({})", e.message, e.code))
        .collect::<Vec<_>>()
        .join("; ");
    StorageError::Service { message, retryable }
}

#[async_trait]
impl StorageProvider for KvStore {
    fn kind(&self) -> &'static str {
        "kv"
    }

    fn chunk_size(&self) -> Option<u64> {
        Some(KV_CHUNK_SIZE)
    }

    async fn list(&self, prefix: &str) -> StorageResult<Option<Vec<String>>> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let mut query = vec![
                ("prefix", prefix.to_string()),
                ("limit", LIST_LIMIT.to_string()),
            ];
            if let Some(c) = &cursor {
                query.push(("cursor", c.clone()));
            }
            let response = self
                .authed(self.client.get(format!("{}/keys", self.base_url)))
                .query(&query)
                .send()
                .await?;
            if matches!(
                response.status(),
                StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
            ) {
                warn!(prefix, "backend does not support key listing");
                return Ok(None);
            }
            let envelope: ApiEnvelope<Vec<KeyItem>> =
                Self::check(response, prefix).await?.json().await?;
            if !envelope.success {
                return Err(service_error(&envelope.errors));
            }
            let page = envelope.result.unwrap_or_default();
            debug!(prefix, page = page.len(), "listed keys");
            keys.extend(page.into_iter().map(|item| item.name));

            cursor = envelope
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }
        Ok(Some(keys))
    }

    async fn get_entry(&self, key: &str) -> StorageResult<Option<Entry>> {
        let response = self
            .authed(self.client.get(self.url("values", key)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = Self::check(response, key).await?.bytes().await?;
        let metadata = self.fetch_metadata(key).await?.unwrap_or_default();
        Ok(Some(Entry { body, metadata }))
    }

    async fn get_entry_info(&self, key: &str) -> StorageResult<Option<EntryInfo>> {
        Ok(self
            .fetch_metadata(key)
            .await?
            .map(|metadata| EntryInfo {
                metadata,
                size: None,
            }))
    }

    async fn submit_entry(
        &self,
        key: &str,
        body: Bytes,
        metadata: &EntryMetadata,
    ) -> StorageResult<()> {
        let form = multipart::Form::new()
            .part("value", multipart::Part::stream(body))
            .text("metadata", serde_json::to_string(metadata)?);
        let response = self
            .authed(self.client.put(self.url("values", key)))
            .multipart(form)
            .send()
            .await?;
        Self::check(response, key).await?;
        Ok(())
    }

    async fn delete_entry(&self, key: &str) -> StorageResult<()> {
        let response = self
            .authed(self.client.delete(self.url("values", key)))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, key).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> KvStore {
        KvStore::new(&KvConfig {
            api_url: "https://kv.example.test/v4/".into(),
            account_id: "acct".into(),
            namespace_id: "ns".into(),
            api_token: "token".into(),
        })
        .unwrap()
    }

    #[test]
    fn urls_encode_keys() {
        let store = store();
        assert_eq!(
            store.url("values", "p_index_live"),
            "https://kv.example.test/v4/accounts/acct/storage/kv/namespaces/ns/values/p_index_live"
        );
        assert!(store.url("values", "a b/c").ends_with("/values/a%20b%2Fc"));
    }

    #[test]
    fn metadata_scalars_are_flattened_to_strings() {
        let raw: BTreeMap<String, serde_json::Value> =
            serde_json::from_str(r#"{"size": 12, "hash": "ab", "numchunks": "2"}"#).unwrap();
        let meta = flatten_metadata(raw);
        assert_eq!(meta.get("size"), Some("12"));
        assert_eq!(meta.get_u64("numChunks"), Some(2));
    }

    #[test]
    fn throttling_codes_are_retryable() {
        let err = service_error(&[ApiMessage {
            code: 10013,
            message: "rate limited".into(),
        }]);
        assert!(err.is_retryable());
        let err = service_error(&[ApiMessage {
            code: 10009,
            message: "key not found".into(),
        }]);
        assert!(!err.is_retryable());
    }
}
