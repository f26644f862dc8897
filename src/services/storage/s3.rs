//! S3-compatible object store client.
//!
//! Path-style requests (`{endpoint}/{bucket}/{key}`) signed with AWS
//! Signature V4. Object metadata travels as `x-amz-meta-*` headers, which
//! servers return lowercased. Objects have no practical size limit here, so
//! nothing is ever chunked.

use super::{Entry, EntryInfo, StorageError, StorageProvider, StorageResult};
use crate::models::metadata::EntryMetadata;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response, StatusCode, Url, header::HeaderMap};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

type HmacSha256 = Hmac<Sha256>;

const META_HEADER_PREFIX: &str = "x-amz-meta-";
const SERVICE: &str = "s3";

#[derive(Clone, Debug)]
pub struct S3Config {
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

pub struct S3Store {
    client: Client,
    endpoint: Url,
    config: S3Config,
}

/// Parts of a request that feed the signature.
struct SignedRequest {
    method: Method,
    canonical_uri: String,
    query: Vec<(String, String)>,
    payload_hash: String,
}

impl S3Store {
    pub fn new(config: &S3Config) -> StorageResult<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|err| StorageError::Service {
            message: format!("invalid S3 endpoint `{}`: {err}", config.endpoint),
            retryable: false,
        })?;
        let client = Client::builder()
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            config: config.clone(),
        })
    }

    fn host(&self) -> String {
        let host = self.endpoint.host_str().unwrap_or_default();
        match self.endpoint.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        }
    }

    fn object_uri(&self, key: &str) -> String {
        format!("/{}/{}", self.config.bucket, urlencoding::encode(key))
    }

    fn bucket_uri(&self) -> String {
        format!("/{}", self.config.bucket)
    }

    /// Build, sign and send one request.
    async fn send(
        &self,
        req: SignedRequest,
        body: Option<Bytes>,
        extra_headers: HeaderMap,
    ) -> StorageResult<Response> {
        let now = Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let host = self.host();
        let authorization = self.authorization(&req, &host, &amz_date, now)?;

        let mut url = self.endpoint.clone();
        url.set_path(&req.canonical_uri);
        let query = canonical_query(&req.query);
        url.set_query((!query.is_empty()).then_some(query.as_str()));

        let mut builder = self
            .client
            .request(req.method.clone(), url)
            .headers(extra_headers)
            .header("x-amz-date", &amz_date)
            .header("x-amz-content-sha256", &req.payload_hash)
            .header("authorization", authorization);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        Ok(builder.send().await?)
    }

    fn authorization(
        &self,
        req: &SignedRequest,
        host: &str,
        amz_date: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<String> {
        let date = now.format("%Y%m%d").to_string();
        let scope = format!("{date}/{}/{SERVICE}/aws4_request", self.config.region);
        let signed_headers = "host;x-amz-content-sha256;x-amz-date";
        let canonical_request = format!(
            "{}\n{}\n{}\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            req.method.as_str(),
            req.canonical_uri,
            canonical_query(&req.query),
            host,
            req.payload_hash,
            amz_date,
            signed_headers,
            req.payload_hash
        );
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let secret = format!("AWS4{}", self.config.secret_access_key);
        let k_date = hmac(secret.as_bytes(), date.as_bytes())?;
        let k_region = hmac(&k_date, self.config.region.as_bytes())?;
        let k_service = hmac(&k_region, SERVICE.as_bytes())?;
        let k_signing = hmac(&k_service, b"aws4_request")?;
        let signature = hex::encode(hmac(&k_signing, string_to_sign.as_bytes())?);

        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{scope}, SignedHeaders={signed_headers}, Signature={signature}",
            self.config.access_key_id
        ))
    }

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

    fn unsigned(&self, method: Method, canonical_uri: String, query: Vec<(String, String)>) -> SignedRequest {
        SignedRequest {
            method,
            canonical_uri,
            query,
            payload_hash: hex::encode(Sha256::digest(b"")),
        }
    }
}

fn hmac(key: &[u8], data: &[u8]) -> StorageResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| StorageError::Service {
        message: "failed to initialize hmac".to_string(),
        retryable: false,
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sorted, percent-encoded query string as required by SigV4.
fn canonical_query(query: &[(String, String)]) -> String {
    let mut pairs: Vec<(String, String)> = query
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

fn metadata_from_headers(headers: &HeaderMap) -> EntryMetadata {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().strip_prefix(META_HEADER_PREFIX)?;
            Some((name.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Text of every `<tag>…</tag>` occurrence, XML-unescaped.
fn xml_values(xml: &str, tag: &str) -> Vec<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut values = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(&close) else {
            break;
        };
        values.push(xml_unescape(&after[..end]));
        rest = &after[end + close.len()..];
    }
    values
}

fn xml_unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[async_trait]
impl StorageProvider for S3Store {
    fn kind(&self) -> &'static str {
        "s3"
    }

    fn chunk_size(&self) -> Option<u64> {
        None
    }

    async fn list(&self, prefix: &str) -> StorageResult<Option<Vec<String>>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut query = vec![
                ("list-type".to_string(), "2".to_string()),
                ("prefix".to_string(), prefix.to_string()),
            ];
            if let Some(t) = &token {
                query.push(("continuation-token".to_string(), t.clone()));
            }
            let req = self.unsigned(Method::GET, self.bucket_uri(), query);
            let response = self.send(req, None, HeaderMap::new()).await?;
            let xml = Self::check(response, prefix).await?.text().await?;

            let contents = xml
                .split("<Contents>")
                .skip(1)
                .filter_map(|block| xml_values(block, "Key").into_iter().next());
            keys.extend(contents);

            let truncated = xml_values(&xml, "IsTruncated")
                .first()
                .is_some_and(|v| v == "true");
            token = xml_values(&xml, "NextContinuationToken").into_iter().next();
            debug!(prefix, total = keys.len(), truncated, "listed objects");
            if !truncated || token.is_none() {
                break;
            }
        }
        Ok(Some(keys))
    }

    async fn get_entry(&self, key: &str) -> StorageResult<Option<Entry>> {
        let req = self.unsigned(Method::GET, self.object_uri(key), Vec::new());
        let response = self.send(req, None, HeaderMap::new()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, key).await?;
        let metadata = metadata_from_headers(response.headers());
        let body = response.bytes().await?;
        Ok(Some(Entry { body, metadata }))
    }

    async fn get_entry_info(&self, key: &str) -> StorageResult<Option<EntryInfo>> {
        let req = self.unsigned(Method::HEAD, self.object_uri(key), Vec::new());
        let response = self.send(req, None, HeaderMap::new()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::check(response, key).await?;
        Ok(Some(EntryInfo {
            metadata: metadata_from_headers(response.headers()),
            size: content_length(response.headers()),
        }))
    }

    async fn submit_entry(
        &self,
        key: &str,
        body: Bytes,
        metadata: &EntryMetadata,
    ) -> StorageResult<()> {
        let mut headers = HeaderMap::new();
        for (name, value) in metadata.iter() {
            let header_name = format!("{META_HEADER_PREFIX}{}", name.to_ascii_lowercase());
            let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(header_name.as_bytes()),
                reqwest::header::HeaderValue::from_str(value),
            ) else {
                return Err(StorageError::InvalidKey(format!("metadata `{header_name}`")));
            };
            headers.insert(name, value);
        }
        let content_md5 = general_purpose::STANDARD.encode(md5::compute(&body).0);
        if let Ok(value) = reqwest::header::HeaderValue::from_str(&content_md5) {
            headers.insert("content-md5", value);
        }

        let req = SignedRequest {
            method: Method::PUT,
            canonical_uri: self.object_uri(key),
            query: Vec::new(),
            payload_hash: hex::encode(Sha256::digest(&body)),
        };
        let response = self.send(req, Some(body), headers).await?;
        Self::check(response, key).await?;
        Ok(())
    }

    async fn delete_entry(&self, key: &str) -> StorageResult<()> {
        let req = self.unsigned(Method::DELETE, self.object_uri(key), Vec::new());
        let response = self.send(req, None, HeaderMap::new()).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::check(response, key).await?;
        Ok(())
    }
}
