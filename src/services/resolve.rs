//! Serve-time resolution: which asset answers a path, which variant answers
//! an `Accept-Encoding`, and whether a conditional request can stop at 304.

use crate::models::{
    asset::{AssetEntry, AssetVariantMetadata, ContentEncoding},
    index::{CollectionIndex, CollectionSettings},
};
use crate::services::{
    keys::PublishId,
    storage::{Entry, StorageError, StorageProvider, read_object},
};
use axum::http::{Method, StatusCode};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const STATIC_CACHE_CONTROL: &str = "public, max-age=31536000, immutable";
pub const REVALIDATE_CACHE_CONTROL: &str = "no-cache";

/// Extra reads after a miss, for objects not yet visible after a write.
pub const READ_RETRIES: u32 = 3;
pub const READ_RETRY_STEP: Duration = Duration::from_millis(250);

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("content object `{0}` is not available")]
    Missing(String),
    #[error("asset `{0}` has no stored variants")]
    NoVariant(String),
}

/// Encodings the client accepts, grouped by descending q-value.
///
/// Each group lists encodings in header order. Encodings with `q=0` and
/// tokens this server never stores are dropped. A `*` expands to every
/// stored encoding the header did not name explicitly.
pub fn parse_accept_encoding(header: Option<&str>) -> Vec<Vec<ContentEncoding>> {
    let Some(header) = header else {
        return Vec::new();
    };

    let mut weighted: Vec<(u32, ContentEncoding)> = Vec::new();
    let mut named: Vec<ContentEncoding> = Vec::new();
    let mut wildcard: Option<u32> = None;

    for item in header.split(',') {
        let mut parts = item.split(';');
        let token = parts.next().unwrap_or_default().trim().to_ascii_lowercase();
        if token.is_empty() {
            continue;
        }
        let q = parts
            .filter_map(|p| p.trim().strip_prefix("q=").or_else(|| p.trim().strip_prefix("Q=")))
            .find_map(parse_qvalue)
            .unwrap_or(1000);

        if token == "*" {
            wildcard = Some(q);
            continue;
        }
        let Ok(encoding) = token.parse::<ContentEncoding>() else {
            continue;
        };
        named.push(encoding);
        if q > 0 {
            weighted.push((q, encoding));
        }
    }

    if let Some(q) = wildcard.filter(|q| *q > 0) {
        for encoding in [ContentEncoding::Brotli, ContentEncoding::Gzip, ContentEncoding::Identity] {
            if !named.contains(&encoding) {
                weighted.push((q, encoding));
            }
        }
    }

    // Stable sort keeps header order within a q-value.
    weighted.sort_by(|a, b| b.0.cmp(&a.0));
    let mut groups: Vec<(u32, Vec<ContentEncoding>)> = Vec::new();
    for (q, encoding) in weighted {
        match groups.last_mut() {
            Some((last_q, group)) if *last_q == q => {
                if !group.contains(&encoding) {
                    group.push(encoding);
                }
            }
            _ => groups.push((q, vec![encoding])),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

/// q-value scaled to thousandths.
fn parse_qvalue(raw: &str) -> Option<u32> {
    let q: f32 = raw.trim().parse().ok()?;
    (0.0..=1.0).contains(&q).then(|| (q * 1000.0).round() as u32)
}

/// Pick the variant to send.
///
/// Groups are tried in order; within the first group that matches any
/// stored variant, the smallest wins, ties going to the encoding listed
/// first. Falls back to the identity variant.
pub fn select_variant<'a>(
    entry: &'a AssetEntry,
    groups: &[Vec<ContentEncoding>],
) -> Option<&'a AssetVariantMetadata> {
    for group in groups {
        let best = group
            .iter()
            .enumerate()
            .filter_map(|(rank, encoding)| entry.variant(*encoding).map(|v| (v.size, rank, v)))
            .min_by_key(|(size, rank, _)| (*size, *rank));
        if let Some((_, _, variant)) = best {
            return Some(variant);
        }
    }
    entry.identity().or_else(|| entry.variants.first())
}

/// Find the asset that answers `path`, with the status to send it with.
///
/// Tries the exact key, then `index.html` inside it as a directory, then
/// the single-page fallback (200), then the not-found page (404).
pub fn resolve_asset<'a>(
    index: &'a CollectionIndex,
    settings: &CollectionSettings,
    path: &str,
) -> Option<(&'a AssetEntry, StatusCode)> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };

    if let Some(entry) = index.get(&path) {
        return Some((entry, StatusCode::OK));
    }
    let directory_index = if path.ends_with('/') {
        format!("{path}index.html")
    } else {
        format!("{path}/index.html")
    };
    if let Some(entry) = index.get(&directory_index) {
        return Some((entry, StatusCode::OK));
    }
    if let Some(entry) = settings.spa_fallback.as_deref().and_then(|k| index.get(k)) {
        return Some((entry, StatusCode::OK));
    }
    settings
        .not_found_page
        .as_deref()
        .and_then(|k| index.get(k))
        .map(|entry| (entry, StatusCode::NOT_FOUND))
}

/// Strong entity tag for a variant.
pub fn etag(variant: &AssetVariantMetadata) -> String {
    format!("\"{}\"", variant.hash)
}

pub fn cache_control(entry: &AssetEntry) -> &'static str {
    if entry.is_static {
        STATIC_CACHE_CONTROL
    } else {
        REVALIDATE_CACHE_CONTROL
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    Proceed,
    NotModified,
}

/// Evaluate `If-None-Match` and `If-Modified-Since` for one response.
///
/// When `If-None-Match` is present it alone decides; `If-Modified-Since`
/// only applies to GET and HEAD.
pub fn evaluate_preconditions(
    method: &Method,
    etag: &str,
    last_modified: i64,
    if_none_match: Option<&str>,
    if_modified_since: Option<&str>,
) -> Precondition {
    if let Some(header) = if_none_match {
        let matched = header
            .split(',')
            .map(str::trim)
            .any(|tag| tag == "*" || tag == etag);
        return if matched {
            Precondition::NotModified
        } else {
            Precondition::Proceed
        };
    }

    if *method != Method::GET && *method != Method::HEAD {
        return Precondition::Proceed;
    }
    match if_modified_since.and_then(parse_http_date) {
        Some(since) if last_modified <= since => Precondition::NotModified,
        _ => Precondition::Proceed,
    }
}

/// Parse an HTTP-date in any of the three formats clients send.
pub fn parse_http_date(value: &str) -> Option<i64> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.timestamp());
    }
    ["%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive).timestamp())
}

pub fn format_http_date(timestamp: i64) -> String {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .unwrap_or_default()
        .format(HTTP_DATE_FORMAT)
        .to_string()
}

/// Read a variant's bytes, retrying misses that may be replication lag.
pub async fn fetch_variant<P>(
    provider: &P,
    publish_id: &PublishId,
    variant: &AssetVariantMetadata,
) -> Result<Entry, ResolveError>
where
    P: StorageProvider + ?Sized,
{
    let key = publish_id.storage_key(&variant.hash, variant.content_encoding);
    for attempt in 0..=READ_RETRIES {
        if attempt > 0 {
            let delay = READ_RETRY_STEP * attempt;
            debug!(key = %key, attempt, delay_ms = delay.as_millis() as u64, "object not visible yet");
            tokio::time::sleep(delay).await;
        }
        if let Some(entry) = read_object(provider, &key).await? {
            return Ok(entry);
        }
    }
    Err(ResolveError::Missing(key))
}
