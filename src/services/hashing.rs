//! Content hashing, variant encoding and chunk planning.

use crate::models::asset::ContentEncoding;
use flate2::{Compression, write::GzEncoder};
use sha2::{Digest, Sha256};
use std::{io::Write, ops::Range};

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 11;
const BROTLI_LG_WINDOW: u32 = 22;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Encode identity bytes into the requested variant.
///
/// Output is deterministic for a given input so republishing unchanged
/// files produces identical hashes.
pub fn encode(bytes: &[u8], encoding: ContentEncoding) -> std::io::Result<Vec<u8>> {
    match encoding {
        ContentEncoding::Identity => Ok(bytes.to_vec()),
        ContentEncoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
            encoder.write_all(bytes)?;
            encoder.finish()
        }
        ContentEncoding::Brotli => {
            let mut writer = brotli::CompressorWriter::new(
                Vec::new(),
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LG_WINDOW,
            );
            writer.write_all(bytes)?;
            writer.flush()?;
            Ok(writer.into_inner())
        }
    }
}

/// Whether precompressing this content type is worthwhile.
pub fn is_compressible(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence.starts_with("text/")
        || essence.ends_with("+json")
        || essence.ends_with("+xml")
        || matches!(
            essence.as_str(),
            "application/json"
                | "application/javascript"
                | "application/x-javascript"
                | "application/xml"
                | "application/wasm"
                | "application/manifest+json"
                | "image/svg+xml"
                | "image/x-icon"
        )
}

/// Number of backend objects needed for `size` bytes.
///
/// `None` means the backend has no per-object limit. An empty object still
/// occupies one key.
pub fn chunk_count(size: u64, chunk_size: Option<u64>) -> u64 {
    match chunk_size {
        Some(limit) if limit > 0 => size.div_ceil(limit).max(1),
        _ => 1,
    }
}

/// Byte ranges of each chunk, in order.
pub fn chunk_ranges(size: u64, chunk_size: Option<u64>) -> Vec<Range<u64>> {
    let count = chunk_count(size, chunk_size);
    let step = match chunk_size {
        Some(limit) if limit > 0 && count > 1 => limit,
        _ => return vec![0..size],
    };
    (0..count)
        .map(|i| {
            let start = i * step;
            start..(start + step).min(size)
        })
        .collect()
}
