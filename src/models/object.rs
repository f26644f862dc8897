//! Row stored by the local simulated backend for each key.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A single key in the local simulated store.
///
/// The row holds metadata only; the payload lives on disk at a path
/// derived from the key.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct StoredObject {
    /// Backend key, e.g. `<publishId>_files_sha256_<hex>`.
    pub key: String,

    /// Payload size in bytes.
    pub size_bytes: i64,

    /// JSON-encoded flat string map.
    pub metadata: String,
}
