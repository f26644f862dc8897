//! Enumerate the local file tree that becomes a collection.

use std::{
    io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use walkdir::WalkDir;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// One regular file under the publish root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LocalFile {
    /// `/` followed by the path relative to the root, with `/` separators.
    pub asset_key: String,
    pub path: PathBuf,
    pub content_type: String,
    /// Modification time, unix seconds.
    pub last_modified_time: i64,
}

/// Collect every non-hidden regular file below `root`, sorted by asset key.
pub fn walk_tree(root: &Path) -> io::Result<Vec<LocalFile>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(io::Error::other)?;
        let asset_key = format!(
            "/{}",
            relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/")
        );

        let modified = entry.metadata().map_err(io::Error::other)?.modified()?;
        let last_modified_time = modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();

        let content_type = mime_guess::from_path(entry.path())
            .first_raw()
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();

        files.push(LocalFile {
            asset_key,
            path: entry.path().to_path_buf(),
            content_type,
            last_modified_time,
        });
    }

    files.sort_by(|a, b| a.asset_key.cmp(&b.asset_key));
    Ok(files)
}

/// Whether `asset_key` falls under one of the long-lived cache prefixes.
pub fn is_static_asset(asset_key: &str, static_prefixes: &[String]) -> bool {
    static_prefixes
        .iter()
        .any(|prefix| asset_key.starts_with(prefix.as_str()))
}
