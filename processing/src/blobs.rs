//! Raw creative bytes, stored once per (advertiser, content hash).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::debug;

pub trait BlobStore: Send + Sync {
    /// Store `bytes` unless the blob already exists.  Returns `true` when
    /// something was written.
    fn put(&self, advertiser_store_id: &str, md5_hash: &str, file_extension: &str, bytes: &[u8]) -> Result<bool>;
}

/// `<root>/<advertiser_store_id>/<md5>.<ext>` on the local filesystem.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn blob_path(&self, advertiser_store_id: &str, md5_hash: &str, file_extension: &str) -> PathBuf {
        self.root
            .join(sanitize(advertiser_store_id))
            .join(format!("{md5_hash}.{file_extension}"))
    }
}

/// Store ids are package names; anything else must not escape the root.
fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, advertiser_store_id: &str, md5_hash: &str, file_extension: &str, bytes: &[u8]) -> Result<bool> {
        let path = self.blob_path(advertiser_store_id, md5_hash, file_extension);
        if path.exists() {
            debug!("Creative already stored: {}", path.display());
            return Ok(false);
        }
        let dir = path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(dir).with_context(|| format!("Cannot create {}", dir.display()))?;

        // Write to a .part file first so a crash never leaves a truncated blob.
        let part_path = path.with_extension(format!("{file_extension}.part"));
        std::fs::write(&part_path, bytes)
            .with_context(|| format!("Cannot write {}", part_path.display()))?;
        std::fs::rename(&part_path, &path)
            .with_context(|| format!("Cannot rename to {}", path.display()))?;
        debug!("Stored creative {}", path.display());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_skips_existing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        assert!(store.put("com.adv", "abc123", "png", b"first").unwrap());
        assert!(!store.put("com.adv", "abc123", "png", b"second").unwrap());
        let path = store.blob_path("com.adv", "abc123", "png");
        assert_eq!(path, dir.path().join("com.adv").join("abc123.png"));
        assert_eq!(std::fs::read(path).unwrap(), b"first");
    }

    #[test]
    fn test_store_id_cannot_escape_root() {
        let store = FsBlobStore::new("/data/creatives");
        assert_eq!(
            store.blob_path("../etc", "x", "png"),
            PathBuf::from("/data/creatives/.._etc/x.png")
        );
        assert_eq!(store.blob_path("..", "x", "png"), PathBuf::from("/data/creatives/_/x.png"));
    }
}
