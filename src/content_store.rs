//! Content-addressable store
//!
//! Completed transcode outputs are promoted here, keyed by their
//! content fingerprint. The layout shards on the first two hex chars of
//! the fingerprint:
//!
//! ```text
//! content/<fp[0:2]>/<fp>/
//!   stream.mpd | stream.m3u8
//!   init/…
//!   segments/…
//!   metadata.json
//! ```
//!
//! Promotion is atomic: output is copied into a temp directory next to
//! the final location and renamed into place, so a partially written
//! entry is never visible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{PipelineError, Result};
use crate::fingerprint::shard_prefix;

const METADATA_FILE: &str = "metadata.json";
const LAST_ACCESS_FILE: &str = ".last-access";

/// Metadata stored alongside each content entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub media_id: String,
    pub format: String,
    pub manifest_url: String,
    pub retention_days: u32,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// Content-addressable on-disk store
pub struct ContentStore {
    root: PathBuf,
}

impl ContentStore {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, fingerprint: &str) -> PathBuf {
        self.root.join(shard_prefix(fingerprint)).join(fingerprint)
    }

    /// Pure lookup: does a completed entry exist for this fingerprint?
    pub fn exists(&self, fingerprint: &str) -> bool {
        self.entry_dir(fingerprint).join(METADATA_FILE).is_file()
    }

    /// Atomically promote `source_dir` into the store.
    ///
    /// If an entry for the fingerprint already exists the new output is
    /// discarded and the call succeeds (idempotent). A partially
    /// written source leaves the store unchanged and surfaces a
    /// storage error.
    pub fn store(
        &self,
        fingerprint: &str,
        source_dir: &Path,
        metadata: &ContentMetadata,
    ) -> Result<PathBuf> {
        let final_dir = self.entry_dir(fingerprint);
        if self.exists(fingerprint) {
            tracing::debug!(fingerprint = %fingerprint, "Content already stored, discarding new output");
            return Ok(final_dir);
        }

        if !source_dir.is_dir() {
            return Err(PipelineError::Storage(format!(
                "source directory missing: {}",
                source_dir.display()
            )));
        }
        // The manifest must be present before an entry becomes visible
        let manifest_name = Path::new(&metadata.manifest_url)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if manifest_name.is_empty() || !source_dir.join(&manifest_name).is_file() {
            return Err(PipelineError::Storage(format!(
                "source is incomplete, manifest {:?} not found in {}",
                manifest_name,
                source_dir.display()
            )));
        }

        let shard = self.root.join(shard_prefix(fingerprint));
        fs::create_dir_all(&shard)
            .map_err(|e| PipelineError::Storage(format!("create shard dir: {}", e)))?;

        let tmp_dir = shard.join(format!(".tmp-{}-{}", fingerprint, Uuid::new_v4()));
        let result = (|| -> Result<()> {
            copy_dir_recursive(source_dir, &tmp_dir)
                .map_err(|e| PipelineError::Storage(format!("copy into store: {}", e)))?;
            let json = serde_json::to_vec_pretty(metadata)
                .map_err(|e| PipelineError::Storage(format!("serialize metadata: {}", e)))?;
            fs::write(tmp_dir.join(METADATA_FILE), json)
                .map_err(|e| PipelineError::Storage(format!("write metadata: {}", e)))?;
            fs::write(tmp_dir.join(LAST_ACCESS_FILE), b"")
                .map_err(|e| PipelineError::Storage(format!("write access marker: {}", e)))?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_dir_all(&tmp_dir);
            return Err(e);
        }

        match fs::rename(&tmp_dir, &final_dir) {
            Ok(()) => {}
            Err(_) if final_dir.exists() => {
                // A concurrent writer promoted the same fingerprint first
                let _ = fs::remove_dir_all(&tmp_dir);
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&tmp_dir);
                return Err(PipelineError::Storage(format!("promote rename: {}", e)));
            }
        }

        tracing::info!(
            fingerprint = %fingerprint,
            dir = %final_dir.display(),
            "Promoted content into store"
        );
        Ok(final_dir)
    }

    /// Return the entry directory and metadata for a fingerprint.
    pub fn get(&self, fingerprint: &str) -> Result<(PathBuf, ContentMetadata)> {
        let dir = self.entry_dir(fingerprint);
        let raw = fs::read(dir.join(METADATA_FILE))
            .map_err(|_| PipelineError::ContentNotFound(fingerprint.to_string()))?;
        let metadata: ContentMetadata = serde_json::from_slice(&raw)
            .map_err(|e| PipelineError::Storage(format!("corrupt metadata for {}: {}", fingerprint, e)))?;

        // Touch the access marker so retention counts from last use
        let _ = fs::write(dir.join(LAST_ACCESS_FILE), b"");

        Ok((dir, metadata))
    }

    /// Remove entries whose retention window has lapsed since their
    /// last access. Returns the number of purged entries.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut purged = 0;
        let shards = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(_) => return Ok(0),
        };

        for shard in shards.flatten() {
            if !shard.path().is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())?.flatten() {
                let dir = entry.path();
                let metadata_path = dir.join(METADATA_FILE);
                if !metadata_path.is_file() {
                    continue;
                }
                let metadata: ContentMetadata =
                    match fs::read(&metadata_path).ok().and_then(|raw| serde_json::from_slice(&raw).ok()) {
                        Some(m) => m,
                        None => continue,
                    };

                let last_access = fs::metadata(dir.join(LAST_ACCESS_FILE))
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or(metadata.created_at);

                let age_days = (Utc::now() - last_access).num_days();
                if age_days >= metadata.retention_days as i64 {
                    tracing::info!(dir = %dir.display(), age_days, "Purging expired content");
                    fs::remove_dir_all(&dir)?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }
}

/// Recursively copy a directory tree
fn copy_dir_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_metadata() -> ContentMetadata {
        ContentMetadata {
            media_id: "media-1".to_string(),
            format: "dash".to_string(),
            manifest_url: "stream.mpd".to_string(),
            retention_days: 30,
            tags: vec!["transcoded".to_string()],
            created_at: Utc::now(),
        }
    }

    fn make_source(dir: &Path) {
        fs::create_dir_all(dir.join("init")).unwrap();
        fs::create_dir_all(dir.join("segments")).unwrap();
        fs::write(dir.join("stream.mpd"), b"<MPD/>").unwrap();
        fs::write(dir.join("init/video-720p.mp4"), b"init").unwrap();
        fs::write(dir.join("segments/video-720p-0.m4s"), b"seg0").unwrap();
    }

    const FP: &str = "ab03f00d000000000000000000000000000000000000000000000000000000aa";

    #[test]
    fn test_store_and_get() {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::new(tmp.path().join("content"));
        let source = tmp.path().join("session");
        make_source(&source);

        assert!(!store.exists(FP));
        let dir = store.store(FP, &source, &test_metadata()).unwrap();
        assert!(store.exists(FP));
        assert!(dir.ends_with(format!("ab/{}", FP)));
        assert!(dir.join("segments/video-720p-0.m4s").is_file());

        let (got_dir, metadata) = store.get(FP).unwrap();
        assert_eq!(got_dir, dir);
        assert_eq!(metadata.media_id, "media-1");
        assert_eq!(metadata.format, "dash");
    }

    #[test]
    fn test_store_idempotent() {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::new(tmp.path().join("content"));
        let source = tmp.path().join("session");
        make_source(&source);

        store.store(FP, &source, &test_metadata()).unwrap();
        // Second promote of the same fingerprint succeeds and is discarded
        fs::write(source.join("stream.mpd"), b"<MPD>changed</MPD>").unwrap();
        store.store(FP, &source, &test_metadata()).unwrap();

        let (dir, _) = store.get(FP).unwrap();
        assert_eq!(fs::read(dir.join("stream.mpd")).unwrap(), b"<MPD/>");
    }

    #[test]
    fn test_store_partial_source_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::new(tmp.path().join("content"));
        let source = tmp.path().join("session");
        fs::create_dir_all(&source).unwrap();
        // No manifest written yet: promotion must fail and leave no entry
        let err = store.store(FP, &source, &test_metadata()).unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));
        assert!(!store.exists(FP));

        // No temp debris either
        let shard = tmp.path().join("content/ab");
        if shard.exists() {
            assert_eq!(fs::read_dir(&shard).unwrap().count(), 0);
        }
    }

    #[test]
    fn test_get_missing() {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::new(tmp.path().join("content"));
        assert!(matches!(store.get(FP), Err(PipelineError::ContentNotFound(_))));
    }

    #[test]
    fn test_purge_expired() {
        let tmp = TempDir::new().unwrap();
        let store = ContentStore::new(tmp.path().join("content"));
        let source = tmp.path().join("session");
        make_source(&source);

        let mut metadata = test_metadata();
        metadata.retention_days = 0;
        store.store(FP, &source, &metadata).unwrap();

        let purged = store.purge_expired().unwrap();
        assert_eq!(purged, 1);
        assert!(!store.exists(FP));
    }
}
