//! Directory-backed cache store.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_core::error::{BuildError, Result};

use super::{read_entry, write_entry, CacheEntry, CacheKey, CacheStore};

/// Stores each entry as an OCI layout at `<dir>/<key>/`.
pub struct LocalCacheStore {
    dir: PathBuf,
}

impl LocalCacheStore {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir).map_err(|e| {
            BuildError::Config(format!(
                "Failed to create cache directory {}: {}",
                dir.display(),
                e
            ))
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn entry_dir(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(key.as_str())
    }
}

#[async_trait]
impl CacheStore for LocalCacheStore {
    fn describe(&self) -> String {
        format!("dir:{}", self.dir.display())
    }

    async fn get(&self, key: &CacheKey, _work_dir: &Path) -> Result<Option<CacheEntry>> {
        let dir = self.entry_dir(key);
        if !dir.exists() {
            return Ok(None);
        }
        read_entry(&dir, key).map(Some)
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let dir = self.entry_dir(key);
        if dir.exists() {
            tracing::debug!(key = %key, "Cache entry already present");
            return Ok(());
        }

        // Entries become visible only once complete
        let staging = self.dir.join(format!(".{}.tmp", key));
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        write_entry(&staging, entry)?;
        std::fs::rename(&staging, &dir).map_err(|e| BuildError::Transport {
            target: self.describe(),
            message: format!("Failed to publish cache entry {}: {}", key, e),
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ConfigDelta;
    use crate::oci::write_layout;
    use crate::oci::{ImageConfig, LayerDescriptor};
    use crate::snapshot::{FileRecord, LayerArtifact, LayerWriter};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn make_layer(dir: &Path, name: &str, content: &str) -> LayerArtifact {
        let root = dir.join(format!("{}-root", name));
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("file.txt"), content).unwrap();
        let record = FileRecord::stat(&root.join("file.txt")).unwrap().unwrap();
        let mut writer = LayerWriter::create(&dir.join(format!("{}.tar.gz", name)), true).unwrap();
        writer
            .append(&root, Path::new("file.txt"), &record)
            .unwrap();
        writer.finish().unwrap()
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::derive(name, &BTreeMap::new(), &[])
    }

    #[tokio::test]
    async fn test_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "l", "cached");
        let entry = CacheEntry {
            layer: layer.clone(),
            delta: ConfigDelta {
                working_dir: Some("/app".to_string()),
                ..Default::default()
            },
        };

        let k = key("RUN build");
        assert!(store.get(&k, tmp.path()).await.unwrap().is_none());
        store.put(&k, &entry).await.unwrap();

        let hit = store.get(&k, tmp.path()).await.unwrap().unwrap();
        assert_eq!(hit.layer.digest, layer.digest);
        assert_eq!(hit.layer.diff_id, layer.diff_id);
        assert_eq!(hit.delta, entry.delta);
        assert_eq!(hit.layer.entries.len(), 1);

        // Second put is a no-op
        store.put(&k, &entry).await.unwrap();
        assert!(!tmp.path().join(format!("cache/.{}.tmp", k)).exists());
    }

    #[tokio::test]
    async fn test_multi_layer_entry_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let cache_dir = tmp.path().join("cache");
        let store = LocalCacheStore::new(&cache_dir).unwrap();
        let a = make_layer(tmp.path(), "a", "one");
        let b = make_layer(tmp.path(), "b", "two");

        let k = key("RUN tampered");
        let config = ImageConfig::scratch()
            .to_json(&[a.prefixed_diff_id(), b.prefixed_diff_id()], true)
            .unwrap();
        write_layout(
            &cache_dir.join(k.as_str()),
            &config,
            &[LayerDescriptor::from(&a), LayerDescriptor::from(&b)],
            None,
        )
        .unwrap();

        let err = store.get(&k, tmp.path()).await.unwrap_err();
        assert!(matches!(err, BuildError::CacheCorruption { .. }));
        assert!(err.to_string().contains("expected 1 layer but got 2"));
    }

    #[tokio::test]
    async fn test_zero_layer_entry_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let cache_dir = tmp.path().join("cache");
        let store = LocalCacheStore::new(&cache_dir).unwrap();

        let k = key("RUN empty");
        let config = ImageConfig::scratch().to_json(&[], true).unwrap();
        write_layout(&cache_dir.join(k.as_str()), &config, &[], None).unwrap();

        assert!(matches!(
            store.get(&k, tmp.path()).await,
            Err(BuildError::CacheCorruption { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_blob_is_corruption() {
        let tmp = TempDir::new().unwrap();
        let store = LocalCacheStore::new(&tmp.path().join("cache")).unwrap();
        let layer = make_layer(tmp.path(), "l", "original");
        let k = key("COPY x /");
        store
            .put(
                &k,
                &CacheEntry {
                    layer: layer.clone(),
                    delta: ConfigDelta::default(),
                },
            )
            .await
            .unwrap();

        let blob = tmp
            .path()
            .join("cache")
            .join(k.as_str())
            .join("blobs/sha256")
            .join(&layer.digest);
        std::fs::remove_file(&blob).unwrap();
        let other = make_layer(tmp.path(), "other", "different");
        std::fs::copy(&other.path, &blob).unwrap();

        assert!(matches!(
            store.get(&k, tmp.path()).await,
            Err(BuildError::CacheCorruption { .. })
        ));
    }
}
