//! Registry-backed cache store.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::error::{BuildError, Result};

use super::{read_entry, write_entry, CacheEntry, CacheKey, CacheStore};
use crate::oci::{ImageReference, Keychain, RegistryPuller, RegistryPusher};

/// Stores each entry as an image tagged `<repo>:<key>`.
pub struct RegistryCacheStore {
    repo: ImageReference,
    keychain: Arc<Keychain>,
    insecure: bool,
}

impl RegistryCacheStore {
    pub fn new(repo: &str, keychain: Arc<Keychain>, insecure: bool) -> Result<Self> {
        let repo = ImageReference::parse(repo)
            .map_err(|e| BuildError::Config(format!("invalid cache repo '{}': {}", repo, e)))?;
        Ok(Self {
            repo,
            keychain,
            insecure,
        })
    }

    fn reference(&self, key: &CacheKey) -> ImageReference {
        self.repo.with_tag(key.as_str())
    }
}

#[async_trait]
impl CacheStore for RegistryCacheStore {
    fn describe(&self) -> String {
        format!("registry:{}/{}", self.repo.registry, self.repo.repository)
    }

    async fn get(&self, key: &CacheKey, work_dir: &Path) -> Result<Option<CacheEntry>> {
        let reference = self.reference(key);
        let auth = self.keychain.resolve(&reference.registry).await;
        let target = work_dir.join(format!("cache-{}", key));
        if target.exists() {
            std::fs::remove_dir_all(&target)?;
        }

        let puller = RegistryPuller::new(auth, self.insecure);
        match puller.try_pull(&reference, &target).await? {
            Some(dir) => read_entry(&dir, key).map(Some),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        let reference = self.reference(key);
        let staging = tempfile::TempDir::new()?;
        write_entry(staging.path(), entry)?;

        let auth = self.keychain.resolve(&reference.registry).await;
        RegistryPusher::new(auth, self.insecure)
            .push(&reference, staging.path())
            .await?;
        Ok(())
    }
}
