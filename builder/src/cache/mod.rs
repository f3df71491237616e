//! Layer cache.
//!
//! Cacheable steps are keyed by their rendered instruction, the variables
//! in scope and the content of any context files they read. An entry is a
//! single-layer OCI image whose manifest carries the step's config delta.
//!
//! - [`LocalCacheStore`]: one OCI layout per key under a directory
//! - [`RegistryCacheStore`]: one image per key, tagged `<repo>:<key>`

pub mod local;
pub mod registry;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::config::CacheOptions;
use kiln_core::error::{BuildError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::oci::{write_layout, ImageConfig, Keychain, LayerDescriptor, OciImage};
use crate::snapshot::LayerArtifact;

pub use local::LocalCacheStore;
pub use registry::RegistryCacheStore;

/// Manifest annotation holding the serialized [`ConfigDelta`].
pub const DELTA_ANNOTATION: &str = "dev.kiln.cache.config-delta";

const KEY_VERSION: &str = "kiln-cache-v1";

/// Digest identifying a step's cacheable inputs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Derive a key from the rendered instruction, the variables in scope
    /// and `(context path, content digest)` pairs of the files it reads.
    ///
    /// Earlier layers do not contribute, so an identical step hits the
    /// cache wherever it sits in the build.
    pub fn derive(
        command: &str,
        envs: &BTreeMap<String, String>,
        context_files: &[(PathBuf, String)],
    ) -> Self {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        field(KEY_VERSION.as_bytes());
        field(command.as_bytes());
        for (name, value) in envs {
            field(name.as_bytes());
            field(value.as_bytes());
        }
        let mut files: Vec<&(PathBuf, String)> = context_files.iter().collect();
        files.sort();
        for (path, digest) in files {
            field(path.to_string_lossy().as_bytes());
            field(digest.as_bytes());
        }
        Self(hex::encode(hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Config changes a cached step replays on a hit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDelta {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl ConfigDelta {
    pub fn between(before: &ImageConfig, after: &ImageConfig) -> Self {
        let env = after
            .env
            .iter()
            .filter(|(k, v)| before.get_env(k) != Some(v.as_str()))
            .cloned()
            .collect();
        let labels = after
            .labels
            .iter()
            .filter(|(k, v)| before.labels.get(*k) != Some(*v))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            env,
            labels,
            user: changed(&before.user, &after.user),
            working_dir: changed(&before.working_dir, &after.working_dir),
        }
    }

    pub fn apply(&self, config: &mut ImageConfig) {
        for (key, value) in &self.env {
            config.set_env(key.clone(), value.clone());
        }
        for (key, value) in &self.labels {
            config.labels.insert(key.clone(), value.clone());
        }
        if let Some(user) = &self.user {
            config.user = Some(user.clone());
        }
        if let Some(dir) = &self.working_dir {
            config.working_dir = Some(dir.clone());
        }
    }
}

fn changed(before: &Option<String>, after: &Option<String>) -> Option<String> {
    if before != after {
        after.clone()
    } else {
        None
    }
}

/// A cached step: exactly one layer plus its config delta.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub layer: LayerArtifact,
    pub delta: ConfigDelta,
}

/// Content-addressable backend for cache entries.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Short description for logs.
    fn describe(&self) -> String;

    /// Fetch the entry for `key` into `work_dir`. `Ok(None)` is a miss.
    async fn get(&self, key: &CacheKey, work_dir: &Path) -> Result<Option<CacheEntry>>;

    async fn put(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()>;
}

/// Key lookup and storage on top of a [`CacheStore`].
pub struct LayerCache {
    store: Box<dyn CacheStore>,
    work_dir: PathBuf,
}

impl LayerCache {
    pub fn new(store: Box<dyn CacheStore>, work_dir: &Path) -> Self {
        Self {
            store,
            work_dir: work_dir.to_path_buf(),
        }
    }

    /// Cache configured by `options`, or `None` when caching is off.
    pub fn from_options(
        options: &CacheOptions,
        keychain: Arc<Keychain>,
        insecure: bool,
        work_dir: &Path,
    ) -> Result<Option<Self>> {
        if !options.enabled {
            return Ok(None);
        }
        let store: Box<dyn CacheStore> = match (&options.dir, &options.repo) {
            (Some(dir), _) => Box::new(LocalCacheStore::new(dir)?),
            (None, Some(repo)) => Box::new(RegistryCacheStore::new(repo, keychain, insecure)?),
            (None, None) => {
                return Err(BuildError::Config(
                    "cache enabled without a cache dir or repo".to_string(),
                ))
            }
        };
        tracing::info!(store = %store.describe(), "Layer cache enabled");
        Ok(Some(Self::new(store, work_dir)))
    }

    pub async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        let entry = self.store.get(key, &self.work_dir).await?;
        match &entry {
            Some(hit) => tracing::info!(
                key = %key,
                layer = %hit.layer.prefixed_digest(),
                "Cache hit"
            ),
            None => tracing::info!(key = %key, "Cache miss"),
        }
        Ok(entry)
    }

    pub async fn store(&self, key: &CacheKey, entry: &CacheEntry) -> Result<()> {
        self.store.put(key, entry).await?;
        tracing::info!(
            key = %key,
            layer = %entry.layer.prefixed_digest(),
            "Stored cache entry"
        );
        Ok(())
    }
}

/// Write `entry` as a single-layer OCI layout at `dir`.
pub(crate) fn write_entry(dir: &Path, entry: &CacheEntry) -> Result<()> {
    let descriptor = LayerDescriptor::from(&entry.layer);
    let config = ImageConfig::scratch().to_json(&[entry.layer.prefixed_diff_id()], true)?;
    let mut annotations = serde_json::Map::new();
    annotations.insert(
        DELTA_ANNOTATION.to_string(),
        serde_json::Value::String(serde_json::to_string(&entry.delta)?),
    );
    let annotations = serde_json::Value::Object(annotations);
    write_layout(dir, &config, &[descriptor], Some(&annotations))?;
    Ok(())
}

/// Read a cache entry back from an OCI layout, verifying its shape.
pub(crate) fn read_entry(dir: &Path, key: &CacheKey) -> Result<CacheEntry> {
    let corruption = |message: String| BuildError::CacheCorruption {
        key: key.to_string(),
        message,
    };

    let image = OciImage::from_path(dir).map_err(|e| corruption(e.to_string()))?;
    if image.layers().len() != 1 {
        return Err(corruption(format!(
            "expected 1 layer but got {}",
            image.layers().len()
        )));
    }

    let descriptor = &image.layers()[0];
    let layer = LayerArtifact::from_blob(&descriptor.path).map_err(|e| corruption(e.to_string()))?;
    if layer.digest != descriptor.digest || layer.diff_id != descriptor.diff_id {
        return Err(corruption(format!(
            "layer blob does not match its descriptor {}",
            descriptor.prefixed_digest()
        )));
    }

    let delta = match image.annotations().get(DELTA_ANNOTATION) {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| corruption(format!("invalid config delta: {}", e)))?,
        None => ConfigDelta::default(),
    };

    Ok(CacheEntry { layer, delta })
}
