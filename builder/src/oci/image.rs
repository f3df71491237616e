//! Image configuration and base image loading.
//!
//! [`ImageConfig`] is the evolving configuration the engine mutates step by
//! step. It renders to and parses from the OCI image config JSON.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use kiln_core::error::{BuildError, Result};
use oci_spec::image::{ImageIndex, ImageManifest};
use serde::{Deserialize, Serialize};

use super::layout::{blob_path, LayerDescriptor};

/// One history record of the image config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Rendered instruction
    pub created_by: String,
    /// Whether the step produced no layer
    pub empty_layer: bool,
    pub created: Option<String>,
    pub comment: Option<String>,
}

impl HistoryEntry {
    pub fn new(created_by: impl Into<String>, empty_layer: bool) -> Self {
        Self {
            created_by: created_by.into(),
            empty_layer,
            created: None,
            comment: None,
        }
    }
}

/// Evolving target image configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub architecture: String,
    pub os: String,
    /// Environment in declaration order
    pub env: Vec<(String, String)>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub labels: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<String>,
    pub volumes: BTreeSet<String>,
    /// Shell used for shell-form RUN/CMD/ENTRYPOINT
    pub shell: Option<Vec<String>>,
    pub stop_signal: Option<String>,
    pub history: Vec<HistoryEntry>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self::scratch()
    }
}

impl ImageConfig {
    /// Empty configuration for the host architecture.
    pub fn scratch() -> Self {
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            architecture: arch.to_string(),
            os: "linux".to_string(),
            env: Vec::new(),
            working_dir: None,
            user: None,
            entrypoint: None,
            cmd: None,
            labels: BTreeMap::new(),
            exposed_ports: BTreeSet::new(),
            volumes: BTreeSet::new(),
            shell: None,
            stop_signal: None,
            history: Vec::new(),
        }
    }

    pub fn get_env(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set a variable, keeping its original position when it already exists.
    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
    }

    /// Working directory, defaulting to `/`.
    pub fn working_dir_or_root(&self) -> &str {
        self.working_dir.as_deref().unwrap_or("/")
    }

    /// Parse an OCI image config blob. Returns the config and the rootfs diff IDs.
    pub fn from_json(data: &[u8]) -> Result<(Self, Vec<String>)> {
        let file: ConfigFile = serde_json::from_slice(data)
            .map_err(|e| BuildError::OciImage(format!("Failed to parse image config: {}", e)))?;
        let runtime = file.config.unwrap_or_default();
        let scratch = Self::scratch();

        let env = runtime
            .env
            .unwrap_or_default()
            .iter()
            .filter_map(|e| e.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let config = Self {
            architecture: file.architecture.unwrap_or(scratch.architecture),
            os: file.os.unwrap_or(scratch.os),
            env,
            working_dir: runtime.working_dir.filter(|w| !w.is_empty()),
            user: runtime.user.filter(|u| !u.is_empty()),
            entrypoint: runtime.entrypoint,
            cmd: runtime.cmd,
            labels: runtime.labels.unwrap_or_default(),
            exposed_ports: runtime
                .exposed_ports
                .map(|p| p.into_keys().collect())
                .unwrap_or_default(),
            volumes: runtime
                .volumes
                .map(|v| v.into_keys().collect())
                .unwrap_or_default(),
            shell: runtime.shell,
            stop_signal: runtime.stop_signal,
            history: file
                .history
                .into_iter()
                .map(|h| HistoryEntry {
                    created_by: h.created_by.unwrap_or_default(),
                    empty_layer: h.empty_layer.unwrap_or(false),
                    created: h.created,
                    comment: h.comment,
                })
                .collect(),
        };
        let diff_ids = file.rootfs.map(|r| r.diff_ids).unwrap_or_default();
        Ok((config, diff_ids))
    }

    /// Render the OCI image config blob for the given layer diff IDs.
    ///
    /// With `reproducible` set all timestamps are dropped.
    pub fn to_json(&self, diff_ids: &[String], reproducible: bool) -> Result<Vec<u8>> {
        let now = if reproducible {
            None
        } else {
            Some(chrono::Utc::now().to_rfc3339())
        };
        let empty = || serde_json::Value::Object(serde_json::Map::new());

        let runtime = RuntimeConfig {
            user: self.user.clone(),
            exposed_ports: non_empty(&self.exposed_ports)
                .map(|ports| ports.iter().map(|p| (p.clone(), empty())).collect()),
            env: if self.env.is_empty() {
                None
            } else {
                Some(
                    self.env
                        .iter()
                        .map(|(k, v)| format!("{}={}", k, v))
                        .collect(),
                )
            },
            entrypoint: self.entrypoint.clone(),
            cmd: self.cmd.clone(),
            volumes: non_empty(&self.volumes)
                .map(|vols| vols.iter().map(|v| (v.clone(), empty())).collect()),
            working_dir: self.working_dir.clone(),
            labels: if self.labels.is_empty() {
                None
            } else {
                Some(self.labels.clone())
            },
            stop_signal: self.stop_signal.clone(),
            shell: self.shell.clone(),
        };

        let file = ConfigFile {
            created: now.clone(),
            architecture: Some(self.architecture.clone()),
            os: Some(self.os.clone()),
            config: Some(runtime),
            rootfs: Some(RootFs {
                kind: "layers".to_string(),
                diff_ids: diff_ids.to_vec(),
            }),
            history: self
                .history
                .iter()
                .map(|h| WireHistory {
                    created: if reproducible {
                        None
                    } else {
                        h.created.clone().or_else(|| now.clone())
                    },
                    created_by: Some(h.created_by.clone()),
                    empty_layer: if h.empty_layer { Some(true) } else { None },
                    comment: h.comment.clone(),
                })
                .collect(),
        };
        Ok(serde_json::to_vec(&file)?)
    }
}

fn non_empty(set: &BTreeSet<String>) -> Option<&BTreeSet<String>> {
    if set.is_empty() {
        None
    } else {
        Some(set)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    config: Option<RuntimeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    rootfs: Option<RootFs>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    history: Vec<WireHistory>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RuntimeConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exposed_ports: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    env: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entrypoint: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cmd: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    volumes: Option<BTreeMap<String, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop_signal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    shell: Option<Vec<String>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RootFs {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    diff_ids: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireHistory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    created_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    empty_layer: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    comment: Option<String>,
}

/// An image loaded from an OCI layout directory.
#[derive(Debug)]
pub struct OciImage {
    config: ImageConfig,
    layers: Vec<LayerDescriptor>,
    annotations: HashMap<String, String>,
}

impl OciImage {
    /// Load an OCI image from a layout directory (oci-layout, index.json, blobs/).
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let root_dir = path.as_ref().to_path_buf();
        Self::validate_oci_layout(&root_dir)?;

        let index: ImageIndex = read_json(&root_dir.join("index.json"), "index.json")?;
        let manifest_digest = index
            .manifests()
            .first()
            .ok_or_else(|| BuildError::OciImage("No manifests in index.json".to_string()))?
            .digest()
            .to_string();

        let manifest: ImageManifest =
            read_json(&blob_path(&root_dir, &manifest_digest), "manifest")?;

        let config_path = blob_path(&root_dir, manifest.config().digest());
        let config_data = std::fs::read(&config_path).map_err(|e| {
            BuildError::OciImage(format!(
                "Failed to read config at {}: {}",
                config_path.display(),
                e
            ))
        })?;
        let (config, diff_ids) = ImageConfig::from_json(&config_data)?;

        if diff_ids.len() != manifest.layers().len() {
            return Err(BuildError::OciImage(format!(
                "Config lists {} diff IDs but manifest has {} layers",
                diff_ids.len(),
                manifest.layers().len()
            )));
        }

        let layers = manifest
            .layers()
            .iter()
            .zip(diff_ids)
            .map(|(layer, diff_id)| LayerDescriptor {
                path: blob_path(&root_dir, layer.digest()),
                digest: strip_algorithm(layer.digest()).to_string(),
                diff_id: strip_algorithm(&diff_id).to_string(),
                size: layer.size().max(0) as u64,
                media_type: layer.media_type().to_string(),
            })
            .collect();

        let annotations = manifest.annotations().clone().unwrap_or_default();

        Ok(Self {
            config,
            layers,
            annotations,
        })
    }

    pub fn config(&self) -> &ImageConfig {
        &self.config
    }

    /// Layer blobs, bottom to top.
    pub fn layers(&self) -> &[LayerDescriptor] {
        &self.layers
    }

    /// Manifest annotations.
    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    pub fn into_parts(self) -> (ImageConfig, Vec<LayerDescriptor>) {
        (self.config, self.layers)
    }

    fn validate_oci_layout(root_dir: &Path) -> Result<()> {
        for required in ["oci-layout", "index.json", "blobs"] {
            if !root_dir.join(required).exists() {
                return Err(BuildError::OciImage(format!(
                    "Not a valid OCI layout: missing {} in {}",
                    required,
                    root_dir.display()
                )));
            }
        }
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        BuildError::OciImage(format!(
            "Failed to read {} at {}: {}",
            what,
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content)
        .map_err(|e| BuildError::OciImage(format!("Failed to parse {}: {}", what, e)))
}

/// Drop the `sha256:` prefix of a digest.
pub fn strip_algorithm(digest: &str) -> &str {
    digest.split_once(':').map(|(_, hex)| hex).unwrap_or(digest)
}
