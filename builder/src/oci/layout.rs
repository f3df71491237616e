//! OCI image layout writing.
//!
//! ```text
//! image/
//! ├── oci-layout
//! ├── index.json
//! └── blobs/sha256/
//!     ├── <manifest>
//!     ├── <config>
//!     └── <layers>
//! ```

use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};

use crate::snapshot::{layer::sha256_bytes, LayerArtifact};

pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// A layer blob as referenced by a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerDescriptor {
    /// Blob location on disk
    pub path: PathBuf,
    /// Blob digest (hex, no prefix)
    pub digest: String,
    /// Uncompressed digest (hex, no prefix)
    pub diff_id: String,
    pub size: u64,
    pub media_type: String,
}

impl LayerDescriptor {
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    pub fn prefixed_diff_id(&self) -> String {
        format!("sha256:{}", self.diff_id)
    }
}

impl From<&LayerArtifact> for LayerDescriptor {
    fn from(layer: &LayerArtifact) -> Self {
        Self {
            path: layer.path.clone(),
            digest: layer.digest.clone(),
            diff_id: layer.diff_id.clone(),
            size: layer.size,
            media_type: layer.media_type.clone(),
        }
    }
}

/// Summary of a written layout.
#[derive(Debug, Clone)]
pub struct LayoutInfo {
    /// Manifest digest with "sha256:" prefix
    pub manifest_digest: String,
    /// Config digest with "sha256:" prefix
    pub config_digest: String,
    /// Total size of layer blobs
    pub layers_size: u64,
}

/// Path to a blob by digest. Digests without an algorithm default to sha256.
pub fn blob_path(root_dir: &Path, digest: &str) -> PathBuf {
    let (algorithm, hash) = digest.split_once(':').unwrap_or(("sha256", digest));
    root_dir.join("blobs").join(algorithm).join(hash)
}

/// Write an OCI image layout holding one image.
///
/// `config` is the rendered config blob. Layer blobs are hard-linked when
/// possible and copied otherwise. `annotations` go onto the manifest.
pub fn write_layout(
    dir: &Path,
    config: &[u8],
    layers: &[LayerDescriptor],
    annotations: Option<&serde_json::Value>,
) -> Result<LayoutInfo> {
    let blobs_dir = dir.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir).map_err(|e| {
        BuildError::OciImage(format!(
            "Failed to create blobs dir {}: {}",
            blobs_dir.display(),
            e
        ))
    })?;

    let mut descriptors = Vec::with_capacity(layers.len());
    let mut layers_size = 0;
    for layer in layers {
        let target = blobs_dir.join(&layer.digest);
        if !target.exists() {
            if std::fs::hard_link(&layer.path, &target).is_err() {
                std::fs::copy(&layer.path, &target).map_err(|e| {
                    BuildError::OciImage(format!(
                        "Failed to copy layer {}: {}",
                        layer.prefixed_digest(),
                        e
                    ))
                })?;
            }
        }
        layers_size += layer.size;
        descriptors.push(serde_json::json!({
            "mediaType": layer.media_type,
            "digest": layer.prefixed_digest(),
            "size": layer.size
        }));
    }

    let config_digest = sha256_bytes(config);
    write_blob(&blobs_dir, &config_digest, config)?;

    let mut manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_MANIFEST,
        "config": {
            "mediaType": MEDIA_TYPE_CONFIG,
            "digest": format!("sha256:{}", config_digest),
            "size": config.len()
        },
        "layers": descriptors
    });
    if let Some(annotations) = annotations {
        manifest["annotations"] = annotations.clone();
    }
    let manifest_bytes = serde_json::to_vec(&manifest)?;
    let manifest_digest = sha256_bytes(&manifest_bytes);
    write_blob(&blobs_dir, &manifest_digest, &manifest_bytes)?;

    let index = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": MEDIA_TYPE_INDEX,
        "manifests": [{
            "mediaType": MEDIA_TYPE_MANIFEST,
            "digest": format!("sha256:{}", manifest_digest),
            "size": manifest_bytes.len()
        }]
    });
    std::fs::write(dir.join("index.json"), serde_json::to_vec_pretty(&index)?).map_err(|e| {
        BuildError::OciImage(format!("Failed to write index.json: {}", e))
    })?;
    std::fs::write(dir.join("oci-layout"), r#"{"imageLayoutVersion":"1.0.0"}"#).map_err(
        |e| BuildError::OciImage(format!("Failed to write oci-layout: {}", e)),
    )?;

    tracing::debug!(
        dir = %dir.display(),
        manifest = %manifest_digest,
        layers = layers.len(),
        "Wrote OCI layout"
    );

    Ok(LayoutInfo {
        manifest_digest: format!("sha256:{}", manifest_digest),
        config_digest: format!("sha256:{}", config_digest),
        layers_size,
    })
}

fn write_blob(blobs_dir: &Path, digest: &str, data: &[u8]) -> Result<()> {
    std::fs::write(blobs_dir.join(digest), data)
        .map_err(|e| BuildError::OciImage(format!("Failed to write blob {}: {}", digest, e)))
}
