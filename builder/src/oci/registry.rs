//! Registry client for base image pulls, image pushes and cache entries.
//!
//! Uses the `oci-distribution` crate for the wire protocol.

use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use oci_distribution::client::{ClientConfig, ClientProtocol, Config, ImageLayer, PushResponse};
use oci_distribution::errors::{OciDistributionError, OciErrorCode};
use oci_distribution::manifest::{ImageIndexEntry, OciImageManifest};
use oci_distribution::secrets::RegistryAuth as OciRegistryAuth;
use oci_distribution::{Client, Reference};

use super::image::strip_algorithm;
use super::layout::{blob_path, MEDIA_TYPE_INDEX, MEDIA_TYPE_MANIFEST};
use super::reference::ImageReference;

/// Authentication credentials for a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryAuth {
    username: Option<String>,
    password: Option<String>,
}

impl RegistryAuth {
    pub fn anonymous() -> Self {
        Self {
            username: None,
            password: None,
        }
    }

    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    fn to_oci_auth(&self) -> OciRegistryAuth {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => OciRegistryAuth::Basic(u.clone(), p.clone()),
            _ => OciRegistryAuth::Anonymous,
        }
    }
}

fn client(insecure: bool) -> Client {
    Client::new(ClientConfig {
        protocol: if insecure {
            ClientProtocol::Http
        } else {
            ClientProtocol::Https
        },
        platform_resolver: Some(Box::new(linux_platform_resolver)),
        ..Default::default()
    })
}

fn transport_error(reference: &ImageReference, message: String) -> BuildError {
    BuildError::Transport {
        target: reference.to_string(),
        message,
    }
}

/// Pulls images from registries into OCI layouts.
pub struct RegistryPuller {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPuller {
    pub fn new(auth: RegistryAuth, insecure: bool) -> Self {
        Self {
            client: client(insecure),
            auth,
        }
    }

    /// Pull an image and write it as an OCI image layout to `target_dir`.
    pub async fn pull(&self, reference: &ImageReference, target_dir: &Path) -> Result<PathBuf> {
        match self.try_pull(reference, target_dir).await? {
            Some(path) => Ok(path),
            None => Err(transport_error(
                reference,
                "Image manifest not found".to_string(),
            )),
        }
    }

    /// Like [`pull`](Self::pull), but a missing manifest yields `Ok(None)`.
    pub async fn try_pull(
        &self,
        reference: &ImageReference,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>> {
        let oci_ref = to_oci_reference(reference)?;
        let auth = self.auth.to_oci_auth();

        tracing::info!(
            reference = %reference,
            target = %target_dir.display(),
            "Pulling image from registry"
        );

        let (manifest, manifest_digest) =
            match self.client.pull_image_manifest(&oci_ref, &auth).await {
                Ok(pulled) => pulled,
                Err(e) if is_not_found(&e) => return Ok(None),
                Err(e) => {
                    return Err(transport_error(
                        reference,
                        format!("Failed to pull manifest: {}", e),
                    ))
                }
            };

        std::fs::create_dir_all(target_dir.join("blobs").join("sha256"))?;

        let manifest_json = serde_json::to_vec(&manifest)?;
        std::fs::write(blob_path(target_dir, &manifest_digest), &manifest_json)?;

        let mut config_data: Vec<u8> = Vec::new();
        self.client
            .pull_blob(&oci_ref, &manifest.config, &mut config_data)
            .await
            .map_err(|e| transport_error(reference, format!("Failed to pull config blob: {}", e)))?;
        std::fs::write(blob_path(target_dir, &manifest.config.digest), &config_data)?;

        for layer in &manifest.layers {
            tracing::debug!(digest = %layer.digest, size = layer.size, "Pulling layer");
            let mut layer_data: Vec<u8> = Vec::new();
            self.client
                .pull_blob(&oci_ref, layer, &mut layer_data)
                .await
                .map_err(|e| {
                    transport_error(
                        reference,
                        format!("Failed to pull layer {}: {}", layer.digest, e),
                    )
                })?;
            std::fs::write(blob_path(target_dir, &layer.digest), &layer_data)?;
        }

        std::fs::write(
            target_dir.join("oci-layout"),
            r#"{"imageLayoutVersion":"1.0.0"}"#,
        )?;
        let index = serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_INDEX,
            "manifests": [{
                "mediaType": MEDIA_TYPE_MANIFEST,
                "digest": manifest_digest,
                "size": manifest_json.len()
            }]
        });
        std::fs::write(target_dir.join("index.json"), serde_json::to_vec_pretty(&index)?)?;

        tracing::info!(reference = %reference, digest = %manifest_digest, "Image pulled");
        Ok(Some(target_dir.to_path_buf()))
    }
}

/// Result of a successful image push.
#[derive(Debug, Clone)]
pub struct PushResult {
    pub config_url: String,
    pub manifest_url: String,
}

/// Pushes OCI layouts to registries.
pub struct RegistryPusher {
    client: Client,
    auth: RegistryAuth,
}

impl RegistryPusher {
    pub fn new(auth: RegistryAuth, insecure: bool) -> Self {
        Self {
            client: client(insecure),
            auth,
        }
    }

    /// Push the single image held by the OCI layout at `image_dir`.
    pub async fn push(&self, reference: &ImageReference, image_dir: &Path) -> Result<PushResult> {
        let oci_ref = to_oci_reference(reference)?;

        tracing::info!(
            reference = %reference,
            source = %image_dir.display(),
            "Pushing image to registry"
        );

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(image_dir.join("index.json"))?)?;
        let manifest_digest = index["manifests"][0]["digest"]
            .as_str()
            .ok_or_else(|| BuildError::OciImage("No manifest digest in index.json".to_string()))?;
        let manifest: OciImageManifest =
            serde_json::from_slice(&std::fs::read(blob_path(image_dir, manifest_digest))?)?;

        let config_data = std::fs::read(blob_path(image_dir, &manifest.config.digest))?;
        let config = Config::new(config_data, manifest.config.media_type.clone(), None);

        let mut layers = Vec::with_capacity(manifest.layers.len());
        for descriptor in &manifest.layers {
            let data = std::fs::read(blob_path(image_dir, &descriptor.digest)).map_err(|e| {
                BuildError::OciImage(format!(
                    "Failed to read layer blob {}: {}",
                    strip_algorithm(&descriptor.digest),
                    e
                ))
            })?;
            layers.push(ImageLayer::new(data, descriptor.media_type.clone(), None));
        }

        let auth = self.auth.to_oci_auth();
        let response: PushResponse = self
            .client
            .push(&oci_ref, &layers, config, &auth, Some(manifest))
            .await
            .map_err(|e| transport_error(reference, format!("Failed to push image: {}", e)))?;

        tracing::info!(
            reference = %reference,
            manifest_url = %response.manifest_url,
            "Image pushed"
        );

        Ok(PushResult {
            config_url: response.config_url,
            manifest_url: response.manifest_url,
        })
    }
}

fn to_oci_reference(reference: &ImageReference) -> Result<Reference> {
    let ref_str = match (&reference.digest, &reference.tag) {
        (Some(digest), _) => format!("{}/{}@{}", reference.registry, reference.repository, digest),
        (None, Some(tag)) => format!("{}/{}:{}", reference.registry, reference.repository, tag),
        (None, None) => format!("{}/{}:latest", reference.registry, reference.repository),
    };
    ref_str.parse::<Reference>().map_err(|e| {
        BuildError::OciImage(format!("Invalid OCI reference '{}': {}", ref_str, e))
    })
}

fn is_not_found(err: &OciDistributionError) -> bool {
    match err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::ServerError { code, .. } => *code == 404,
        OciDistributionError::RegistryError { envelope, .. } => envelope
            .errors
            .iter()
            .any(|e| matches!(e.code, OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown)),
        _ => false,
    }
}

/// Select the linux image matching the host CPU architecture.
fn linux_platform_resolver(manifests: &[ImageIndexEntry]) -> Option<String> {
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };

    manifests
        .iter()
        .find(|entry| {
            entry
                .platform
                .as_ref()
                .map_or(false, |p| p.os == "linux" && p.architecture == arch)
        })
        .map(|entry| entry.digest.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_auth_to_oci() {
        assert!(matches!(
            RegistryAuth::anonymous().to_oci_auth(),
            OciRegistryAuth::Anonymous
        ));
        assert!(matches!(
            RegistryAuth::basic("user", "pass").to_oci_auth(),
            OciRegistryAuth::Basic(_, _)
        ));
    }

    #[test]
    fn test_to_oci_reference() {
        let r = ImageReference::parse("registry.local:5000/team/app:v1").unwrap();
        assert_eq!(
            to_oci_reference(&r).unwrap().to_string(),
            "registry.local:5000/team/app:v1"
        );

        let r = ImageReference {
            registry: "ghcr.io".to_string(),
            repository: "org/app".to_string(),
            tag: None,
            digest: None,
        };
        assert!(to_oci_reference(&r).unwrap().to_string().ends_with(":latest"));
    }

    #[test]
    fn test_not_found_classification() {
        assert!(is_not_found(
            &OciDistributionError::ImageManifestNotFoundError("x".to_string())
        ));
        assert!(is_not_found(&OciDistributionError::ServerError {
            code: 404,
            url: "https://registry.local/v2/cache/manifests/abc".to_string(),
            message: "not found".to_string(),
        }));
        assert!(!is_not_found(&OciDistributionError::ServerError {
            code: 500,
            url: "https://registry.local".to_string(),
            message: "boom".to_string(),
        }));
    }
}
