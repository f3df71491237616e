//! Registry credential resolution.
//!
//! A [`Keychain`] asks a fixed chain of sources for credentials: the
//! default source (environment, kiln credential store, Docker config)
//! followed by the credential helpers selected by name. Helpers map to
//! `docker-credential-*` binaries speaking the Docker helper protocol.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use base64::Engine as _;
use kiln_core::error::{BuildError, Result};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;

use super::credentials::{normalize_registry, CredentialStore};
use super::registry::RegistryAuth;

/// Helpers enabled when none are configured, with their binaries.
pub const KNOWN_HELPERS: &[(&str, &str)] = &[
    ("google", "docker-credential-gcr"),
    ("ecr", "docker-credential-ecr-login"),
    ("acr", "docker-credential-acr-env"),
    ("gitlab", "docker-credential-gitlabci"),
];

/// A single provider of registry credentials.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &str;

    /// Credentials for `registry`, or `None` if this source has none.
    async fn credentials(&self, registry: &str) -> Result<Option<RegistryAuth>>;
}

/// `REGISTRY_USERNAME` / `REGISTRY_PASSWORD`.
pub struct EnvSource;

#[async_trait]
impl CredentialSource for EnvSource {
    fn name(&self) -> &str {
        "env"
    }

    async fn credentials(&self, _registry: &str) -> Result<Option<RegistryAuth>> {
        match (
            std::env::var("REGISTRY_USERNAME"),
            std::env::var("REGISTRY_PASSWORD"),
        ) {
            (Ok(user), Ok(pass)) => Ok(Some(RegistryAuth::basic(user, pass))),
            _ => Ok(None),
        }
    }
}

/// The kiln credential store.
pub struct StoreSource(pub CredentialStore);

#[async_trait]
impl CredentialSource for StoreSource {
    fn name(&self) -> &str {
        "credential-store"
    }

    async fn credentials(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        Ok(self
            .0
            .get(registry)?
            .map(|(user, pass)| RegistryAuth::basic(user, pass)))
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfig {
    #[serde(default)]
    auths: std::collections::HashMap<String, DockerAuth>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: std::collections::HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuth {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Docker `config.json` (`$DOCKER_CONFIG/config.json` or `~/.docker/config.json`).
pub struct DockerConfigSource {
    path: PathBuf,
}

impl DockerConfigSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> Option<Self> {
        let dir = match std::env::var_os("DOCKER_CONFIG") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::home_dir()?.join(".docker"),
        };
        Some(Self::new(dir.join("config.json")))
    }

    fn load(&self) -> Result<Option<DockerConfig>> {
        match std::fs::read(&self.path) {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl CredentialSource for DockerConfigSource {
    fn name(&self) -> &str {
        "docker-config"
    }

    async fn credentials(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        let config = match self.load()? {
            Some(c) => c,
            None => return Ok(None),
        };
        let wanted = normalize_registry(registry);

        if let Some(helper) = config
            .cred_helpers
            .iter()
            .find(|(host, _)| normalize_registry(host) == wanted)
            .map(|(_, helper)| helper)
        {
            let binary = format!("docker-credential-{}", helper);
            return HelperSource::new(helper, &binary).credentials(registry).await;
        }

        let entry = match config
            .auths
            .iter()
            .find(|(host, _)| normalize_registry(host) == wanted)
        {
            Some((_, entry)) => entry,
            None => return Ok(None),
        };

        if let (Some(user), Some(pass)) = (&entry.username, &entry.password) {
            return Ok(Some(RegistryAuth::basic(user.clone(), pass.clone())));
        }
        let encoded = match &entry.auth {
            Some(a) if !a.is_empty() => a,
            _ => return Ok(None),
        };
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| BuildError::Config(format!("Invalid auth for {}: {}", registry, e)))?;
        let decoded = String::from_utf8_lossy(&decoded);
        let (user, pass) = decoded.split_once(':').ok_or_else(|| {
            BuildError::Config(format!("Malformed auth for {}: expected user:password", registry))
        })?;
        Ok(Some(RegistryAuth::basic(user, pass)))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HelperResponse {
    username: String,
    secret: String,
}

/// External `docker-credential-*` helper binary.
pub struct HelperSource {
    name: String,
    binary: String,
}

impl HelperSource {
    pub fn new(name: &str, binary: &str) -> Self {
        Self {
            name: name.to_string(),
            binary: binary.to_string(),
        }
    }
}

#[async_trait]
impl CredentialSource for HelperSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn credentials(&self, registry: &str) -> Result<Option<RegistryAuth>> {
        let helper_error = |message: String| BuildError::Transport {
            target: self.binary.clone(),
            message,
        };

        let mut child = tokio::process::Command::new(&self.binary)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| helper_error(format!("Failed to run helper: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(registry.as_bytes())
                .await
                .map_err(|e| helper_error(format!("Failed to write to helper: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| helper_error(format!("Helper did not finish: {}", e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("credentials not found") {
                return Ok(None);
            }
            return Err(helper_error(format!("Helper failed: {}", stderr.trim())));
        }

        let response: HelperResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| helper_error(format!("Invalid helper output: {}", e)))?;
        Ok(Some(RegistryAuth::basic(response.username, response.secret)))
    }
}

/// Ordered chain of credential sources.
pub struct Keychain {
    sources: Vec<Box<dyn CredentialSource>>,
}

impl Keychain {
    /// Chain of explicit sources.
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self { sources }
    }

    /// Default source followed by the named helpers.
    ///
    /// An empty list enables every known helper; a list holding only an
    /// empty string disables helpers. Unknown names are skipped with a warning.
    pub fn from_helpers(names: &[String]) -> Self {
        let mut sources: Vec<Box<dyn CredentialSource>> = vec![Box::new(EnvSource)];
        match CredentialStore::default_path() {
            Ok(store) => sources.push(Box::new(StoreSource(store))),
            Err(e) => tracing::debug!(error = %e, "Credential store unavailable"),
        }
        if let Some(docker) = DockerConfigSource::default_path() {
            sources.push(Box::new(docker));
        }
        sources.extend(helper_sources(names));
        let keychain = Self { sources };
        tracing::debug!(sources = ?keychain.source_names(), "Credential sources configured");
        keychain
    }

    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Resolve credentials for a registry, falling back to anonymous.
    ///
    /// A failing source is skipped with a warning.
    pub async fn resolve(&self, registry: &str) -> RegistryAuth {
        for source in &self.sources {
            match source.credentials(registry).await {
                Ok(Some(auth)) => {
                    tracing::debug!(registry, source = source.name(), "Resolved credentials");
                    return auth;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        registry,
                        source = source.name(),
                        error = %e,
                        "Credential source failed, skipping"
                    );
                }
            }
        }
        RegistryAuth::anonymous()
    }
}

/// Map helper names to sources.
fn helper_sources(names: &[String]) -> Vec<Box<dyn CredentialSource>> {
    let selected: Vec<&str> = if names.is_empty() {
        KNOWN_HELPERS.iter().map(|(name, _)| *name).collect()
    } else {
        names.iter().map(String::as_str).collect()
    };

    let mut sources: Vec<Box<dyn CredentialSource>> = Vec::new();
    for name in selected {
        if name.is_empty() {
            tracing::info!("All credential helpers disabled");
            continue;
        }
        match KNOWN_HELPERS.iter().find(|(known, _)| *known == name) {
            Some((name, binary)) => sources.push(Box::new(HelperSource::new(name, binary))),
            None => tracing::warn!(helper = name, "Unknown credential helper, skipping"),
        }
    }
    sources
}
