//! Read-only registry credential file.
//!
//! Credentials live at `~/.kiln/auth/credentials.json`, keyed by registry:
//!
//! ```json
//! { "registries": { "ghcr.io": { "username": "ci", "password": "..." } } }
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

use kiln_core::error::{BuildError, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct StoredCredential {
    username: String,
    password: String,
}

#[derive(Debug, Default, Deserialize)]
struct CredentialFile {
    #[serde(default)]
    registries: BTreeMap<String, StoredCredential>,
}

/// File-backed per-registry credentials.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    /// Store at `~/.kiln/auth/credentials.json`.
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            BuildError::Config("Cannot determine home directory for credential store".to_string())
        })?;
        Ok(Self::new(home.join(".kiln").join("auth").join("credentials.json")))
    }

    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Look up `(username, password)` for a registry. A missing file has no
    /// entries.
    pub fn get(&self, registry: &str) -> Result<Option<(String, String)>> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BuildError::Config(format!(
                    "Failed to read credential store {}: {}",
                    self.path.display(),
                    e
                )))
            }
        };
        let mut file: CredentialFile = serde_json::from_str(&data).map_err(|e| {
            BuildError::Config(format!(
                "Failed to parse credential store {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let wanted = normalize_registry(registry);
        let key = file
            .registries
            .keys()
            .find(|k| normalize_registry(k) == wanted)
            .cloned();
        Ok(key
            .and_then(|k| file.registries.remove(&k))
            .map(|c| (c.username, c.password)))
    }
}

/// Docker Hub is known under several hostnames.
pub fn normalize_registry(registry: &str) -> String {
    let r = registry.trim().trim_start_matches("https://").to_lowercase();
    let r = r.trim_end_matches('/');
    match r {
        "docker.io" | "registry-1.docker.io" | "index.docker.io/v1" => "index.docker.io".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_store(tmp: &TempDir, json: &str) -> CredentialStore {
        let path = tmp.path().join("auth/credentials.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, json).unwrap();
        CredentialStore::new(path)
    }

    #[test]
    fn test_get_entry() {
        let tmp = TempDir::new().unwrap();
        let store = write_store(
            &tmp,
            r#"{"registries":{"ghcr.io":{"username":"builder","password":"s3cret"}}}"#,
        );
        assert_eq!(
            store.get("ghcr.io").unwrap(),
            Some(("builder".to_string(), "s3cret".to_string()))
        );
        assert_eq!(store.get("quay.io").unwrap(), None);
    }

    #[test]
    fn test_missing_file_has_no_entries() {
        let tmp = TempDir::new().unwrap();
        let store = CredentialStore::new(tmp.path().join("absent.json"));
        assert_eq!(store.get("ghcr.io").unwrap(), None);
    }

    #[test]
    fn test_docker_hub_aliases_share_entry() {
        let tmp = TempDir::new().unwrap();
        let store = write_store(
            &tmp,
            r#"{"registries":{"docker.io":{"username":"u","password":"p"}}}"#,
        );
        assert!(store.get("index.docker.io").unwrap().is_some());
        assert!(store.get("registry-1.docker.io").unwrap().is_some());
    }

    #[test]
    fn test_corrupt_store_is_error() {
        let tmp = TempDir::new().unwrap();
        let store = write_store(&tmp, "not json");
        assert!(store.get("ghcr.io").is_err());
    }

    #[test]
    fn test_normalize_registry() {
        assert_eq!(normalize_registry("Docker.io"), "index.docker.io");
        assert_eq!(
            normalize_registry("https://index.docker.io/v1/"),
            "index.docker.io"
        );
        assert_eq!(normalize_registry("ghcr.io"), "ghcr.io");
    }
}
