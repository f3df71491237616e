use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, Result};

/// Build options shared by the engine, cache and registry clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Root filesystem the build mutates (`/` inside a build container)
    pub root_dir: PathBuf,

    /// Collapse every instruction into one trailing layer
    pub single_snapshot: bool,

    /// Strip timestamps from produced layers
    pub reproducible: bool,

    /// Layer cache settings
    pub cache: CacheOptions,

    /// How RUN instructions are isolated
    pub run_isolation: RunIsolation,

    /// Credential helper backends (empty means all known helpers)
    pub credential_helpers: Vec<String>,

    /// Paths under the root never considered by the snapshotter
    pub ignore_paths: Vec<PathBuf>,

    /// Build the image but skip the push
    pub no_push: bool,

    /// Talk plain HTTP to registries
    pub insecure_registry: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/"),
            single_snapshot: false,
            reproducible: false,
            cache: CacheOptions::default(),
            run_isolation: RunIsolation::default(),
            credential_helpers: Vec::new(),
            ignore_paths: default_ignore_paths(),
            no_push: false,
            insecure_registry: false,
        }
    }
}

/// Pseudo filesystems that never belong in a layer.
fn default_ignore_paths() -> Vec<PathBuf> {
    ["/proc", "/sys", "/dev", "/run", "/var/run", "/tmp/kiln"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

impl BuildOptions {
    /// Load options from a YAML file. Missing keys keep their defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let options: Self = serde_yaml::from_str(&content)?;
        Ok(options)
    }

    /// Reject contradictory settings.
    pub fn validate(&self) -> Result<()> {
        if !self.root_dir.is_absolute() {
            return Err(BuildError::Config(format!(
                "root_dir must be absolute: {}",
                self.root_dir.display()
            )));
        }
        if self.cache.enabled && self.cache.dir.is_none() && self.cache.repo.is_none() {
            return Err(BuildError::Config(
                "cache is enabled but neither cache.dir nor cache.repo is set".to_string(),
            ));
        }
        if self.cache.dir.is_some() && self.cache.repo.is_some() {
            return Err(BuildError::Config(
                "cache.dir and cache.repo are mutually exclusive".to_string(),
            ));
        }
        if self.ignore_paths.iter().any(|p| !p.is_absolute()) {
            return Err(BuildError::Config(
                "ignore_paths entries must be absolute".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether per-instruction caching is in effect for this build.
    pub fn caching_enabled(&self) -> bool {
        self.cache.enabled && !self.single_snapshot
    }
}

/// Layer cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Enable the layer cache
    pub enabled: bool,

    /// Local directory holding one OCI layout per cache key
    pub dir: Option<PathBuf>,

    /// Registry repository holding cache entries as `<repo>:<key>`
    pub repo: Option<String>,

    /// Cache COPY/ADD layers
    pub cache_copy_layers: bool,

    /// Cache RUN layers
    pub cache_run_layers: bool,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            dir: None,
            repo: None,
            cache_copy_layers: true,
            cache_run_layers: true,
        }
    }
}

/// Isolation applied to RUN subprocesses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunIsolation {
    /// chroot into the build root before exec (requires root)
    #[default]
    Chroot,
    /// Run directly on the host with the working directory under the root
    Host,
}

impl std::fmt::Display for RunIsolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Chroot => write!(f, "chroot"),
            Self::Host => write!(f, "host"),
        }
    }
}

impl std::str::FromStr for RunIsolation {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "chroot" => Ok(Self::Chroot),
            "host" => Ok(Self::Host),
            _ => Err(format!(
                "unknown run isolation: '{}' (supported: chroot, host)",
                s
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = BuildOptions::default();
        assert_eq!(options.root_dir, PathBuf::from("/"));
        assert!(!options.single_snapshot);
        assert!(!options.cache.enabled);
        assert!(options.cache.cache_copy_layers);
        assert_eq!(options.run_isolation, RunIsolation::Chroot);
        assert!(options.ignore_paths.contains(&PathBuf::from("/proc")));
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_cache_without_backend() {
        let mut options = BuildOptions::default();
        options.cache.enabled = true;
        assert!(matches!(options.validate(), Err(BuildError::Config(_))));

        options.cache.dir = Some(PathBuf::from("/cache"));
        assert!(options.validate().is_ok());

        options.cache.repo = Some("registry.local/cache".to_string());
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_relative_root() {
        let options = BuildOptions {
            root_dir: PathBuf::from("relative"),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_single_snapshot_disables_caching() {
        let mut options = BuildOptions::default();
        options.cache.enabled = true;
        options.cache.dir = Some(PathBuf::from("/cache"));
        assert!(options.caching_enabled());
        options.single_snapshot = true;
        assert!(!options.caching_enabled());
    }

    #[test]
    fn test_from_yaml_partial() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("kiln.yaml");
        std::fs::write(
            &path,
            "reproducible: true\nrun_isolation: host\ncache:\n  enabled: true\n  dir: /var/cache/kiln\n",
        )
        .unwrap();

        let options = BuildOptions::from_yaml_file(&path).unwrap();
        assert!(options.reproducible);
        assert_eq!(options.run_isolation, RunIsolation::Host);
        assert!(options.cache.enabled);
        assert_eq!(options.cache.dir, Some(PathBuf::from("/var/cache/kiln")));
        assert!(options.cache.cache_run_layers);
        assert_eq!(options.root_dir, PathBuf::from("/"));
    }

    #[test]
    fn test_from_yaml_missing_file() {
        let result = BuildOptions::from_yaml_file(Path::new("/nonexistent/kiln.yaml"));
        assert!(matches!(result, Err(BuildError::Config(_))));
    }

    #[test]
    fn test_run_isolation_from_str() {
        assert_eq!("chroot".parse::<RunIsolation>().unwrap(), RunIsolation::Chroot);
        assert_eq!("host".parse::<RunIsolation>().unwrap(), RunIsolation::Host);
        assert!("vm".parse::<RunIsolation>().is_err());
        assert_eq!(RunIsolation::Host.to_string(), "host");
    }
}
