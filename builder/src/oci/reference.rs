//! Image reference parsing.
//!
//! Parses references like `registry.local:5000/team/app:v1` into their parts.

use kiln_core::error::{BuildError, Result};

/// Registry used when a reference names none.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Tag used when a reference carries neither tag nor digest.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, with port if any
    pub registry: String,
    /// Repository path (e.g. "library/alpine")
    pub repository: String,
    pub tag: Option<String>,
    /// Digest (e.g. "sha256:abc...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse a reference string.
    ///
    /// - `alpine` → docker.io/library/alpine:latest
    /// - `team/app:v1` → docker.io/team/app:v1
    /// - `localhost:5000/app` → localhost:5000/app:latest
    /// - `ghcr.io/org/app@sha256:...` → digest only
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(BuildError::OciImage("Empty image reference".to_string()));
        }

        let (name_tag, digest) = match reference.rsplit_once('@') {
            Some((name, digest)) => {
                if !digest.contains(':') {
                    return Err(BuildError::OciImage(format!(
                        "Invalid digest in reference '{}': expected algorithm:hex",
                        reference
                    )));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        let (name, tag) = split_tag(name_tag);
        let (registry, repository) = split_registry(name)?;

        let tag = match (tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            (tag, _) => tag.map(str::to_string),
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Same repository with a different tag and no digest.
    pub fn with_tag(&self, tag: &str) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: self.repository.clone(),
            tag: Some(tag.to_string()),
            digest: None,
        }
    }

    /// Get the full reference string.
    pub fn full_reference(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(tag) = &self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(digest) = &self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_reference())
    }
}

/// Split `name[:tag]`. A colon before the last slash, or a purely numeric
/// suffix on a slash-less name, is a registry port rather than a tag.
fn split_tag(name_tag: &str) -> (&str, Option<&str>) {
    let last_segment_start = name_tag.rfind('/').map(|i| i + 1).unwrap_or(0);
    match name_tag[last_segment_start..].rfind(':') {
        Some(offset) => {
            let colon = last_segment_start + offset;
            let tag = &name_tag[colon + 1..];
            if last_segment_start == 0 && tag.chars().all(|c| c.is_ascii_digit()) {
                (name_tag, None)
            } else {
                (&name_tag[..colon], Some(tag))
            }
        }
        None => (name_tag, None),
    }
}

/// The first component names a registry if it looks like a host.
fn split_registry(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(BuildError::OciImage(format!(
                    "Empty repository in reference '{}'",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
        return Ok((DEFAULT_REGISTRY.to_string(), name.to_string()));
    }
    Ok((DEFAULT_REGISTRY.to_string(), format!("library/{}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("alpine").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_user_repo_with_tag() {
        let r = ImageReference::parse("team/app:v1.0").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, Some("v1.0".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("registry.local:5000/app:v1").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("v1".to_string()));

        let r = ImageReference::parse("localhost:5000/cache").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse("ghcr.io/org/app@sha256:abcdef").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some("sha256:abcdef".to_string()));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("ghcr.io/org/app:v2@sha256:abcdef").unwrap();
        assert_eq!(r.tag, Some("v2".to_string()));
        assert_eq!(r.digest, Some("sha256:abcdef".to_string()));
        assert_eq!(r.full_reference(), "ghcr.io/org/app:v2@sha256:abcdef");
    }

    #[test]
    fn test_parse_errors() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("alpine@nodigest").is_err());
        assert!(ImageReference::parse("ghcr.io/").is_err());
    }

    #[test]
    fn test_with_tag() {
        let r = ImageReference::parse("registry.local/cache@sha256:abc").unwrap();
        let tagged = r.with_tag("deadbeef");
        assert_eq!(tagged.to_string(), "registry.local/cache:deadbeef");
    }

    #[test]
    fn test_display_deep_path() {
        let r = ImageReference::parse("ghcr.io/org/sub/app:v1").unwrap();
        assert_eq!(r.repository, "org/sub/app");
        assert_eq!(format!("{}", r), "ghcr.io/org/sub/app:v1");
    }
}
