//! Build context access.
//!
//! Every path handed out by [`FileContext`] is confined to the context
//! root. `.dockerignore` rules hide files from wildcard expansion, copies
//! and cache hashing.

use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use kiln_core::error::{BuildError, Result};
use sha2::{Digest, Sha256};

const IGNORE_FILE: &str = ".dockerignore";

#[derive(Debug, Clone)]
struct IgnoreRule {
    pattern: glob::Pattern,
    negate: bool,
}

/// Read-only handle on the build context directory.
#[derive(Debug, Clone)]
pub struct FileContext {
    root: PathBuf,
    rules: Vec<IgnoreRule>,
}

impl FileContext {
    /// Open a context rooted at `root`, loading `.dockerignore` if present.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| {
            BuildError::Config(format!(
                "Failed to open build context {}: {}",
                root.display(),
                e
            ))
        })?;

        let rules = match std::fs::read_to_string(root.join(IGNORE_FILE)) {
            Ok(content) => parse_ignore_rules(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                return Err(BuildError::Config(format!(
                    "Failed to read {}: {}",
                    IGNORE_FILE, e
                )))
            }
        };

        tracing::debug!(
            root = %root.display(),
            ignore_rules = rules.len(),
            "Opened build context"
        );
        Ok(Self { root, rules })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a context-relative path to a host path beneath the root.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf> {
        let normalized = normalize(rel).ok_or_else(|| {
            BuildError::Resolution(format!("path '{}' escapes the build context", rel))
        })?;
        Ok(self.root.join(normalized))
    }

    pub fn exists(&self, rel: &str) -> bool {
        self.resolve(rel)
            .map(|path| path.symlink_metadata().is_ok())
            .unwrap_or(false)
    }

    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.resolve(rel)?;
        std::fs::read(&path).map_err(|e| {
            BuildError::Resolution(format!("Failed to read context file {}: {}", rel, e))
        })
    }

    /// Whether a context-relative path is excluded by `.dockerignore`.
    /// A path is also excluded when one of its parent directories is.
    pub fn is_ignored(&self, rel: &Path) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        let mut prefix = PathBuf::new();
        for component in rel.components() {
            if let Component::Normal(part) = component {
                prefix.push(part);
                if self.matches_rules(&prefix) {
                    return true;
                }
            }
        }
        false
    }

    fn matches_rules(&self, rel: &Path) -> bool {
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };
        let mut ignored = false;
        for rule in &self.rules {
            if rule.pattern.matches_path_with(rel, options) {
                ignored = !rule.negate;
            }
        }
        ignored
    }

    /// Expand a wildcard source into matching context-relative paths,
    /// sorted. A pattern without wildcards yields itself when it exists.
    pub fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let normalized = normalize(pattern).ok_or_else(|| {
            BuildError::Resolution(format!("path '{}' escapes the build context", pattern))
        })?;

        if !has_wildcard(pattern) {
            let found = self.root.join(&normalized).symlink_metadata().is_ok();
            return Ok(if found && !self.is_ignored(&normalized) {
                vec![normalized]
            } else {
                Vec::new()
            });
        }

        let full = format!(
            "{}/{}",
            glob::Pattern::escape(&self.root.to_string_lossy()),
            normalized.to_string_lossy()
        );
        let entries = glob::glob(&full).map_err(|e| {
            BuildError::Resolution(format!("invalid wildcard '{}': {}", pattern, e))
        })?;

        let mut matches = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| {
                BuildError::Resolution(format!("Failed to expand '{}': {}", pattern, e))
            })?;
            if let Ok(rel) = path.strip_prefix(&self.root) {
                if !self.is_ignored(rel) {
                    matches.push(rel.to_path_buf());
                }
            }
        }
        matches.sort();
        Ok(matches)
    }

    /// Deterministic digest of a context file or tree: modes, link targets
    /// and file contents, independent of timestamps and ownership.
    pub fn hash_path(&self, rel: &Path) -> Result<String> {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher, rel)?;
        Ok(hex::encode(hasher.finalize()))
    }

    fn hash_into(&self, hasher: &mut Sha256, rel: &Path) -> Result<()> {
        let path = self.root.join(rel);
        let meta = path.symlink_metadata().map_err(|e| {
            BuildError::Resolution(format!(
                "Failed to stat context path {}: {}",
                rel.display(),
                e
            ))
        })?;

        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update([0]);
        hasher.update(meta.permissions().mode().to_le_bytes());

        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = std::fs::read_link(&path)?;
            hasher.update(target.to_string_lossy().as_bytes());
        } else if file_type.is_dir() {
            let mut children: Vec<PathBuf> = std::fs::read_dir(&path)?
                .map(|entry| entry.map(|e| rel.join(e.file_name())))
                .collect::<std::io::Result<_>>()?;
            children.sort();
            for child in children {
                if !self.is_ignored(&child) {
                    self.hash_into(hasher, &child)?;
                }
            }
        } else if file_type.is_file() {
            let mut file = std::fs::File::open(&path)?;
            std::io::copy(&mut file, hasher)?;
        }
        Ok(())
    }
}

fn parse_ignore_rules(content: &str) -> Result<Vec<IgnoreRule>> {
    let mut rules = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let (negate, raw) = match line.strip_prefix('!') {
            Some(rest) => (true, rest.trim()),
            None => (false, line),
        };
        let cleaned = raw
            .trim_start_matches("./")
            .trim_start_matches('/')
            .trim_end_matches('/');
        if cleaned.is_empty() {
            continue;
        }
        let pattern = glob::Pattern::new(cleaned).map_err(|e| {
            BuildError::Config(format!("invalid {} pattern '{}': {}", IGNORE_FILE, raw, e))
        })?;
        rules.push(IgnoreRule { pattern, negate });
    }
    Ok(rules)
}

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Lexically normalize a context-relative path; `None` if it climbs above
/// the root.
fn normalize(rel: &str) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                if !out.pop() {
                    return None;
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context(files: &[(&str, &str)], ignore: Option<&str>) -> (TempDir, FileContext) {
        let tmp = TempDir::new().unwrap();
        for (path, content) in files {
            let full = tmp.path().join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        if let Some(ignore) = ignore {
            std::fs::write(tmp.path().join(IGNORE_FILE), ignore).unwrap();
        }
        let ctx = FileContext::new(tmp.path()).unwrap();
        (tmp, ctx)
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let (_tmp, ctx) = context(&[("a.txt", "a")], None);
        assert!(ctx.resolve("a.txt").unwrap().starts_with(ctx.root()));
        assert!(ctx.resolve("/a.txt").unwrap().ends_with("a.txt"));
        assert!(ctx.resolve("dir/../a.txt").unwrap().ends_with("a.txt"));
        assert!(matches!(
            ctx.resolve("../outside"),
            Err(BuildError::Resolution(_))
        ));
        assert!(ctx.resolve("a/../../b").is_err());
    }

    #[test]
    fn test_exists_and_read() {
        let (_tmp, ctx) = context(&[("dir/file.txt", "hello")], None);
        assert!(ctx.exists("dir/file.txt"));
        assert!(ctx.exists("dir"));
        assert!(!ctx.exists("missing"));
        assert!(!ctx.exists("../escape"));
        assert_eq!(ctx.read("dir/file.txt").unwrap(), b"hello");
        assert!(ctx.read("missing").is_err());
    }

    #[test]
    fn test_glob() {
        let (_tmp, ctx) = context(
            &[("a.txt", "a"), ("b.txt", "b"), ("c.md", "c"), ("sub/d.txt", "d")],
            None,
        );
        assert_eq!(
            ctx.glob("*.txt").unwrap(),
            vec![PathBuf::from("a.txt"), PathBuf::from("b.txt")]
        );
        assert_eq!(ctx.glob("sub/*").unwrap(), vec![PathBuf::from("sub/d.txt")]);
        assert_eq!(ctx.glob("c.md").unwrap(), vec![PathBuf::from("c.md")]);
        assert!(ctx.glob("nothing*").unwrap().is_empty());
        assert!(ctx.glob("missing.txt").unwrap().is_empty());
    }

    #[test]
    fn test_dockerignore() {
        let (_tmp, ctx) = context(
            &[
                ("keep.txt", "k"),
                ("secret.key", "s"),
                ("logs/a.log", "a"),
                ("logs/important.log", "i"),
                ("build/out.bin", "o"),
            ],
            Some("# comment\n*.key\nlogs/*.log\n!logs/important.log\n/build/\n"),
        );
        assert!(!ctx.is_ignored(Path::new("keep.txt")));
        assert!(ctx.is_ignored(Path::new("secret.key")));
        assert!(ctx.is_ignored(Path::new("logs/a.log")));
        assert!(!ctx.is_ignored(Path::new("logs/important.log")));
        assert!(ctx.is_ignored(Path::new("build/out.bin")));

        let matched = ctx.glob("*").unwrap();
        assert!(matched.contains(&PathBuf::from("keep.txt")));
        assert!(!matched.contains(&PathBuf::from("secret.key")));
        assert!(!matched.contains(&PathBuf::from("build")));
    }

    #[test]
    fn test_hash_path_tracks_content_not_mtime() {
        let (tmp, ctx) = context(&[("dir/a.txt", "one"), ("dir/b.txt", "two")], None);
        let before = ctx.hash_path(Path::new("dir")).unwrap();

        let file = std::fs::File::options()
            .write(true)
            .open(tmp.path().join("dir/a.txt"))
            .unwrap();
        file.set_modified(std::time::SystemTime::UNIX_EPOCH).unwrap();
        assert_eq!(ctx.hash_path(Path::new("dir")).unwrap(), before);

        std::fs::write(tmp.path().join("dir/a.txt"), "changed").unwrap();
        assert_ne!(ctx.hash_path(Path::new("dir")).unwrap(), before);
    }

    #[test]
    fn test_hash_path_skips_ignored() {
        let (tmp, ctx) = context(&[("dir/a.txt", "one")], Some("dir/*.tmp\n"));
        let before = ctx.hash_path(Path::new("dir")).unwrap();
        std::fs::write(tmp.path().join("dir/scratch.tmp"), "noise").unwrap();
        assert_eq!(ctx.hash_path(Path::new("dir")).unwrap(), before);
    }

    #[test]
    fn test_hash_path_covers_whole_large_file() {
        let mut big = "x".repeat(200 * 1024);
        let (tmp, ctx) = context(&[("blob.bin", big.as_str())], None);
        let before = ctx.hash_path(Path::new("blob.bin")).unwrap();

        big.push('y');
        std::fs::write(tmp.path().join("blob.bin"), &big).unwrap();
        assert_ne!(ctx.hash_path(Path::new("blob.bin")).unwrap(), before);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("./a/./b"), Some(PathBuf::from("a/b")));
        assert_eq!(normalize("/abs"), Some(PathBuf::from("abs")));
        assert_eq!(normalize("."), Some(PathBuf::new()));
        assert_eq!(normalize(".."), None);
    }
}
