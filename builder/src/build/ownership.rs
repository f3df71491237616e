//! `--chown` and `--chmod` resolution against the image's user database.

use std::collections::BTreeMap;
use std::path::Path;

use kiln_core::error::{BuildError, Result};

use super::args::expand;

/// Numeric owner applied to files written by COPY/ADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// Change ownership of `path` without following symlinks.
    pub fn apply(&self, path: &Path) -> Result<()> {
        std::os::unix::fs::lchown(path, Some(self.uid), Some(self.gid)).map_err(|e| {
            BuildError::effect(format!(
                "Failed to chown {} to {}:{}: {}",
                path.display(),
                self.uid,
                self.gid,
                e
            ))
        })
    }
}

/// Resolve an owner spec (`user`, `uid`, `user:group`, `uid:gid`).
///
/// Falls back to the image's configured user when no spec is given.
/// Returns `None` when neither is set, meaning ownership is left alone.
pub fn resolve_chown(
    spec: Option<&str>,
    config_user: Option<&str>,
    root: &Path,
    envs: &BTreeMap<String, String>,
) -> Result<Option<Owner>> {
    let spec = match spec.or(config_user).map(str::trim) {
        Some(s) if !s.is_empty() => expand(s, envs)?,
        _ => return Ok(None),
    };

    let (user, group) = match spec.split_once(':') {
        Some((user, group)) => (user, Some(group)),
        None => (spec.as_str(), None),
    };

    let passwd = read_db(&root.join("etc/passwd"))?;
    let (uid, primary_gid) = match user.parse::<u32>() {
        Ok(uid) => {
            let primary = passwd
                .iter()
                .find(|fields| fields.get(2).and_then(|f| f.parse::<u32>().ok()) == Some(uid))
                .and_then(|fields| fields.get(3).and_then(|f| f.parse::<u32>().ok()));
            (uid, primary.unwrap_or(uid))
        }
        Err(_) => lookup_user(&passwd, user)?,
    };

    let gid = match group {
        None | Some("") => primary_gid,
        Some(group) => match group.parse::<u32>() {
            Ok(gid) => gid,
            Err(_) => lookup_group(&read_db(&root.join("etc/group"))?, group)?,
        },
    };

    tracing::debug!(spec = %spec, uid, gid, "Resolved owner");
    Ok(Some(Owner { uid, gid }))
}

/// Resolve an octal `--chmod` value.
pub fn resolve_chmod(spec: Option<&str>, envs: &BTreeMap<String, String>) -> Result<Option<u32>> {
    let spec = match spec.map(str::trim) {
        Some(s) if !s.is_empty() => expand(s, envs)?,
        _ => return Ok(None),
    };
    let mode = u32::from_str_radix(&spec, 8)
        .map_err(|_| BuildError::Resolution(format!("invalid chmod value '{}'", spec)))?;
    if mode > 0o7777 {
        return Err(BuildError::Resolution(format!(
            "chmod value '{}' out of range",
            spec
        )));
    }
    Ok(Some(mode))
}

/// Colon-separated database such as `/etc/passwd`; missing file is empty.
fn read_db(path: &Path) -> Result<Vec<Vec<String>>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(BuildError::Resolution(format!(
                "Failed to read {}: {}",
                path.display(),
                e
            )))
        }
    };
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'))
        .map(|line| line.split(':').map(str::to_string).collect())
        .collect())
}

fn lookup_user(passwd: &[Vec<String>], name: &str) -> Result<(u32, u32)> {
    passwd
        .iter()
        .find(|fields| fields.first().map(String::as_str) == Some(name))
        .and_then(|fields| {
            let uid = fields.get(2)?.parse().ok()?;
            let gid = fields.get(3)?.parse().ok()?;
            Some((uid, gid))
        })
        .ok_or_else(|| BuildError::Resolution(format!("unknown user '{}'", name)))
}

fn lookup_group(groups: &[Vec<String>], name: &str) -> Result<u32> {
    groups
        .iter()
        .find(|fields| fields.first().map(String::as_str) == Some(name))
        .and_then(|fields| fields.get(2)?.parse().ok())
        .ok_or_else(|| BuildError::Resolution(format!("unknown group '{}'", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rootfs() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("etc")).unwrap();
        std::fs::write(
            tmp.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/sh\napp:x:1000:1000::/home/app:/bin/sh\nsvc:x:1001:50::/:/sbin/nologin\n",
        )
        .unwrap();
        std::fs::write(
            tmp.path().join("etc/group"),
            "root:x:0:\nstaff:x:50:\napp:x:1000:\n",
        )
        .unwrap();
        tmp
    }

    #[test]
    fn test_chown_by_name() {
        let root = rootfs();
        let envs = BTreeMap::new();
        assert_eq!(
            resolve_chown(Some("app"), None, root.path(), &envs).unwrap(),
            Some(Owner { uid: 1000, gid: 1000 })
        );
        assert_eq!(
            resolve_chown(Some("svc"), None, root.path(), &envs).unwrap(),
            Some(Owner { uid: 1001, gid: 50 })
        );
        assert_eq!(
            resolve_chown(Some("app:staff"), None, root.path(), &envs).unwrap(),
            Some(Owner { uid: 1000, gid: 50 })
        );
    }

    #[test]
    fn test_chown_numeric() {
        let root = rootfs();
        let envs = BTreeMap::new();
        assert_eq!(
            resolve_chown(Some("1001"), None, root.path(), &envs).unwrap(),
            Some(Owner { uid: 1001, gid: 50 })
        );
        assert_eq!(
            resolve_chown(Some("4242"), None, root.path(), &envs).unwrap(),
            Some(Owner { uid: 4242, gid: 4242 })
        );
        assert_eq!(
            resolve_chown(Some("7:8"), None, root.path(), &envs).unwrap(),
            Some(Owner { uid: 7, gid: 8 })
        );
    }

    #[test]
    fn test_chown_defaults_to_config_user() {
        let root = rootfs();
        let envs = BTreeMap::new();
        assert_eq!(
            resolve_chown(None, Some("app"), root.path(), &envs).unwrap(),
            Some(Owner { uid: 1000, gid: 1000 })
        );
        assert_eq!(resolve_chown(None, None, root.path(), &envs).unwrap(), None);
        assert_eq!(resolve_chown(None, Some(""), root.path(), &envs).unwrap(), None);
    }

    #[test]
    fn test_chown_expands_variables() {
        let root = rootfs();
        let envs: BTreeMap<String, String> =
            [("APP_USER".to_string(), "app".to_string())].into_iter().collect();
        assert_eq!(
            resolve_chown(Some("${APP_USER}:root"), None, root.path(), &envs).unwrap(),
            Some(Owner { uid: 1000, gid: 0 })
        );
    }

    #[test]
    fn test_chown_unknown_names() {
        let root = rootfs();
        let envs = BTreeMap::new();
        assert!(matches!(
            resolve_chown(Some("nobody"), None, root.path(), &envs),
            Err(BuildError::Resolution(_))
        ));
        assert!(resolve_chown(Some("app:wheel"), None, root.path(), &envs).is_err());

        let empty = TempDir::new().unwrap();
        assert!(resolve_chown(Some("app"), None, empty.path(), &envs).is_err());
    }

    #[test]
    fn test_chmod() {
        let envs: BTreeMap<String, String> =
            [("MODE".to_string(), "640".to_string())].into_iter().collect();
        assert_eq!(resolve_chmod(Some("0755"), &envs).unwrap(), Some(0o755));
        assert_eq!(resolve_chmod(Some("$MODE"), &envs).unwrap(), Some(0o640));
        assert_eq!(resolve_chmod(None, &envs).unwrap(), None);
        assert!(resolve_chmod(Some("u+x"), &envs).is_err());
        assert!(resolve_chmod(Some("17777"), &envs).is_err());
        assert!(resolve_chmod(Some("0789"), &envs).is_err());
    }

    #[test]
    fn test_owner_apply_to_self() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("f");
        std::fs::write(&path, "x").unwrap();
        let owner = Owner {
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        };
        owner.apply(&path).unwrap();
    }
}
