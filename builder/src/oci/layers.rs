//! Layer extraction onto a root filesystem.
//!
//! Layers are applied the way an overlay stack would see them: whiteout
//! entries delete lower paths, opaque markers clear a directory, and an
//! entry whose type differs from what is on disk replaces it.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use kiln_core::error::{BuildError, Result};

use crate::snapshot::layer::is_gzip;
use crate::snapshot::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};

/// Extract a layer blob (gzip or plain tar) into `target_dir`, honouring
/// whiteouts. Returns the absolute paths the layer touched.
pub fn extract_layer(layer_path: &Path, target_dir: &Path) -> Result<Vec<PathBuf>> {
    if !layer_path.exists() {
        return Err(BuildError::OciImage(format!(
            "Layer file not found: {}",
            layer_path.display()
        )));
    }
    std::fs::create_dir_all(target_dir).map_err(|e| {
        BuildError::OciImage(format!(
            "Failed to create target directory {}: {}",
            target_dir.display(),
            e
        ))
    })?;

    let file = File::open(layer_path).map_err(|e| {
        BuildError::OciImage(format!(
            "Failed to open layer file {}: {}",
            layer_path.display(),
            e
        ))
    })?;
    let touched = if is_gzip(layer_path)? {
        unpack_archive(GzDecoder::new(file), target_dir, true)?
    } else {
        unpack_archive(file, target_dir, true)?
    };

    tracing::debug!(
        layer = %layer_path.display(),
        target = %target_dir.display(),
        entries = touched.len(),
        "Extracted layer"
    );
    Ok(touched)
}

/// Unpack a tar stream into `target_dir`.
///
/// Ownership is restored only when running as root. With `honor_whiteouts`
/// unset, whiteout files are unpacked as ordinary files.
pub fn unpack_archive<R: Read>(
    reader: R,
    target_dir: &Path,
    honor_whiteouts: bool,
) -> Result<Vec<PathBuf>> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.set_preserve_ownerships(is_root());

    let entries = archive
        .entries()
        .map_err(|e| BuildError::effect(format!("Failed to read archive: {}", e)))?;

    let mut touched = Vec::new();
    for entry in entries {
        let mut entry =
            entry.map_err(|e| BuildError::effect(format!("Failed to read archive entry: {}", e)))?;
        let raw = entry
            .path()
            .map_err(|e| BuildError::effect(format!("Invalid archive entry path: {}", e)))?
            .into_owned();

        let rel = match normalize(&raw) {
            Some(rel) => rel,
            None => {
                tracing::warn!(path = %raw.display(), "Skipping unsafe archive entry");
                continue;
            }
        };
        if rel.as_os_str().is_empty() {
            continue;
        }

        let name = rel
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let parent = target_dir.join(rel.parent().unwrap_or_else(|| Path::new("")));

        if honor_whiteouts && name == OPAQUE_WHITEOUT {
            clear_dir(&parent)?;
            touched.push(parent);
            continue;
        }
        if honor_whiteouts && name.starts_with(WHITEOUT_PREFIX) {
            let victim = parent.join(&name[WHITEOUT_PREFIX.len()..]);
            remove_path(&victim)?;
            touched.push(victim);
            continue;
        }

        let dest = target_dir.join(&rel);
        let entry_is_dir = entry.header().entry_type().is_dir();
        if let Ok(existing) = std::fs::symlink_metadata(&dest) {
            if existing.is_dir() && !entry_is_dir {
                std::fs::remove_dir_all(&dest)?;
            } else if !existing.is_dir() && entry_is_dir {
                std::fs::remove_file(&dest)?;
            }
        }

        entry.unpack_in(target_dir).map_err(|e| {
            BuildError::effect(format!("Failed to extract {}: {}", rel.display(), e))
        })?;
        touched.push(dest);
    }
    Ok(touched)
}

/// Strip root and `.` components; reject `..`.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => rel.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(rel)
}

fn remove_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(path)?,
        Ok(_) => std::fs::remove_file(path)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn clear_dir(dir: &Path) -> Result<()> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in read_dir {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

pub(crate) fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions
    unsafe { libc::geteuid() == 0 }
}
