//! File primitives shared by COPY and ADD.
//!
//! All functions work on host paths beneath the build root and return the
//! absolute host paths they wrote, which become the snapshot footprint.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use kiln_core::error::{BuildError, Result};
use xz2::read::XzDecoder;

use super::context::FileContext;
use super::ownership::Owner;
use crate::oci::unpack_archive;

/// Ownership and mode applied to written files.
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyOptions {
    pub owner: Option<Owner>,
    pub mode: Option<u32>,
}

impl CopyOptions {
    fn finish(&self, path: &Path, is_symlink: bool) -> Result<()> {
        if let (Some(mode), false) = (self.mode, is_symlink) {
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).map_err(|e| {
                BuildError::effect(format!("Failed to chmod {}: {}", path.display(), e))
            })?;
        }
        if let Some(owner) = self.owner {
            owner.apply(path)?;
        }
        Ok(())
    }
}

/// Absolute image path for `path`, relative paths resolved against `workdir`.
pub fn resolve_image_path(path: &str, workdir: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), path)
    }
}

/// Host location of an absolute image path. `..` never climbs above `root`.
pub fn host_path(root: &Path, image_path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    let mut depth = 0usize;
    for component in Path::new(image_path).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            Component::ParentDir if depth > 0 => {
                out.pop();
                depth -= 1;
            }
            _ => {}
        }
    }
    out
}

/// A destination names a directory when it ends with `/` or receives more
/// than one source.
pub fn destination_is_dir(dest: &str, source_count: usize) -> bool {
    dest.ends_with('/') || source_count > 1
}

/// Copy context sources (already wildcard-expanded, context-relative) to
/// `dest`. Directory sources contribute their contents. `dest_is_dir` is
/// decided by the caller over every source of the instruction.
pub fn copy_from_context(
    context: &FileContext,
    sources: &[PathBuf],
    dest: &str,
    dest_is_dir: bool,
    workdir: &str,
    root: &Path,
    options: &CopyOptions,
) -> Result<Vec<PathBuf>> {
    if sources.is_empty() {
        return Err(BuildError::Resolution(
            "no source files were specified".to_string(),
        ));
    }

    let dest_image = resolve_image_path(dest, workdir);
    let dest_host = host_path(root, &dest_image);
    let mut touched = Vec::new();

    for source in sources {
        let src_host = context.root().join(source);
        let meta = src_host.symlink_metadata().map_err(|e| {
            BuildError::Resolution(format!(
                "source {} not found in build context: {}",
                source.display(),
                e
            ))
        })?;

        if meta.is_dir() {
            touched.extend(ensure_dir(&dest_host, root, options)?);
            copy_dir_contents(context, source, &dest_host, options, &mut touched)?;
            continue;
        }

        let target = if dest_is_dir || dest_host.is_dir() {
            touched.extend(ensure_dir(&dest_host, root, options)?);
            let name = source.file_name().ok_or_else(|| {
                BuildError::Resolution(format!("source {} has no file name", source.display()))
            })?;
            dest_host.join(name)
        } else {
            if let Some(parent) = dest_host.parent() {
                touched.extend(create_parents(parent, root)?);
            }
            dest_host.clone()
        };
        copy_entry(&src_host, &target, options)?;
        touched.push(target);
    }

    tracing::debug!(
        dest = %dest_image,
        sources = sources.len(),
        files = touched.len(),
        "Copied from context"
    );
    Ok(touched)
}

fn copy_dir_contents(
    context: &FileContext,
    rel_dir: &Path,
    dest_dir: &Path,
    options: &CopyOptions,
    touched: &mut Vec<PathBuf>,
) -> Result<()> {
    let src_dir = context.root().join(rel_dir);
    let mut names: Vec<_> = std::fs::read_dir(&src_dir)?
        .map(|entry| entry.map(|e| e.file_name()))
        .collect::<std::io::Result<_>>()?;
    names.sort();

    for name in names {
        let rel = rel_dir.join(&name);
        if context.is_ignored(&rel) {
            continue;
        }
        let src = context.root().join(&rel);
        let dest = dest_dir.join(&name);
        let is_dir = src.symlink_metadata()?.is_dir();

        if is_dir {
            prepare_target(&dest, true)?;
            std::fs::create_dir_all(&dest)?;
            touched.push(dest.clone());
            copy_dir_contents(context, &rel, &dest, options, touched)?;
            finish_dir(&src, &dest, options)?;
        } else {
            copy_entry(&src, &dest, options)?;
            touched.push(dest);
        }
    }
    Ok(())
}

/// Copy a regular file or symlink to `dest`, replacing whatever is there.
fn copy_entry(src: &Path, dest: &Path, options: &CopyOptions) -> Result<()> {
    let meta = src.symlink_metadata()?;
    prepare_target(dest, false)?;

    if meta.file_type().is_symlink() {
        let target = std::fs::read_link(src)?;
        std::os::unix::fs::symlink(&target, dest).map_err(|e| {
            BuildError::effect(format!("Failed to create symlink {}: {}", dest.display(), e))
        })?;
        return options.finish(dest, true);
    }

    std::fs::copy(src, dest).map_err(|e| {
        BuildError::effect(format!(
            "Failed to copy {} to {}: {}",
            src.display(),
            dest.display(),
            e
        ))
    })?;
    File::open(dest)?.set_modified(meta.modified()?)?;
    options.finish(dest, false)
}

/// Apply mode and mtime of `src` to an already populated directory.
fn finish_dir(src: &Path, dest: &Path, options: &CopyOptions) -> Result<()> {
    let meta = src.metadata()?;
    if options.mode.is_none() {
        std::fs::set_permissions(dest, meta.permissions())?;
    }
    options.finish(dest, false)?;
    File::open(dest)?.set_modified(meta.modified()?)?;
    Ok(())
}

/// Make room for a new entry: a directory stays when a directory is
/// coming, anything else is removed.
fn prepare_target(dest: &Path, want_dir: bool) -> Result<()> {
    match dest.symlink_metadata() {
        Ok(meta) if meta.is_dir() && want_dir => Ok(()),
        Ok(meta) if meta.is_dir() => Ok(std::fs::remove_dir_all(dest)?),
        Ok(_) => Ok(std::fs::remove_file(dest)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create `dir` (and missing parents); newly created ones are returned.
fn ensure_dir(dir: &Path, root: &Path, options: &CopyOptions) -> Result<Vec<PathBuf>> {
    if dir.is_dir() {
        return Ok(Vec::new());
    }
    prepare_target(dir, true)?;
    let created = create_parents(dir, root)?;
    if let Some(owner) = options.owner {
        owner.apply(dir)?;
    }
    Ok(created)
}

fn create_parents(dir: &Path, root: &Path) -> Result<Vec<PathBuf>> {
    let missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|p| p.starts_with(root) && *p != root && !p.exists())
        .map(Path::to_path_buf)
        .collect();
    std::fs::create_dir_all(dir).map_err(|e| {
        BuildError::effect(format!("Failed to create directory {}: {}", dir.display(), e))
    })?;
    Ok(missing.into_iter().rev().collect())
}

/// Compression of a local archive recognised by ADD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    Gzip,
    Bzip2,
    Xz,
}

/// Detect a (possibly compressed) tar archive by its magic bytes.
pub fn detect_archive(path: &Path) -> Result<Option<ArchiveKind>> {
    if !path.symlink_metadata()?.is_file() {
        return Ok(None);
    }
    let mut file = File::open(path)?;
    let mut magic = [0u8; 6];
    let read = read_up_to(&mut file, &mut magic)?;
    file.seek(SeekFrom::Start(0))?;

    let kind = match &magic[..read] {
        [0x1f, 0x8b, ..] => ArchiveKind::Gzip,
        [b'B', b'Z', b'h', ..] => ArchiveKind::Bzip2,
        [0xfd, b'7', b'z', b'X', b'Z', 0x00] => ArchiveKind::Xz,
        _ => ArchiveKind::Tar,
    };

    let mut reader = decoder(file, kind);
    let mut header = [0u8; 512];
    let read = match read_up_to(&mut reader, &mut header) {
        Ok(n) => n,
        Err(_) => return Ok(None),
    };
    if read == 512 && &header[257..262] == b"ustar" {
        Ok(Some(kind))
    } else {
        Ok(None)
    }
}

/// Extract a local archive at `dest_host`; whiteout names are kept as
/// plain files. Returns the paths written.
pub fn extract_archive(
    path: &Path,
    kind: ArchiveKind,
    dest_host: &Path,
    options: &CopyOptions,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest_host)?;
    let file = File::open(path)?;
    let touched = unpack_archive(decoder(file, kind), dest_host, false)?;
    if options.owner.is_some() || options.mode.is_some() {
        for path in &touched {
            let is_symlink = path.symlink_metadata()?.file_type().is_symlink();
            options.finish(path, is_symlink)?;
        }
    }
    tracing::debug!(
        archive = %path.display(),
        dest = %dest_host.display(),
        entries = touched.len(),
        "Extracted local archive"
    );
    Ok(touched)
}

fn decoder(file: File, kind: ArchiveKind) -> Box<dyn Read> {
    let reader = BufReader::new(file);
    match kind {
        ArchiveKind::Tar => Box::new(reader),
        ArchiveKind::Gzip => Box::new(GzDecoder::new(reader)),
        ArchiveKind::Bzip2 => Box::new(BzDecoder::new(reader)),
        ArchiveKind::Xz => Box::new(XzDecoder::new(reader)),
    }
}

fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = reader.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}
