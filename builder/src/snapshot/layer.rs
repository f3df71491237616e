//! Layer archive construction.
//!
//! Layers are written as gzip-compressed tarballs. Both the compressed blob
//! digest and the uncompressed diff ID are computed while streaming, so a
//! finished layer never has to be re-read.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_core::error::{BuildError, Result};
use sha2::{Digest, Sha256};

use super::{FileKind, FileRecord};

/// Prefix marking a deleted path inside a layer.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker hiding every lower-layer child of the directory holding it.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Media type of gzip-compressed OCI layers.
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// Media type of uncompressed OCI layers.
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Kind of a single entry inside a layer archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayerEntryKind {
    File,
    Directory,
    Symlink(PathBuf),
    /// Hard link to another path of the image
    HardLink(PathBuf),
    /// Deletion marker for the path
    Whiteout,
    Other,
}

/// One entry of a layer, with its path relative to the image root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerEntry {
    pub path: PathBuf,
    pub kind: LayerEntryKind,
}

/// A finished layer blob on disk.
#[derive(Debug, Clone)]
pub struct LayerArtifact {
    /// Path to the layer blob
    pub path: PathBuf,
    /// SHA256 of the blob (hex string, without "sha256:" prefix)
    pub digest: String,
    /// SHA256 of the uncompressed tar stream (hex string)
    pub diff_id: String,
    /// Blob size in bytes
    pub size: u64,
    /// Blob media type
    pub media_type: String,
    /// Archive entries in write order
    pub entries: Vec<LayerEntry>,
}

impl LayerArtifact {
    /// Get the digest with "sha256:" prefix.
    pub fn prefixed_digest(&self) -> String {
        format!("sha256:{}", self.digest)
    }

    /// Get the diff ID with "sha256:" prefix.
    pub fn prefixed_diff_id(&self) -> String {
        format!("sha256:{}", self.diff_id)
    }

    /// Paths deleted by this layer (whiteout targets).
    pub fn whiteouts(&self) -> impl Iterator<Item = &LayerEntry> {
        self.entries
            .iter()
            .filter(|e| e.kind == LayerEntryKind::Whiteout)
    }

    /// Load an existing blob, computing digest, diff ID and the entry list.
    ///
    /// Accepts gzip-compressed and plain tar blobs.
    pub fn from_blob(path: &Path) -> Result<Self> {
        let mut file = open(path)?;
        let mut hasher = HashingWriter::new(std::io::sink());
        std::io::copy(&mut file, &mut hasher).map_err(|e| {
            BuildError::Snapshot(format!("Failed to hash layer {}: {}", path.display(), e))
        })?;
        let (_, digest, size) = hasher.finalize();

        let gzipped = is_gzip(path)?;
        let file = open(path)?;
        let reader: Box<dyn Read> = if gzipped {
            Box::new(flate2::read::GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        let mut tee = HashingReader::new(reader);
        let entries = list_entries(&mut tee, path)?;
        std::io::copy(&mut tee, &mut std::io::sink()).map_err(|e| {
            BuildError::Snapshot(format!("Failed to read layer {}: {}", path.display(), e))
        })?;
        let diff_id = tee.finalize();

        Ok(Self {
            path: path.to_path_buf(),
            digest,
            diff_id,
            size,
            media_type: if gzipped {
                MEDIA_TYPE_LAYER_GZIP
            } else {
                MEDIA_TYPE_LAYER_TAR
            }
            .to_string(),
            entries,
        })
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| {
        BuildError::Snapshot(format!("Failed to open layer {}: {}", path.display(), e))
    })
}

/// Whether the file starts with the gzip magic bytes.
pub fn is_gzip(path: &Path) -> Result<bool> {
    let mut magic = [0u8; 2];
    let mut file = open(path)?;
    let n = file.read(&mut magic)?;
    Ok(n == 2 && magic == [0x1f, 0x8b])
}

fn list_entries<R: Read>(reader: R, path: &Path) -> Result<Vec<LayerEntry>> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive.entries().map_err(|e| {
        BuildError::Snapshot(format!("Failed to read layer {}: {}", path.display(), e))
    })?;

    let mut listed = Vec::new();
    for entry in entries {
        let entry = entry
            .map_err(|e| BuildError::Snapshot(format!("Failed to read layer entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| BuildError::Snapshot(format!("Invalid layer entry path: {}", e)))?
            .into_owned();
        let link = entry.link_name().ok().flatten().map(|l| l.into_owned());

        let is_whiteout = entry_path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with(WHITEOUT_PREFIX))
            .unwrap_or(false);

        let kind = match entry.header().entry_type() {
            _ if is_whiteout => LayerEntryKind::Whiteout,
            tar::EntryType::Regular | tar::EntryType::Continuous => LayerEntryKind::File,
            tar::EntryType::Directory => LayerEntryKind::Directory,
            tar::EntryType::Symlink => LayerEntryKind::Symlink(link.unwrap_or_default()),
            tar::EntryType::Link => LayerEntryKind::HardLink(link.unwrap_or_default()),
            _ => LayerEntryKind::Other,
        };
        listed.push(LayerEntry {
            path: entry_path,
            kind,
        });
    }
    Ok(listed)
}

/// Writer adapter that hashes and counts everything passing through.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Returns the inner writer, hex digest and byte count.
    pub fn finalize(self) -> (W, String, u64) {
        (self.inner, hex::encode(self.hasher.finalize()), self.written)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

type LayerStream = HashingWriter<GzEncoder<HashingWriter<File>>>;

/// Streaming writer for one layer blob.
pub struct LayerWriter {
    path: PathBuf,
    builder: tar::Builder<LayerStream>,
    entries: Vec<LayerEntry>,
    reproducible: bool,
}

impl LayerWriter {
    /// Create a new layer blob at `path`.
    ///
    /// With `reproducible` set every entry gets a zero mtime.
    pub fn create(path: &Path, reproducible: bool) -> Result<Self> {
        let file = File::create(path).map_err(|e| {
            BuildError::Snapshot(format!(
                "Failed to create layer file {}: {}",
                path.display(),
                e
            ))
        })?;
        let encoder = GzEncoder::new(HashingWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(HashingWriter::new(encoder));
        builder.mode(tar::HeaderMode::Complete);

        Ok(Self {
            path: path.to_path_buf(),
            builder,
            entries: Vec::new(),
            reproducible,
        })
    }

    fn header(&self, record: &FileRecord, entry_type: tar::EntryType, size: u64) -> tar::Header {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(entry_type);
        header.set_mode(record.mode & 0o7777);
        header.set_uid(record.uid as u64);
        header.set_gid(record.gid as u64);
        header.set_mtime(if self.reproducible {
            0
        } else {
            record.mtime.max(0) as u64
        });
        header.set_size(size);
        header
    }

    /// Append the file at `root/rel` as described by `record`.
    pub fn append(&mut self, root: &Path, rel: &Path, record: &FileRecord) -> Result<()> {
        let kind = match &record.kind {
            FileKind::Directory => {
                let mut header = self.header(record, tar::EntryType::Directory, 0);
                self.builder
                    .append_data(&mut header, rel, std::io::empty())
                    .map_err(|e| append_error(rel, e))?;
                LayerEntryKind::Directory
            }
            FileKind::Regular => {
                let full = root.join(rel);
                let file = File::open(&full).map_err(|e| {
                    BuildError::Snapshot(format!("Failed to open {}: {}", full.display(), e))
                })?;
                let mut header = self.header(record, tar::EntryType::Regular, record.size);
                self.builder
                    .append_data(&mut header, rel, file.take(record.size))
                    .map_err(|e| append_error(rel, e))?;
                LayerEntryKind::File
            }
            FileKind::Symlink(target) => {
                let mut header = self.header(record, tar::EntryType::Symlink, 0);
                self.builder
                    .append_link(&mut header, rel, target)
                    .map_err(|e| append_error(rel, e))?;
                LayerEntryKind::Symlink(target.clone())
            }
            FileKind::Fifo => {
                let mut header = self.header(record, tar::EntryType::Fifo, 0);
                self.builder
                    .append_data(&mut header, rel, std::io::empty())
                    .map_err(|e| append_error(rel, e))?;
                LayerEntryKind::Other
            }
            FileKind::Other => {
                tracing::debug!(path = %rel.display(), "Skipping special file");
                return Ok(());
            }
        };
        self.entries.push(LayerEntry {
            path: rel.to_path_buf(),
            kind,
        });
        Ok(())
    }

    /// Append a hard link at `rel` pointing to `target` (both image-relative).
    pub fn append_hardlink(&mut self, rel: &Path, target: &Path, record: &FileRecord) -> Result<()> {
        let mut header = self.header(record, tar::EntryType::Link, 0);
        self.builder
            .append_link(&mut header, rel, target)
            .map_err(|e| append_error(rel, e))?;
        self.entries.push(LayerEntry {
            path: rel.to_path_buf(),
            kind: LayerEntryKind::HardLink(target.to_path_buf()),
        });
        Ok(())
    }

    /// Append a whiteout marking `rel` as deleted.
    pub fn append_whiteout(&mut self, rel: &Path) -> Result<()> {
        let name = rel
            .file_name()
            .ok_or_else(|| BuildError::Snapshot(format!("Cannot whiteout {}", rel.display())))?;
        let marker = format!("{}{}", WHITEOUT_PREFIX, name.to_string_lossy());
        let marker_path = match rel.parent() {
            Some(parent) => parent.join(marker),
            None => PathBuf::from(marker),
        };

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_size(0);
        self.builder
            .append_data(&mut header, &marker_path, std::io::empty())
            .map_err(|e| append_error(&marker_path, e))?;
        self.entries.push(LayerEntry {
            path: marker_path,
            kind: LayerEntryKind::Whiteout,
        });
        Ok(())
    }

    /// Finalize the archive and return the artifact.
    pub fn finish(self) -> Result<LayerArtifact> {
        let stream = self
            .builder
            .into_inner()
            .map_err(|e| BuildError::Snapshot(format!("Failed to finalize layer: {}", e)))?;
        let (encoder, diff_id, _) = stream.finalize();
        let blob = encoder
            .finish()
            .map_err(|e| BuildError::Snapshot(format!("Failed to compress layer: {}", e)))?;
        let (mut file, digest, size) = blob.finalize();
        file.flush()?;

        Ok(LayerArtifact {
            path: self.path,
            digest,
            diff_id,
            size,
            media_type: MEDIA_TYPE_LAYER_GZIP.to_string(),
            entries: self.entries,
        })
    }
}

fn append_error(rel: &Path, e: std::io::Error) -> BuildError {
    BuildError::Snapshot(format!(
        "Failed to add {} to layer: {}",
        rel.display(),
        e
    ))
}

/// Compute SHA256 digest of a file.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).map_err(|e| {
        BuildError::Snapshot(format!(
            "Failed to read file for hashing {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Compute SHA256 digest of raw bytes.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
