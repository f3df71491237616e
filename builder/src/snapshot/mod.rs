//! Filesystem snapshotting.
//!
//! A [`Snapshot`] records every path under the build root. The engine owns
//! the live snapshot and hands it to [`Snapshotter::take_snapshot`], which
//! diffs the filesystem against it, writes the changes as a layer, and
//! returns the replacement baseline.

pub mod layer;

pub use layer::{
    LayerArtifact, LayerEntry, LayerEntryKind, LayerWriter, MEDIA_TYPE_LAYER_GZIP,
    MEDIA_TYPE_LAYER_TAR, OPAQUE_WHITEOUT, WHITEOUT_PREFIX,
};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use kiln_core::error::{BuildError, Result};

/// File type recorded in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink(PathBuf),
    Fifo,
    /// Sockets and device nodes
    Other,
}

/// Recorded state of a single path.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub kind: FileKind,
    /// Permission bits including setuid/setgid/sticky
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub mtime: i64,
    pub mtime_nsec: i64,
    pub ctime: i64,
    pub ctime_nsec: i64,
    pub dev: u64,
    pub ino: u64,
    pub nlink: u64,
    /// Content hash of regular files
    pub hash: Option<String>,
}

impl FileRecord {
    /// Stat a path without following symlinks. Returns `None` if it is gone.
    pub fn stat(path: &Path) -> Result<Option<Self>> {
        let metadata = match std::fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(BuildError::Snapshot(format!(
                    "Failed to stat {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let file_type = metadata.file_type();
        let kind = if file_type.is_symlink() {
            let target = std::fs::read_link(path).map_err(|e| {
                BuildError::Snapshot(format!(
                    "Failed to read link {}: {}",
                    path.display(),
                    e
                ))
            })?;
            FileKind::Symlink(target)
        } else if file_type.is_dir() {
            FileKind::Directory
        } else if file_type.is_file() {
            FileKind::Regular
        } else if metadata.mode() & libc::S_IFMT == libc::S_IFIFO {
            FileKind::Fifo
        } else {
            FileKind::Other
        };

        Ok(Some(Self {
            kind,
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.len(),
            mtime: metadata.mtime(),
            mtime_nsec: metadata.mtime_nsec(),
            ctime: metadata.ctime(),
            ctime_nsec: metadata.ctime_nsec(),
            dev: metadata.dev(),
            ino: metadata.ino(),
            nlink: metadata.nlink(),
            hash: None,
        }))
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Whether the stat data guarantees the content is unchanged.
    fn same_stat(&self, other: &FileRecord) -> bool {
        self.size == other.size
            && self.mtime == other.mtime
            && self.mtime_nsec == other.mtime_nsec
            && self.ctime == other.ctime
            && self.ctime_nsec == other.ctime_nsec
            && self.dev == other.dev
            && self.ino == other.ino
    }

    /// Whether this record differs from `before` in type, content, mode or ownership.
    pub fn differs(&self, before: &FileRecord) -> bool {
        self.kind != before.kind
            || self.mode != before.mode
            || self.uid != before.uid
            || self.gid != before.gid
            || (self.kind == FileKind::Regular && self.hash != before.hash)
    }
}

/// Point-in-time record of every path under the build root.
///
/// Keys are relative to the root. Ordering is component-wise, so the
/// descendants of a directory follow it contiguously.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    files: BTreeMap<PathBuf, FileRecord>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<&FileRecord> {
        self.files.get(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.files.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.keys()
    }

    /// Every recorded path strictly below `dir`. An empty `dir` means the root.
    pub fn descendants<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = &'a PathBuf> + 'a {
        let start = if dir.as_os_str().is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(dir.to_path_buf())
        };
        self.files
            .range((start, Bound::Unbounded))
            .map(|(p, _)| p)
            .take_while(move |p| p.starts_with(dir))
    }
}

/// Result of scanning a set of candidate paths.
#[derive(Debug, Default)]
struct Scan {
    /// Paths observed present, with hashes resolved
    present: BTreeMap<PathBuf, FileRecord>,
    /// Baseline paths observed absent
    removed: BTreeSet<PathBuf>,
}

impl Scan {
    /// Apply this scan to the baseline, producing the new cumulative state.
    fn apply(&self, mut baseline: Snapshot) -> Snapshot {
        for path in &self.removed {
            baseline.files.remove(path);
        }
        for (path, record) in &self.present {
            baseline.files.insert(path.clone(), record.clone());
        }
        baseline
    }
}

/// Computes filesystem diffs under a root and serializes them as layers.
pub struct Snapshotter {
    root: PathBuf,
    ignored: Vec<PathBuf>,
    layer_dir: PathBuf,
    reproducible: bool,
    layers_written: usize,
}

impl Snapshotter {
    /// Create a snapshotter for `root` writing layer blobs into `layer_dir`.
    ///
    /// `ignore_paths` are image-absolute paths (e.g. `/proc`) never recorded.
    pub fn new(root: &Path, layer_dir: &Path, ignore_paths: &[PathBuf], reproducible: bool) -> Self {
        let ignored = ignore_paths
            .iter()
            .map(|p| p.strip_prefix("/").unwrap_or(p).to_path_buf())
            .filter(|p| !p.as_os_str().is_empty())
            .collect();
        Self {
            root: root.to_path_buf(),
            ignored,
            layer_dir: layer_dir.to_path_buf(),
            reproducible,
            layers_written: 0,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Exclude an additional host path (e.g. an output directory under the root).
    pub fn ignore_host_path(&mut self, path: &Path) {
        if let Ok(rel) = path.strip_prefix(&self.root) {
            if !rel.as_os_str().is_empty() {
                self.ignored.push(rel.to_path_buf());
            }
        }
    }

    fn is_ignored(&self, rel: &Path) -> bool {
        self.ignored.iter().any(|i| rel.starts_with(i))
    }

    /// Record the full tree as the initial baseline.
    pub fn init(&self) -> Result<Snapshot> {
        let scan = self.scan(&Snapshot::default(), None)?;
        tracing::debug!(files = scan.present.len(), "Initial snapshot taken");
        Ok(scan.apply(Snapshot::default()))
    }

    /// Fold the current state of `footprint` into the baseline without
    /// producing a layer. Used after a cached layer was applied.
    pub fn refresh(&self, baseline: Snapshot, footprint: Option<&[PathBuf]>) -> Result<Snapshot> {
        let scan = self.scan(&baseline, footprint)?;
        Ok(scan.apply(baseline))
    }

    /// Diff the filesystem against `baseline` and write the changes as a layer.
    ///
    /// `footprint` holds the absolute paths an instruction touched; `None`
    /// walks the whole root. Returns the new baseline and the layer, which is
    /// `None` when nothing changed.
    pub fn take_snapshot(
        &mut self,
        baseline: Snapshot,
        footprint: Option<&[PathBuf]>,
    ) -> Result<(Snapshot, Option<LayerArtifact>)> {
        let scan = self.scan(&baseline, footprint)?;

        let changed: BTreeSet<PathBuf> = scan
            .present
            .iter()
            .filter(|(path, record)| match baseline.get(path) {
                None => true,
                Some(before) => record.differs(before),
            })
            .map(|(path, _)| path.clone())
            .collect();

        let whiteouts: Vec<PathBuf> = scan
            .removed
            .iter()
            .filter(|path| self.needs_whiteout(path, &scan))
            .cloned()
            .collect();

        if changed.is_empty() && whiteouts.is_empty() {
            tracing::debug!("No files changed, skipping layer");
            return Ok((scan.apply(baseline), None));
        }

        // Parent directories travel with their children
        let mut entries = changed.clone();
        for path in &changed {
            for ancestor in path.ancestors().skip(1) {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                if scan.present.contains_key(ancestor) || baseline.contains(ancestor) {
                    entries.insert(ancestor.to_path_buf());
                }
            }
        }

        let next = scan.apply(baseline);

        // Inodes already reachable through untouched paths
        let mut links: HashMap<(u64, u64), PathBuf> = HashMap::new();
        for path in next.paths() {
            if let Some(record) = next.get(path) {
                if record.kind == FileKind::Regular && record.nlink > 1 && !changed.contains(path) {
                    links.entry((record.dev, record.ino)).or_insert_with(|| path.clone());
                }
            }
        }

        self.layers_written += 1;
        let layer_path = self
            .layer_dir
            .join(format!("layer-{:04}.tar.gz", self.layers_written));
        let mut writer = LayerWriter::create(&layer_path, self.reproducible)?;

        for path in &whiteouts {
            writer.append_whiteout(path)?;
        }
        for path in &entries {
            let record = match next.get(path) {
                Some(r) => r,
                None => continue,
            };
            if record.kind == FileKind::Regular && record.nlink > 1 {
                if let Some(target) = links.get(&(record.dev, record.ino)) {
                    if target != path {
                        writer.append_hardlink(path, target, record)?;
                        continue;
                    }
                }
                links.insert((record.dev, record.ino), path.clone());
            }
            writer.append(&self.root, path, record)?;
        }

        let artifact = writer.finish()?;
        tracing::debug!(
            layer = %artifact.prefixed_digest(),
            entries = artifact.entries.len(),
            whiteouts = whiteouts.len(),
            "Layer written"
        );
        Ok((next, Some(artifact)))
    }

    /// A removed path gets its own whiteout unless an ancestor already
    /// accounts for it (removed, or replaced by a non-directory).
    fn needs_whiteout(&self, path: &Path, scan: &Scan) -> bool {
        for ancestor in path.ancestors().skip(1) {
            if ancestor.as_os_str().is_empty() {
                break;
            }
            if scan.removed.contains(ancestor) {
                return false;
            }
            if let Some(record) = scan.present.get(ancestor) {
                if !record.is_dir() {
                    return false;
                }
            }
        }
        true
    }

    fn relativize(&self, path: &Path) -> Option<PathBuf> {
        let rel = if path.is_absolute() {
            path.strip_prefix(&self.root).ok()?.to_path_buf()
        } else {
            path.to_path_buf()
        };
        Some(rel)
    }

    fn scan(&self, baseline: &Snapshot, footprint: Option<&[PathBuf]>) -> Result<Scan> {
        let candidates: BTreeSet<PathBuf> = match footprint {
            None => std::iter::once(PathBuf::new()).collect(),
            Some(paths) => paths.iter().filter_map(|p| self.relativize(p)).collect(),
        };

        let mut scan = Scan::default();
        let mut walked: Vec<PathBuf> = Vec::new();

        for rel in candidates {
            if rel.as_os_str().is_empty() {
                self.walk(&rel, baseline, &mut scan)?;
                walked.push(rel);
                continue;
            }
            if self.is_ignored(&rel) {
                continue;
            }

            for ancestor in rel.ancestors().skip(1) {
                if ancestor.as_os_str().is_empty() {
                    break;
                }
                if !scan.present.contains_key(ancestor) {
                    if let Some(record) = self.record(ancestor, baseline)? {
                        scan.present.insert(ancestor.to_path_buf(), record);
                    }
                }
            }

            match self.record(&rel, baseline)? {
                None => {
                    if baseline.contains(&rel) {
                        scan.removed.insert(rel.clone());
                    }
                    scan.removed.extend(baseline.descendants(&rel).cloned());
                }
                Some(record) => {
                    let is_dir = record.is_dir();
                    scan.present.insert(rel.clone(), record);
                    if is_dir {
                        self.walk(&rel, baseline, &mut scan)?;
                    }
                    walked.push(rel);
                }
            }
        }

        // Baseline entries under a scanned path that were not seen are gone
        for dir in &walked {
            for path in baseline.descendants(dir) {
                if !scan.present.contains_key(path) {
                    scan.removed.insert(path.clone());
                }
            }
        }

        Ok(scan)
    }

    fn walk(&self, dir: &Path, baseline: &Snapshot, scan: &mut Scan) -> Result<()> {
        let full = self.root.join(dir);
        let read_dir = std::fs::read_dir(&full).map_err(|e| {
            BuildError::Snapshot(format!(
                "Failed to read directory {}: {}",
                full.display(),
                e
            ))
        })?;

        for entry in read_dir {
            let entry = entry.map_err(|e| {
                BuildError::Snapshot(format!("Failed to read directory entry: {}", e))
            })?;
            let rel = dir.join(entry.file_name());
            if self.is_ignored(&rel) {
                continue;
            }
            if let Some(record) = self.record(&rel, baseline)? {
                let is_dir = record.is_dir();
                scan.present.insert(rel.clone(), record);
                if is_dir {
                    self.walk(&rel, baseline, scan)?;
                }
            }
        }
        Ok(())
    }

    /// Stat a path and resolve its content hash, reusing the baseline hash
    /// when the stat data is unchanged.
    fn record(&self, rel: &Path, baseline: &Snapshot) -> Result<Option<FileRecord>> {
        let full = self.root.join(rel);
        let mut record = match FileRecord::stat(&full)? {
            Some(r) => r,
            None => return Ok(None),
        };
        if record.kind == FileKind::Regular {
            let reusable = baseline
                .get(rel)
                .filter(|before| before.kind == FileKind::Regular && before.same_stat(&record))
                .and_then(|before| before.hash.clone());
            record.hash = match reusable {
                Some(hash) => Some(hash),
                None => Some(layer::sha256_file(&full)?),
            };
        }
        Ok(Some(record))
    }
}
