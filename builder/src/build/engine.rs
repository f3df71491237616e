//! Build engine.
//!
//! Drives one sequential pass over the instructions of a build file:
//!
//! 1. Resolve the base image and unpack it when a step needs its filesystem
//! 2. For each step, consult the layer cache, execute the native or
//!    cache-backed command, snapshot its footprint and record history
//! 3. Write the OCI layout and push it once every step has succeeded

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kiln_core::config::BuildOptions;
use kiln_core::error::{BuildError, Result};

use super::args::{expand, BuildArgs};
use super::commands::{from_instruction, BuildCommand, CommandEnv};
use super::context::FileContext;
use super::dockerfile::Dockerfile;
use crate::cache::{CacheEntry, CacheKey, ConfigDelta, LayerCache};
use crate::oci::layout::blob_path;
use crate::oci::{
    extract_layer, write_layout, HistoryEntry, ImageConfig, ImageReference, Keychain,
    LayerDescriptor, OciImage, RegistryPuller, RegistryPusher,
};
use crate::snapshot::{LayerArtifact, Snapshot, Snapshotter};

/// Base image name that starts from an empty filesystem.
pub const SCRATCH: &str = "scratch";

/// Prefix selecting a base image from a local OCI layout.
pub const OCI_LAYOUT_PREFIX: &str = "oci:";

/// Configuration for a build operation.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Build context directory
    pub context_dir: PathBuf,
    /// Build file (absolute, or relative to the working directory)
    pub dockerfile_path: PathBuf,
    /// Registry reference to push to
    pub destination: Option<String>,
    /// Directory receiving the OCI image layout
    pub output_dir: PathBuf,
    /// `--build-arg` overrides
    pub build_args: BTreeMap<String, String>,
    pub options: BuildOptions,
}

/// Result of a successful build.
#[derive(Debug)]
pub struct BuildResult {
    /// Manifest digest with "sha256:" prefix
    pub manifest_digest: String,
    /// Config digest with "sha256:" prefix
    pub config_digest: String,
    /// Number of layers inherited from the base image
    pub base_layers: usize,
    /// Layers produced by this build, blobs inside `output_dir`
    pub layers: Vec<LayerArtifact>,
    /// Final image configuration
    pub config: ImageConfig,
    /// Steps served from the layer cache
    pub cache_hits: usize,
    /// Reference pushed to, if any
    pub pushed: Option<String>,
}

impl BuildResult {
    pub fn layer_count(&self) -> usize {
        self.base_layers + self.layers.len()
    }
}

/// Mutable state threaded through the steps of one build.
struct BuildState {
    config: ImageConfig,
    args: BuildArgs,
    baseline: Snapshot,
    snapshotter: Snapshotter,
    cache: Option<LayerCache>,
    context: Arc<FileContext>,
    single_snapshot: bool,
    layers: Vec<LayerArtifact>,
    cache_hits: usize,
    /// History index of the last filesystem step in single-snapshot mode
    last_fs_step: Option<usize>,
}

/// Execute a full image build.
pub async fn build(config: BuildConfig) -> Result<BuildResult> {
    let options = &config.options;
    options.validate()?;

    let dockerfile = Dockerfile::from_file(&config.dockerfile_path)?;
    let context = Arc::new(FileContext::new(&config.context_dir)?);
    tracing::info!(
        dockerfile = %config.dockerfile_path.display(),
        context = %context.root().display(),
        steps = dockerfile.instructions.len(),
        "Starting build"
    );

    let work_dir = tempfile::Builder::new()
        .prefix("kiln-build-")
        .tempdir()
        .map_err(|e| BuildError::Config(format!("Failed to create work directory: {}", e)))?;
    let layers_dir = work_dir.path().join("layers");
    std::fs::create_dir_all(&layers_dir)?;
    std::fs::create_dir_all(&options.root_dir).map_err(|e| {
        BuildError::Config(format!(
            "Failed to create root directory {}: {}",
            options.root_dir.display(),
            e
        ))
    })?;

    let keychain = Arc::new(Keychain::from_helpers(&options.credential_helpers));

    // Pre-FROM ARGs are only in scope for the base reference
    let mut from_args = BuildArgs::new(config.build_args.clone());
    for (name, default) in &dockerfile.args_before_from {
        let default = match default {
            Some(value) => Some(expand(value, &from_args.visible())?),
            None => None,
        };
        from_args.declare(name, default);
    }
    let base_ref = expand(&dockerfile.base, &from_args.visible())?;
    let base = load_base(&base_ref, work_dir.path(), &keychain, options.insecure_registry).await?;
    let (base_config, base_layers) = match base {
        Some(image) => image.into_parts(),
        None => (ImageConfig::scratch(), Vec::new()),
    };

    let env = CommandEnv::new(options.root_dir.clone(), context.clone(), options);
    let commands: Vec<Box<dyn BuildCommand>> = dockerfile
        .instructions
        .iter()
        .map(|instruction| from_instruction(instruction, &env))
        .collect();

    let needs_fs = commands.iter().any(|c| c.requires_unpacked_fs())
        || (base_config.user.is_some() && commands.iter().any(|c| !c.metadata_only()));
    if needs_fs {
        for layer in &base_layers {
            tracing::debug!(layer = %layer.prefixed_digest(), "Unpacking base layer");
            extract_layer(&layer.path, &options.root_dir)?;
        }
        tracing::info!(layers = base_layers.len(), "Base filesystem unpacked");
    } else {
        tracing::info!("No step needs the base filesystem, skipping unpack");
    }

    let mut snapshotter = Snapshotter::new(
        &options.root_dir,
        &layers_dir,
        &options.ignore_paths,
        options.reproducible,
    );
    for path in [work_dir.path(), config.output_dir.as_path(), context.root()] {
        snapshotter.ignore_host_path(path);
    }
    if let Some(dir) = &options.cache.dir {
        snapshotter.ignore_host_path(dir);
    }
    let baseline = snapshotter.init()?;

    let cache = if options.caching_enabled() {
        LayerCache::from_options(
            &options.cache,
            keychain.clone(),
            options.insecure_registry,
            work_dir.path(),
        )?
    } else {
        if options.cache.enabled {
            tracing::warn!("Layer cache is disabled in single-snapshot mode");
        }
        None
    };

    let mut state = BuildState {
        config: base_config,
        args: BuildArgs::new(config.build_args.clone()),
        baseline,
        snapshotter,
        cache,
        context,
        single_snapshot: options.single_snapshot,
        layers: Vec::new(),
        cache_hits: 0,
        last_fs_step: None,
    };

    let total = commands.len();
    for (index, command) in commands.into_iter().enumerate() {
        let step = index + 1;
        let rendered = command.to_string();
        tracing::info!(step, total, instruction = %rendered, "Executing step");
        state
            .run_step(command)
            .await
            .map_err(|e| e.at_step(step, rendered))?;
    }

    if state.single_snapshot {
        state.take_final_snapshot()?;
    }

    for name in state.args.unused_overrides() {
        if !from_args.is_declared(name) {
            tracing::warn!(arg = name, "Build argument was not consumed by any ARG");
        }
    }

    let BuildState {
        config: image_config,
        layers,
        cache_hits,
        ..
    } = state;

    let mut descriptors: Vec<LayerDescriptor> = base_layers;
    descriptors.extend(layers.iter().map(LayerDescriptor::from));
    let diff_ids: Vec<String> = descriptors.iter().map(|d| d.prefixed_diff_id()).collect();
    let config_bytes = image_config.to_json(&diff_ids, options.reproducible)?;
    let base_count = descriptors.len() - layers.len();

    let info = write_layout(&config.output_dir, &config_bytes, &descriptors, None)?;
    tracing::info!(
        output = %config.output_dir.display(),
        manifest = %info.manifest_digest,
        layers = descriptors.len(),
        "Image layout written"
    );

    let pushed = match &config.destination {
        Some(destination) if !options.no_push => {
            let reference = ImageReference::parse(destination)?;
            let auth = keychain.resolve(&reference.registry).await;
            RegistryPusher::new(auth, options.insecure_registry)
                .push(&reference, &config.output_dir)
                .await?;
            Some(reference.to_string())
        }
        Some(destination) => {
            tracing::info!(destination = %destination, "Skipping push");
            None
        }
        None => None,
    };

    // Point layer artifacts at the persisted blobs
    let layers = layers
        .into_iter()
        .map(|mut layer| {
            layer.path = blob_path(&config.output_dir, &layer.digest);
            layer
        })
        .collect();

    Ok(BuildResult {
        manifest_digest: info.manifest_digest,
        config_digest: info.config_digest,
        base_layers: base_count,
        layers,
        config: image_config,
        cache_hits,
        pushed,
    })
}

/// Load the base image: `None` for scratch.
async fn load_base(
    reference: &str,
    work_dir: &Path,
    keychain: &Keychain,
    insecure: bool,
) -> Result<Option<OciImage>> {
    if reference == SCRATCH {
        tracing::info!("Building from scratch");
        return Ok(None);
    }
    if let Some(path) = reference.strip_prefix(OCI_LAYOUT_PREFIX) {
        tracing::info!(path, "Loading base image from OCI layout");
        return OciImage::from_path(path).map(Some);
    }

    let reference = ImageReference::parse(reference)?;
    let auth = keychain.resolve(&reference.registry).await;
    let dir = RegistryPuller::new(auth, insecure)
        .pull(&reference, &work_dir.join("base"))
        .await?;
    OciImage::from_path(dir).map(Some)
}

impl BuildState {
    async fn run_step(&mut self, mut command: Box<dyn BuildCommand>) -> Result<()> {
        let created_by = command.to_string();

        let mut miss_key = None;
        if let Some(cache) = &self.cache {
            if command.should_cache_output() {
                let key = self.cache_key(command.as_ref())?;
                match cache.lookup(&key).await? {
                    Some(entry) => {
                        if let Some(cached) = command.cache_command(entry) {
                            command = cached;
                            self.cache_hits += 1;
                        }
                    }
                    None => miss_key = Some(key),
                }
            }
        }

        let before = self.config.clone();
        command.execute(&mut self.config, &mut self.args).await?;

        if command.metadata_only() {
            self.config.history.push(HistoryEntry::new(created_by, true));
            return Ok(());
        }

        if self.single_snapshot {
            self.last_fs_step = Some(self.config.history.len());
            self.config.history.push(HistoryEntry::new(created_by, true));
            return Ok(());
        }

        let footprint = command.files_to_snapshot();
        let baseline = std::mem::take(&mut self.baseline);
        let layer = match command.cached_layer() {
            Some(cached) => {
                self.baseline = self.snapshotter.refresh(baseline, footprint.as_deref())?;
                Some(cached.clone())
            }
            None => {
                let (next, layer) = self
                    .snapshotter
                    .take_snapshot(baseline, footprint.as_deref())?;
                self.baseline = next;
                layer
            }
        };

        if let (Some(key), Some(cache), Some(layer)) = (miss_key, &self.cache, &layer) {
            let entry = CacheEntry {
                layer: layer.clone(),
                delta: ConfigDelta::between(&before, &self.config),
            };
            cache.store(&key, &entry).await?;
        }

        self.config
            .history
            .push(HistoryEntry::new(created_by, layer.is_none()));
        if let Some(layer) = layer {
            tracing::info!(
                layer = %layer.prefixed_digest(),
                entries = layer.entries.len(),
                "Layer committed"
            );
            self.layers.push(layer);
        }
        Ok(())
    }

    fn cache_key(&self, command: &dyn BuildCommand) -> Result<CacheKey> {
        let files = command
            .files_used_from_context(&self.config, &self.args)?
            .into_iter()
            .map(|path| {
                let digest = self.context.hash_path(&path)?;
                Ok((path, digest))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CacheKey::derive(
            &command.to_string(),
            &self.args.replacement_envs(&self.config),
            &files,
        ))
    }

    /// Diff the whole root once after the last step.
    fn take_final_snapshot(&mut self) -> Result<()> {
        let baseline = std::mem::take(&mut self.baseline);
        let (next, layer) = self.snapshotter.take_snapshot(baseline, None)?;
        self.baseline = next;

        if let Some(layer) = layer {
            if let Some(entry) = self.last_fs_step.and_then(|i| self.config.history.get_mut(i)) {
                entry.empty_layer = false;
            }
            tracing::info!(layer = %layer.prefixed_digest(), "Single snapshot committed");
            self.layers.push(layer);
        }
        Ok(())
    }
}
