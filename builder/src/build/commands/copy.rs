//! COPY: place build-context files in the image.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::error::{BuildError, Result};

use super::{BuildCommand, CachedCommand, CommandEnv};
use crate::build::args::{expand, expand_all, BuildArgs};
use crate::build::context::FileContext;
use crate::build::fileops::{copy_from_context, destination_is_dir, CopyOptions};
use crate::build::ownership::{resolve_chmod, resolve_chown};
use crate::cache::CacheEntry;
use crate::oci::ImageConfig;

pub struct CopyCommand {
    sources: Vec<String>,
    dest: String,
    chown: Option<String>,
    chmod: Option<String>,
    context: Arc<FileContext>,
    root: PathBuf,
    cache_output: bool,
    snapshot_files: Vec<PathBuf>,
}

impl CopyCommand {
    pub fn new(
        sources: Vec<String>,
        dest: String,
        chown: Option<String>,
        chmod: Option<String>,
        env: &CommandEnv,
    ) -> Self {
        Self {
            sources,
            dest,
            chown,
            chmod,
            context: env.context.clone(),
            root: env.root.clone(),
            cache_output: env.cache_copy_layers,
            snapshot_files: Vec::new(),
        }
    }
}

/// Expand and glob context sources. A pattern matching nothing is an error.
pub(super) fn resolve_sources(
    context: &FileContext,
    sources: &[String],
    envs: &BTreeMap<String, String>,
) -> Result<Vec<PathBuf>> {
    let mut resolved = Vec::new();
    for source in expand_all(sources, envs)? {
        let matches = context.glob(&source)?;
        if matches.is_empty() {
            return Err(BuildError::Resolution(format!(
                "no source files match '{}' in the build context",
                source
            )));
        }
        resolved.extend(matches);
    }
    Ok(resolved)
}

/// Ownership and mode for files written by COPY/ADD.
pub(super) fn copy_options(
    chown: Option<&str>,
    chmod: Option<&str>,
    config: &ImageConfig,
    root: &Path,
    envs: &BTreeMap<String, String>,
) -> Result<CopyOptions> {
    Ok(CopyOptions {
        owner: resolve_chown(chown, config.user.as_deref(), root, envs)?,
        mode: resolve_chmod(chmod, envs)?,
    })
}

impl fmt::Display for CopyCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "COPY")?;
        if let Some(chown) = &self.chown {
            write!(f, " --chown={}", chown)?;
        }
        if let Some(chmod) = &self.chmod {
            write!(f, " --chmod={}", chmod)?;
        }
        write!(f, " {} {}", self.sources.join(" "), self.dest)
    }
}

#[async_trait]
impl BuildCommand for CopyCommand {
    async fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        let envs = args.replacement_envs(config);
        let sources = resolve_sources(&self.context, &self.sources, &envs)?;
        let dest = expand(&self.dest, &envs)?;
        let options = copy_options(
            self.chown.as_deref(),
            self.chmod.as_deref(),
            config,
            &self.root,
            &envs,
        )?;

        tracing::info!(sources = sources.len(), dest = %dest, "Copying from context");
        self.snapshot_files = copy_from_context(
            &self.context,
            &sources,
            &dest,
            destination_is_dir(&dest, sources.len()),
            config.working_dir_or_root(),
            &self.root,
            &options,
        )?;
        Ok(())
    }

    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>> {
        Some(self.snapshot_files.clone())
    }

    fn files_used_from_context(
        &self,
        config: &ImageConfig,
        args: &BuildArgs,
    ) -> Result<Vec<PathBuf>> {
        let envs = args.replacement_envs(config);
        let mut sources = resolve_sources(&self.context, &self.sources, &envs)?;
        sources.sort();
        sources.dedup();
        Ok(sources)
    }

    fn metadata_only(&self) -> bool {
        false
    }

    fn requires_unpacked_fs(&self) -> bool {
        self.chown.is_some()
    }

    fn should_cache_output(&self) -> bool {
        self.cache_output
    }

    fn cache_command(&self, entry: CacheEntry) -> Option<Box<dyn BuildCommand>> {
        Some(Box::new(CachedCommand::new(
            self.to_string(),
            entry,
            self.root.clone(),
        )))
    }
}
