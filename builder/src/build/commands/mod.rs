//! Runtime commands, one per instruction.
//!
//! Every command exposes the same capability set to the engine. A command
//! whose output is cacheable can hand back a cache-backed replacement that
//! applies a stored layer instead of running the instruction.

mod add;
mod cached;
mod copy;
mod metadata;
mod run;

pub use add::AddCommand;
pub use cached::CachedCommand;
pub use copy::CopyCommand;
pub use metadata::MetadataCommand;
pub use run::RunCommand;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::config::{BuildOptions, RunIsolation};
use kiln_core::error::Result;

use super::args::BuildArgs;
use super::context::FileContext;
use super::dockerfile::{CommandForm, Instruction};
use crate::cache::CacheEntry;
use crate::oci::ImageConfig;
use crate::snapshot::LayerArtifact;

const DEFAULT_SHELL: &[&str] = &["/bin/sh", "-c"];

/// One executable build step. `Display` renders the history string.
#[async_trait]
pub trait BuildCommand: fmt::Display + Send + Sync {
    /// Apply the step to the filesystem and/or `config`.
    async fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()>;

    /// Absolute paths written by the last `execute`; `None` means the
    /// footprint is unknown and the whole root must be diffed.
    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>>;

    /// Context-relative files this step reads, for cache keys.
    fn files_used_from_context(
        &self,
        _config: &ImageConfig,
        _args: &BuildArgs,
    ) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    /// Only `config` changes; never snapshotted.
    fn metadata_only(&self) -> bool;

    /// Needs the base image's filesystem in place.
    fn requires_unpacked_fs(&self) -> bool;

    /// Output may be stored in and served from the layer cache.
    fn should_cache_output(&self) -> bool {
        false
    }

    /// Replacement that applies `entry` instead of running this step.
    fn cache_command(&self, _entry: CacheEntry) -> Option<Box<dyn BuildCommand>> {
        None
    }

    /// Layer served from the cache, for cache-backed commands.
    fn cached_layer(&self) -> Option<&LayerArtifact> {
        None
    }
}

/// Build-wide inputs shared by every command.
#[derive(Debug, Clone)]
pub struct CommandEnv {
    /// Root filesystem the image is assembled in
    pub root: PathBuf,
    pub context: Arc<FileContext>,
    pub isolation: RunIsolation,
    pub cache_copy_layers: bool,
    pub cache_run_layers: bool,
}

impl CommandEnv {
    pub fn new(root: PathBuf, context: Arc<FileContext>, options: &BuildOptions) -> Self {
        Self {
            root,
            context,
            isolation: options.run_isolation,
            cache_copy_layers: options.cache.cache_copy_layers,
            cache_run_layers: options.cache.cache_run_layers,
        }
    }
}

/// Wrap an instruction in its runtime command.
pub fn from_instruction(instruction: &Instruction, env: &CommandEnv) -> Box<dyn BuildCommand> {
    match instruction {
        Instruction::Run { command } => Box::new(RunCommand::new(command.clone(), env)),
        Instruction::Copy {
            sources,
            dest,
            chown,
            chmod,
        } => Box::new(CopyCommand::new(
            sources.clone(),
            dest.clone(),
            chown.clone(),
            chmod.clone(),
            env,
        )),
        Instruction::Add {
            sources,
            dest,
            chown,
            chmod,
        } => Box::new(AddCommand::new(
            sources.clone(),
            dest.clone(),
            chown.clone(),
            chmod.clone(),
            env,
        )),
        other => Box::new(MetadataCommand::new(other.clone())),
    }
}

/// Argument vector for a command form; shell form runs through the image
/// shell (default `/bin/sh -c`).
pub(crate) fn command_argv(form: &CommandForm, config: &ImageConfig) -> Vec<String> {
    match form {
        CommandForm::Exec(argv) => argv.clone(),
        CommandForm::Shell(cmd) => {
            let mut argv: Vec<String> = match &config.shell {
                Some(shell) if !shell.is_empty() => shell.clone(),
                _ => DEFAULT_SHELL.iter().map(|s| s.to_string()).collect(),
            };
            argv.push(cmd.clone());
            argv
        }
    }
}
