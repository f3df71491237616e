//! Cache-backed replacement for RUN, COPY and ADD.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use kiln_core::error::Result;

use super::BuildCommand;
use crate::build::args::BuildArgs;
use crate::cache::CacheEntry;
use crate::oci::{extract_layer, ImageConfig};
use crate::snapshot::LayerArtifact;

/// Applies a cached layer and replays its config delta. Renders as the
/// instruction it stands in for.
pub struct CachedCommand {
    instruction: String,
    entry: CacheEntry,
    root: PathBuf,
    extracted: Vec<PathBuf>,
}

impl CachedCommand {
    pub fn new(instruction: String, entry: CacheEntry, root: PathBuf) -> Self {
        Self {
            instruction,
            entry,
            root,
            extracted: Vec::new(),
        }
    }
}

impl fmt::Display for CachedCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.instruction)
    }
}

#[async_trait]
impl BuildCommand for CachedCommand {
    async fn execute(&mut self, config: &mut ImageConfig, _args: &mut BuildArgs) -> Result<()> {
        tracing::info!(
            instruction = %self.instruction,
            layer = %self.entry.layer.prefixed_digest(),
            "Using cached layer"
        );
        self.extracted = extract_layer(&self.entry.layer.path, &self.root)?;
        self.entry.delta.apply(config);
        Ok(())
    }

    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>> {
        Some(self.extracted.clone())
    }

    fn metadata_only(&self) -> bool {
        false
    }

    fn requires_unpacked_fs(&self) -> bool {
        true
    }

    fn cached_layer(&self) -> Option<&LayerArtifact> {
        Some(&self.entry.layer)
    }
}
