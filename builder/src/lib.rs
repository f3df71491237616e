//! Kiln Builder - daemonless OCI image build engine.
//!
//! Executes build-file instructions against a root filesystem, snapshots
//! each step into a layer, serves repeated steps from a layer cache and
//! writes or pushes the resulting OCI image.

#![allow(clippy::result_large_err)]

pub mod build;
pub mod cache;
pub mod oci;
pub mod snapshot;

// Re-export common types
pub use build::{build, BuildConfig, BuildResult, Dockerfile, Instruction};
pub use cache::{CacheKey, CacheStore, LayerCache, LocalCacheStore, RegistryCacheStore};
pub use oci::{ImageConfig, ImageReference, Keychain, OciImage, RegistryAuth};
pub use snapshot::{LayerArtifact, Snapshot, Snapshotter};

/// Kiln builder version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
