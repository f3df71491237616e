//! OCI image plumbing.
//!
//! - Image configuration and base image loading from OCI layouts
//! - Layout writing for build output and local cache entries
//! - Whiteout-aware layer extraction
//! - Registry pull/push and credential resolution

pub mod credentials;
pub mod image;
pub mod keychain;
pub mod layers;
pub mod layout;
pub mod reference;
pub mod registry;

pub use credentials::CredentialStore;
pub use image::{HistoryEntry, ImageConfig, OciImage};
pub use keychain::{CredentialSource, Keychain};
pub use layers::{extract_layer, unpack_archive};
pub use layout::{write_layout, LayerDescriptor, LayoutInfo};
pub use reference::ImageReference;
pub use registry::{PushResult, RegistryAuth, RegistryPuller, RegistryPusher};
