//! Kiln Core - shared types for the daemonless image builder
//!
//! Error taxonomy, build options and log format selection used by the
//! builder and the CLI.

pub mod config;
pub mod error;
pub mod log;

// Re-export commonly used types
pub use config::{BuildOptions, CacheOptions, RunIsolation};
pub use error::{BuildError, Result};
pub use log::LogFormat;

/// Kiln version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
