//! Instruction model and execution.
//!
//! - [`dockerfile`]: build file parsing into typed instructions
//! - [`args`]: build arguments and variable substitution
//! - [`context`]: build context access and `.dockerignore`
//! - [`commands`]: native and cache-backed runtime commands
//! - [`engine`]: the sequential build pass

pub mod args;
pub mod commands;
pub mod context;
pub mod dockerfile;
pub mod engine;
pub mod fileops;
pub mod ownership;
pub mod remote;

pub use args::BuildArgs;
pub use commands::{BuildCommand, CommandEnv};
pub use context::FileContext;
pub use dockerfile::{CommandForm, Dockerfile, Instruction};
pub use engine::{build, BuildConfig, BuildResult};
