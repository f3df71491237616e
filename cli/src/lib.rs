//! Kiln CLI - daemonless OCI image builder.

pub mod commands;
pub mod output;
