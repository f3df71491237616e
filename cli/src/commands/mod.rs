//! CLI command definitions and dispatch.

pub mod build;
pub mod version;

use clap::{Parser, Subcommand};
use kiln_core::LogFormat;

/// Kiln - build OCI images from a Dockerfile without a daemon.
#[derive(Parser)]
#[command(name = "kiln", version, about)]
pub struct Cli {
    /// Diagnostic output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build an image from a Dockerfile
    Build(build::BuildArgs),
    /// Show version information
    Version(version::VersionArgs),
}

/// Dispatch a parsed CLI to the appropriate command handler.
pub async fn dispatch(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Build(args) => build::execute(args).await,
        Command::Version(args) => version::execute(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_log_format() {
        let cli = Cli::try_parse_from(["kiln", "build", "--log-format", "json", "."]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Json);
        assert!(matches!(cli.command, Command::Build(_)));
    }

    #[test]
    fn test_parse_rejects_unknown_log_format() {
        assert!(Cli::try_parse_from(["kiln", "--log-format", "xml", "version"]).is_err());
    }

    #[test]
    fn test_parse_version() {
        let cli = Cli::try_parse_from(["kiln", "version"]).unwrap();
        assert_eq!(cli.log_format, LogFormat::Text);
        assert!(matches!(cli.command, Command::Version(_)));
    }
}
