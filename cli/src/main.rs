//! Kiln CLI entry point.

use clap::Parser;
use kiln_core::error::BuildError;
use kiln_core::LogFormat;
use tracing_subscriber::EnvFilter;

use kiln_cli::commands::{dispatch, Cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    if let Err(e) = dispatch(cli).await {
        eprintln!("Error: {e}");
        // A failing RUN step decides the exit status
        let code = e
            .downcast_ref::<BuildError>()
            .and_then(BuildError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
