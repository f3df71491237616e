//! `kiln build` command - Build an image from a Dockerfile.
//!
//! Resolves build options from an optional YAML file and the command line,
//! runs the build engine and prints a summary of the produced image.

use std::collections::BTreeMap;
use std::path::PathBuf;

use clap::Args;
use kiln_builder::{build, BuildConfig, BuildResult};
use kiln_core::config::{BuildOptions, RunIsolation};

use crate::output::{format_bytes, short_digest};

#[derive(Args)]
pub struct BuildArgs {
    /// Build context directory
    #[arg(default_value = ".")]
    pub path: String,

    /// Path to Dockerfile (default: <PATH>/Dockerfile)
    #[arg(short = 'f', long = "file")]
    pub file: Option<String>,

    /// Registry reference to push the image to (e.g., "registry.local/app:1.0")
    #[arg(short = 'd', long = "destination")]
    pub destination: Option<String>,

    /// Directory receiving the OCI image layout
    #[arg(short = 'o', long = "output", default_value = "image")]
    pub output: PathBuf,

    /// Set build-time variables (KEY=VALUE), can be repeated
    #[arg(long = "build-arg")]
    pub build_arg: Vec<String>,

    /// YAML file with build options; flags override its values
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Enable the layer cache
    #[arg(long)]
    pub cache: bool,

    /// Local cache directory
    #[arg(long = "cache-dir")]
    pub cache_dir: Option<PathBuf>,

    /// Registry repository for cache entries
    #[arg(long = "cache-repo")]
    pub cache_repo: Option<String>,

    /// Cache COPY and ADD layers
    #[arg(long = "cache-copy-layers")]
    pub cache_copy_layers: Option<bool>,

    /// Cache RUN layers
    #[arg(long = "cache-run-layers")]
    pub cache_run_layers: Option<bool>,

    /// Take one snapshot at the end of the build instead of one per step
    #[arg(long = "single-snapshot")]
    pub single_snapshot: bool,

    /// Strip timestamps so identical inputs give identical digests
    #[arg(long)]
    pub reproducible: bool,

    /// Build the image but do not push it
    #[arg(long = "no-push")]
    pub no_push: bool,

    /// Use plain HTTP for registries
    #[arg(long = "insecure-registry")]
    pub insecure_registry: bool,

    /// Isolation for RUN instructions (chroot or host)
    #[arg(long = "run-isolation")]
    pub run_isolation: Option<RunIsolation>,

    /// Credential helper to consult (e.g., "ecr-login"), can be repeated
    #[arg(long = "credential-helper")]
    pub credential_helper: Vec<String>,

    /// Root filesystem the build runs against
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Additional absolute path to leave out of snapshots, can be repeated
    #[arg(long = "ignore-path")]
    pub ignore_path: Vec<PathBuf>,

    /// Suppress the build summary
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context_dir = PathBuf::from(&args.path)
        .canonicalize()
        .map_err(|e| format!("Invalid build context path '{}': {}", args.path, e))?;

    if !context_dir.is_dir() {
        return Err(format!(
            "Build context '{}' is not a directory",
            context_dir.display()
        )
        .into());
    }

    let dockerfile_path = match &args.file {
        Some(f) => {
            let p = PathBuf::from(f);
            if p.is_absolute() {
                p
            } else {
                context_dir.join(p)
            }
        }
        None => context_dir.join("Dockerfile"),
    };

    if !dockerfile_path.is_file() {
        return Err(format!("Dockerfile not found: {}", dockerfile_path.display()).into());
    }

    let options = resolve_options(&args)?;
    let build_args = parse_build_args(&args.build_arg)?;

    let config = BuildConfig {
        context_dir,
        dockerfile_path,
        destination: args.destination.clone(),
        output_dir: args.output.clone(),
        build_args,
        options,
    };

    let result = build(config).await?;

    if !args.quiet {
        print_summary(&result, &args.output);
    }

    Ok(())
}

/// Layer the command-line flags over the optional YAML options.
pub fn resolve_options(args: &BuildArgs) -> Result<BuildOptions, Box<dyn std::error::Error>> {
    let mut options = match &args.config {
        Some(path) => BuildOptions::from_yaml_file(path)?,
        None => BuildOptions::default(),
    };

    if let Some(root) = &args.root {
        options.root_dir = root.clone();
    }
    if args.single_snapshot {
        options.single_snapshot = true;
    }
    if args.reproducible {
        options.reproducible = true;
    }
    if args.no_push {
        options.no_push = true;
    }
    if args.insecure_registry {
        options.insecure_registry = true;
    }
    if let Some(isolation) = args.run_isolation {
        options.run_isolation = isolation;
    }
    if !args.credential_helper.is_empty() {
        options.credential_helpers = args.credential_helper.clone();
    }
    options
        .ignore_paths
        .extend(args.ignore_path.iter().cloned());

    if args.cache {
        options.cache.enabled = true;
    }
    if let Some(dir) = &args.cache_dir {
        options.cache.dir = Some(dir.clone());
        options.cache.repo = None;
    }
    if let Some(repo) = &args.cache_repo {
        options.cache.repo = Some(repo.clone());
        if args.cache_dir.is_none() {
            options.cache.dir = None;
        }
    }
    if let Some(enabled) = args.cache_copy_layers {
        options.cache.cache_copy_layers = enabled;
    }
    if let Some(enabled) = args.cache_run_layers {
        options.cache.cache_run_layers = enabled;
    }

    options.validate()?;
    Ok(options)
}

/// Parse KEY=VALUE build arguments. A later duplicate wins.
pub fn parse_build_args(
    args: &[String],
) -> Result<BTreeMap<String, String>, Box<dyn std::error::Error>> {
    let mut map = BTreeMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| format!("Invalid build arg format (expected KEY=VALUE): {}", arg))?;
        if key.is_empty() {
            return Err(format!("Build arg has an empty name: {}", arg).into());
        }
        map.insert(key.to_string(), value.to_string());
    }
    Ok(map)
}

fn print_summary(result: &BuildResult, output: &std::path::Path) {
    let size: u64 = result.layers.iter().map(|l| l.size).sum();
    println!(
        "Built {} ({} layers, {} new, {})",
        short_digest(&result.manifest_digest),
        result.layer_count(),
        result.layers.len(),
        format_bytes(size)
    );
    if result.cache_hits > 0 {
        println!("Cache hits: {}", result.cache_hits);
    }
    println!("OCI layout: {}", output.display());
    if let Some(reference) = &result.pushed {
        println!("Pushed: {}", reference);
    }
    println!("{}", result.manifest_digest);
}
