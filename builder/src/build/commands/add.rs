//! ADD: COPY plus remote URLs and local archive extraction.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::error::Result;

use super::copy::{copy_options, resolve_sources};
use super::{BuildCommand, CachedCommand, CommandEnv};
use crate::build::args::{expand, expand_all, BuildArgs};
use crate::build::context::FileContext;
use crate::build::fileops::{
    copy_from_context, destination_is_dir, detect_archive, extract_archive, host_path,
    resolve_image_path,
};
use crate::build::remote::{download, is_remote_url, url_destination};
use crate::cache::CacheEntry;
use crate::oci::ImageConfig;

pub struct AddCommand {
    sources: Vec<String>,
    dest: String,
    chown: Option<String>,
    chmod: Option<String>,
    context: Arc<FileContext>,
    root: PathBuf,
    cache_output: bool,
    snapshot_files: Vec<PathBuf>,
}

impl AddCommand {
    pub fn new(
        sources: Vec<String>,
        dest: String,
        chown: Option<String>,
        chmod: Option<String>,
        env: &CommandEnv,
    ) -> Self {
        // Remote content can change behind an unchanged URL
        let cache_output =
            env.cache_copy_layers && !sources.iter().any(|s| is_remote_url(s));
        Self {
            sources,
            dest,
            chown,
            chmod,
            context: env.context.clone(),
            root: env.root.clone(),
            cache_output,
            snapshot_files: Vec::new(),
        }
    }
}

impl fmt::Display for AddCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ADD")?;
        if let Some(chown) = &self.chown {
            write!(f, " --chown={}", chown)?;
        }
        if let Some(chmod) = &self.chmod {
            write!(f, " --chmod={}", chmod)?;
        }
        write!(f, " {} {}", self.sources.join(" "), self.dest)
    }
}

#[async_trait]
impl BuildCommand for AddCommand {
    async fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        let envs = args.replacement_envs(config);
        let dest = expand(&self.dest, &envs)?;
        let workdir = config.working_dir_or_root().to_string();
        let options = copy_options(
            self.chown.as_deref(),
            self.chmod.as_deref(),
            config,
            &self.root,
            &envs,
        )?;

        let (remote, local): (Vec<String>, Vec<String>) = expand_all(&self.sources, &envs)?
            .into_iter()
            .partition(|s| is_remote_url(s));
        let local = resolve_sources(&self.context, &local, &envs)?;
        // Counted over every source, remote and local alike
        let dest_is_dir = destination_is_dir(&dest, remote.len() + local.len());

        let mut touched = Vec::new();
        for url in &remote {
            let image_path =
                resolve_image_path(&url_destination(url, &dest, dest_is_dir)?, &workdir);
            let target = host_path(&self.root, &image_path);
            download(url, &target, &options).await?;
            touched.push(target);
        }

        let mut plain = Vec::new();
        for source in local {
            let path = self.context.root().join(&source);
            match detect_archive(&path)? {
                Some(kind) => {
                    let dest_host = host_path(&self.root, &resolve_image_path(&dest, &workdir));
                    tracing::info!(archive = %source.display(), dest = %dest, "Extracting archive");
                    touched.extend(extract_archive(&path, kind, &dest_host, &options)?);
                }
                None => plain.push(source),
            }
        }

        if !plain.is_empty() {
            touched.extend(copy_from_context(
                &self.context,
                &plain,
                &dest,
                dest_is_dir,
                &workdir,
                &self.root,
                &options,
            )?);
        }

        self.snapshot_files = touched;
        Ok(())
    }

    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>> {
        Some(self.snapshot_files.clone())
    }

    fn files_used_from_context(
        &self,
        config: &ImageConfig,
        args: &BuildArgs,
    ) -> Result<Vec<PathBuf>> {
        let envs = args.replacement_envs(config);
        let local: Vec<String> = expand_all(&self.sources, &envs)?
            .into_iter()
            .filter(|s| !is_remote_url(s))
            .collect();
        let mut sources = resolve_sources(&self.context, &local, &envs)?;
        sources.sort();
        sources.dedup();
        Ok(sources)
    }

    fn metadata_only(&self) -> bool {
        false
    }

    fn requires_unpacked_fs(&self) -> bool {
        true
    }

    fn should_cache_output(&self) -> bool {
        self.cache_output
    }

    fn cache_command(&self, entry: CacheEntry) -> Option<Box<dyn BuildCommand>> {
        Some(Box::new(CachedCommand::new(
            self.to_string(),
            entry,
            self.root.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::config::BuildOptions;
    use kiln_core::error::BuildError;
    use std::collections::BTreeMap;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::{Duration, UNIX_EPOCH};
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    const LAST_MODIFIED: &str = "Wed, 21 Oct 2015 07:28:00 GMT";
    const LAST_MODIFIED_SECS: u64 = 1_445_412_480;

    /// Minimal HTTP server for `files`; returns its base URL.
    async fn serve(files: &[(&str, &str)]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let files: BTreeMap<String, String> = files
            .iter()
            .map(|(path, body)| (path.to_string(), body.to_string()))
            .collect();

        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let files = files.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    while read < buf.len() {
                        let n = stream.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let request = String::from_utf8_lossy(&buf[..read]).into_owned();
                    let path = request.split_whitespace().nth(1).unwrap_or("/");
                    let response = match files.get(path) {
                        Some(body) => format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nLast-Modified: {}\r\nConnection: close\r\n\r\n{}",
                            body.len(),
                            LAST_MODIFIED,
                            body
                        ),
                        None => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_string(),
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    fn write_tar_gz(path: &Path, files: &[(&str, &str)]) {
        let file = std::fs::File::create(path).unwrap();
        let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, content) in files {
            let mut header = tar::Header::new_ustar();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, content.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn env(root: &TempDir, ctx: &TempDir) -> CommandEnv {
        CommandEnv::new(
            root.path().to_path_buf(),
            Arc::new(FileContext::new(ctx.path()).unwrap()),
            &BuildOptions::default(),
        )
    }

    #[tokio::test]
    async fn test_add_extracts_archive_and_copies_plain_files() {
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        write_tar_gz(
            &ctx.path().join("bundle.tar.gz"),
            &[("bin/tool", "#!/bin/sh\n"), ("README", "docs")],
        );
        std::fs::write(ctx.path().join("notes.txt"), "plain").unwrap();

        let mut cmd = AddCommand::new(
            vec!["bundle.tar.gz".to_string(), "notes.txt".to_string()],
            "/opt/".to_string(),
            None,
            None,
            &env(&root, &ctx),
        );
        cmd.execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(root.path().join("opt/bin/tool")).unwrap(),
            "#!/bin/sh\n"
        );
        assert_eq!(
            std::fs::read_to_string(root.path().join("opt/README")).unwrap(),
            "docs"
        );
        assert_eq!(
            std::fs::read_to_string(root.path().join("opt/notes.txt")).unwrap(),
            "plain"
        );
        assert!(!root.path().join("opt/bundle.tar.gz").exists());

        let footprint = cmd.files_to_snapshot().unwrap();
        assert!(footprint.contains(&root.path().join("opt/bin/tool")));
        assert!(footprint.contains(&root.path().join("opt/notes.txt")));
    }

    #[tokio::test]
    async fn test_add_non_archive_gz_is_copied() {
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        std::fs::write(ctx.path().join("fake.tar.gz"), "not an archive").unwrap();

        let mut cmd = AddCommand::new(
            vec!["fake.tar.gz".to_string()],
            "/srv/".to_string(),
            None,
            None,
            &env(&root, &ctx),
        );
        cmd.execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(root.path().join("srv/fake.tar.gz")).unwrap(),
            "not an archive"
        );
    }

    #[test]
    fn test_context_files_skip_urls() {
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        std::fs::write(ctx.path().join("local.txt"), "x").unwrap();
        let cmd = AddCommand::new(
            vec![
                "https://example.com/remote.txt".to_string(),
                "local.txt".to_string(),
            ],
            "/data/".to_string(),
            None,
            None,
            &env(&root, &ctx),
        );
        let used = cmd
            .files_used_from_context(&ImageConfig::scratch(), &BuildArgs::default())
            .unwrap();
        assert_eq!(used, vec![PathBuf::from("local.txt")]);
        assert!(!cmd.should_cache_output());
    }

    #[tokio::test]
    async fn test_add_url_default_mode_and_last_modified() {
        let base = serve(&[("/tool", "binary")]).await;
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();

        let mut cmd = AddCommand::new(
            vec![format!("{}/tool", base)],
            "/usr/local/bin/tool".to_string(),
            None,
            None,
            &env(&root, &ctx),
        );
        cmd.execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap();

        let target = root.path().join("usr/local/bin/tool");
        assert_eq!(std::fs::read_to_string(&target).unwrap(), "binary");
        let meta = std::fs::metadata(&target).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
        assert_eq!(
            meta.modified().unwrap(),
            UNIX_EPOCH + Duration::from_secs(LAST_MODIFIED_SECS)
        );
        assert_eq!(cmd.files_to_snapshot().unwrap(), vec![target]);
    }

    #[tokio::test]
    async fn test_add_url_chmod_overrides_default_mode() {
        let base = serve(&[("/run.sh", "#!/bin/sh\n")]).await;
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();

        let mut cmd = AddCommand::new(
            vec![format!("{}/run.sh", base)],
            "/bin/".to_string(),
            None,
            Some("755".to_string()),
            &env(&root, &ctx),
        );
        cmd.execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap();

        let meta = std::fs::metadata(root.path().join("bin/run.sh")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o7777, 0o755);
    }

    #[tokio::test]
    async fn test_add_two_urls_without_trailing_slash_fill_directory() {
        let base = serve(&[("/x", "first"), ("/y", "second")]).await;
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();

        let mut cmd = AddCommand::new(
            vec![format!("{}/x", base), format!("{}/y", base)],
            "/dest".to_string(),
            None,
            None,
            &env(&root, &ctx),
        );
        cmd.execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap();

        assert!(root.path().join("dest").is_dir());
        assert_eq!(
            std::fs::read_to_string(root.path().join("dest/x")).unwrap(),
            "first"
        );
        assert_eq!(
            std::fs::read_to_string(root.path().join("dest/y")).unwrap(),
            "second"
        );
    }

    #[tokio::test]
    async fn test_add_url_and_local_file_fill_directory() {
        let base = serve(&[("/x", "remote")]).await;
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        std::fs::write(ctx.path().join("local.txt"), "local").unwrap();

        let mut cmd = AddCommand::new(
            vec![format!("{}/x", base), "local.txt".to_string()],
            "/dest".to_string(),
            None,
            None,
            &env(&root, &ctx),
        );
        cmd.execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap();

        assert_eq!(
            std::fs::read_to_string(root.path().join("dest/x")).unwrap(),
            "remote"
        );
        assert_eq!(
            std::fs::read_to_string(root.path().join("dest/local.txt")).unwrap(),
            "local"
        );
    }

    #[tokio::test]
    async fn test_add_url_not_found_is_transport_error() {
        let base = serve(&[]).await;
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();

        let mut cmd = AddCommand::new(
            vec![format!("{}/missing", base)],
            "/data/".to_string(),
            None,
            None,
            &env(&root, &ctx),
        );
        let err = cmd
            .execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Transport { .. }));
    }
}
