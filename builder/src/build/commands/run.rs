//! RUN: execute a command inside the build root.

use std::ffi::CString;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use kiln_core::config::RunIsolation;
use kiln_core::error::{BuildError, Result};

use super::{command_argv, BuildCommand, CachedCommand, CommandEnv};
use crate::build::args::BuildArgs;
use crate::build::dockerfile::CommandForm;
use crate::build::fileops::host_path;
use crate::build::ownership::{resolve_chown, Owner};
use crate::cache::CacheEntry;
use crate::oci::layers::is_root;
use crate::oci::ImageConfig;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const DEFAULT_HOME: &str = "/root";

pub struct RunCommand {
    command: CommandForm,
    root: PathBuf,
    isolation: RunIsolation,
    cache_output: bool,
}

impl RunCommand {
    pub fn new(command: CommandForm, env: &CommandEnv) -> Self {
        Self {
            command,
            root: env.root.clone(),
            isolation: env.isolation,
            cache_output: env.cache_run_layers,
        }
    }

    fn command_for(
        &self,
        argv: &[String],
        workdir: &str,
        owner: Option<Owner>,
    ) -> Result<tokio::process::Command> {
        let (program, rest) = argv
            .split_first()
            .ok_or_else(|| BuildError::Resolution("RUN has an empty command".to_string()))?;

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        match self.isolation {
            RunIsolation::Host => {
                cmd.current_dir(host_path(&self.root, workdir));
                if let Some(owner) = owner.filter(|_| is_root()) {
                    cmd.uid(owner.uid).gid(owner.gid);
                }
            }
            RunIsolation::Chroot => {
                if !is_root() {
                    return Err(BuildError::effect(
                        "chroot isolation requires root; use host isolation instead",
                    ));
                }
                let root = c_string(self.root.as_os_str().as_bytes())?;
                let dir = c_string(workdir.as_bytes())?;
                // Credentials drop after chroot, which needs CAP_SYS_CHROOT
                // SAFETY: only async-signal-safe libc calls run in the child
                unsafe {
                    cmd.pre_exec(move || {
                        if libc::chroot(root.as_ptr()) != 0 || libc::chdir(dir.as_ptr()) != 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        if let Some(owner) = owner {
                            if libc::setgroups(0, std::ptr::null()) != 0
                                || libc::setgid(owner.gid) != 0
                                || libc::setuid(owner.uid) != 0
                            {
                                return Err(std::io::Error::last_os_error());
                            }
                        }
                        Ok(())
                    });
                }
            }
        }
        Ok(cmd)
    }
}

fn c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|e| BuildError::effect(format!("Invalid path for RUN: {}", e)))
}

impl fmt::Display for RunCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RUN {}", self.command)
    }
}

#[async_trait]
impl BuildCommand for RunCommand {
    async fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        let argv = command_argv(&self.command, config);

        let mut envs = args.replacement_envs(config);
        envs.entry("PATH".to_string())
            .or_insert_with(|| DEFAULT_PATH.to_string());
        envs.entry("HOME".to_string())
            .or_insert_with(|| DEFAULT_HOME.to_string());

        let workdir = config.working_dir_or_root().to_string();
        let host_workdir = host_path(&self.root, &workdir);
        std::fs::create_dir_all(&host_workdir).map_err(|e| {
            BuildError::effect(format!(
                "Failed to create working directory {}: {}",
                workdir, e
            ))
        })?;

        let owner = resolve_chown(None, config.user.as_deref(), &self.root, &envs)?;
        if owner.is_some() && !is_root() {
            tracing::warn!(
                user = config.user.as_deref().unwrap_or_default(),
                "Not running as root, RUN keeps the current user"
            );
        }

        tracing::info!(
            command = %self.command,
            isolation = %self.isolation,
            workdir = %workdir,
            "Running command"
        );

        let mut cmd = self.command_for(&argv, &workdir, owner)?;
        cmd.env_clear().envs(&envs);

        let status = cmd
            .status()
            .await
            .map_err(|e| BuildError::effect(format!("Failed to spawn '{}': {}", argv[0], e)))?;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(BuildError::Effect {
                message: format!("'{}' returned a non-zero code: {}", self.command, code),
                exit_code: Some(code),
            }),
            None => Err(BuildError::effect(format!(
                "'{}' was terminated by signal {}",
                self.command,
                status.signal().unwrap_or_default()
            ))),
        }
    }

    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>> {
        None
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
    use crate::build::context::FileContext;
    use kiln_core::config::BuildOptions;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn run(root: &TempDir, ctx: &TempDir, command: CommandForm) -> RunCommand {
        let options = BuildOptions {
            run_isolation: RunIsolation::Host,
            ..Default::default()
        };
        let env = CommandEnv::new(
            root.path().to_path_buf(),
            Arc::new(FileContext::new(ctx.path()).unwrap()),
            &options,
        );
        RunCommand::new(command, &env)
    }

    #[tokio::test]
    async fn test_run_in_workdir_with_env() {
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        let mut config = ImageConfig::scratch();
        config.working_dir = Some("/work".to_string());
        config.set_env("GREETING", "hello");
        let mut args = BuildArgs::new(vec![("VERSION".to_string(), "1.2".to_string())]);
        args.declare("VERSION", None);

        let mut cmd = run(
            &root,
            &ctx,
            CommandForm::Shell("echo \"$GREETING $VERSION\" > out.txt".to_string()),
        );
        cmd.execute(&mut config, &mut args).await.unwrap();

        let out = std::fs::read_to_string(root.path().join("work/out.txt")).unwrap();
        assert_eq!(out, "hello 1.2\n");
        assert_eq!(cmd.files_to_snapshot(), None);
    }

    #[tokio::test]
    async fn test_run_exit_code() {
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        let mut cmd = run(&root, &ctx, CommandForm::Shell("exit 42".to_string()));
        let err = cmd
            .execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), Some(42));
    }

    #[tokio::test]
    async fn test_run_exec_form_missing_binary() {
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        let mut cmd = run(
            &root,
            &ctx,
            CommandForm::Exec(vec!["/nonexistent/kiln-test-binary".to_string()]),
        );
        let err = cmd
            .execute(&mut ImageConfig::scratch(), &mut BuildArgs::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Effect { exit_code: None, .. }));
    }

    #[test]
    fn test_display() {
        let root = TempDir::new().unwrap();
        let ctx = TempDir::new().unwrap();
        let cmd = run(
            &root,
            &ctx,
            CommandForm::Exec(vec!["make".to_string(), "all".to_string()]),
        );
        assert_eq!(cmd.to_string(), r#"RUN ["make","all"]"#);
    }
}
