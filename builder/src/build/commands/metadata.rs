//! Instructions that only change the image configuration.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use kiln_core::error::{BuildError, Result};

use super::{command_argv, BuildCommand};
use crate::build::args::{expand, BuildArgs};
use crate::build::dockerfile::Instruction;
use crate::oci::ImageConfig;

const PROTOCOLS: &[&str] = &["tcp", "udp", "sctp"];

/// ENV, LABEL, USER, WORKDIR, EXPOSE, ARG, ENTRYPOINT, CMD, VOLUME, SHELL
/// and STOPSIGNAL.
pub struct MetadataCommand {
    instruction: Instruction,
}

impl MetadataCommand {
    pub fn new(instruction: Instruction) -> Self {
        Self { instruction }
    }
}

impl fmt::Display for MetadataCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.instruction)
    }
}

#[async_trait]
impl BuildCommand for MetadataCommand {
    async fn execute(&mut self, config: &mut ImageConfig, args: &mut BuildArgs) -> Result<()> {
        let envs = args.replacement_envs(config);

        match &self.instruction {
            Instruction::Env { pairs } => {
                // Every pair sees the values from before this instruction
                let expanded = pairs
                    .iter()
                    .map(|(k, v)| Ok((expand(k, &envs)?, expand(v, &envs)?)))
                    .collect::<Result<Vec<_>>>()?;
                for (key, value) in expanded {
                    config.set_env(key, value);
                }
            }
            Instruction::Label { pairs } => {
                for (key, value) in pairs {
                    config
                        .labels
                        .insert(expand(key, &envs)?, expand(value, &envs)?);
                }
            }
            Instruction::User { user } => {
                config.user = Some(expand(user, &envs)?);
            }
            Instruction::Workdir { path } => {
                let path = expand(path, &envs)?;
                config.working_dir = Some(join_workdir(config.working_dir_or_root(), &path));
            }
            Instruction::Expose { ports } => {
                for port in ports {
                    config.exposed_ports.insert(normalize_port(&expand(port, &envs)?)?);
                }
            }
            Instruction::Arg { name, default } => {
                let default = match default {
                    Some(value) => Some(expand(value, &envs)?),
                    None => None,
                };
                args.declare(name, default);
            }
            Instruction::Entrypoint { command } => {
                config.entrypoint = Some(command_argv(command, config));
            }
            Instruction::Cmd { command } => {
                config.cmd = Some(command_argv(command, config));
            }
            Instruction::Volume { paths } => {
                for path in paths {
                    config.volumes.insert(expand(path, &envs)?);
                }
            }
            Instruction::Shell { argv } => {
                if argv.is_empty() {
                    return Err(BuildError::Resolution(
                        "SHELL requires at least one argument".to_string(),
                    ));
                }
                config.shell = Some(argv.clone());
            }
            Instruction::StopSignal { signal } => {
                config.stop_signal = Some(validate_signal(&expand(signal, &envs)?)?);
            }
            Instruction::Run { .. } | Instruction::Copy { .. } | Instruction::Add { .. } => {
                return Err(BuildError::Other(format!(
                    "{} is not a metadata instruction",
                    self.instruction.keyword()
                )))
            }
        }

        tracing::debug!(instruction = %self.instruction, "Updated image config");
        Ok(())
    }

    fn files_to_snapshot(&self) -> Option<Vec<PathBuf>> {
        Some(Vec::new())
    }

    fn metadata_only(&self) -> bool {
        true
    }

    fn requires_unpacked_fs(&self) -> bool {
        // A named user is resolved against the image's passwd by later steps
        matches!(self.instruction, Instruction::User { .. })
    }
}

/// Resolve `path` against the current working directory, lexically.
fn join_workdir(current: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        PathBuf::from(path)
    } else {
        Path::new(current).join(path)
    };

    let mut parts: Vec<String> = Vec::new();
    for component in joined.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::ParentDir => {
                parts.pop();
            }
            _ => {}
        }
    }
    format!("/{}", parts.join("/"))
}

/// `80` becomes `80/tcp`; ranges and protocols are checked.
fn normalize_port(spec: &str) -> Result<String> {
    let invalid = || BuildError::Resolution(format!("invalid port specification '{}'", spec));

    let (ports, proto) = match spec.split_once('/') {
        Some((ports, proto)) => (ports, proto.to_ascii_lowercase()),
        None => (spec, "tcp".to_string()),
    };
    if !PROTOCOLS.contains(&proto.as_str()) {
        return Err(invalid());
    }

    let mut bounds = Vec::new();
    for part in ports.splitn(2, '-') {
        let port: u16 = part.parse().map_err(|_| invalid())?;
        bounds.push(port);
    }
    if bounds.len() == 2 && bounds[0] > bounds[1] {
        return Err(invalid());
    }
    Ok(format!("{}/{}", ports, proto))
}

fn validate_signal(signal: &str) -> Result<String> {
    let valid = match signal.parse::<u32>() {
        Ok(n) => (1..=64).contains(&n),
        Err(_) => {
            let name = signal.strip_prefix("SIG").unwrap_or(signal);
            !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '+' || c == '-')
        }
    };
    if valid {
        Ok(signal.to_string())
    } else {
        Err(BuildError::Resolution(format!(
            "invalid stop signal '{}'",
            signal
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::dockerfile::CommandForm;

    async fn apply(
        instruction: Instruction,
        config: &mut ImageConfig,
        args: &mut BuildArgs,
    ) -> Result<()> {
        MetadataCommand::new(instruction).execute(config, args).await
    }

    fn pairs(items: &[(&str, &str)]) -> Vec<(String, String)> {
        items
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_env_pairs_see_previous_values() {
        let mut config = ImageConfig::scratch();
        let mut args = BuildArgs::default();
        config.set_env("A", "old");

        apply(
            Instruction::Env {
                pairs: pairs(&[("A", "new"), ("B", "${A}-b")]),
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();
        assert_eq!(config.get_env("A"), Some("new"));
        assert_eq!(config.get_env("B"), Some("old-b"));

        apply(
            Instruction::Env {
                pairs: pairs(&[("C", "$A")]),
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();
        assert_eq!(config.get_env("C"), Some("new"));
    }

    #[tokio::test]
    async fn test_arg_then_label() {
        let mut config = ImageConfig::scratch();
        let mut args = BuildArgs::new(vec![("VERSION".to_string(), "2.0".to_string())]);

        apply(
            Instruction::Arg {
                name: "VERSION".to_string(),
                default: Some("1.0".to_string()),
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();
        apply(
            Instruction::Label {
                pairs: pairs(&[("version", "$VERSION")]),
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();
        assert_eq!(config.labels.get("version").map(String::as_str), Some("2.0"));
        assert!(config.get_env("VERSION").is_none());
    }

    #[tokio::test]
    async fn test_undeclared_variable_fails() {
        let err = apply(
            Instruction::Label {
                pairs: pairs(&[("x", "$MISSING")]),
            },
            &mut ImageConfig::scratch(),
            &mut BuildArgs::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, BuildError::Resolution(_)));
    }

    #[tokio::test]
    async fn test_workdir_relative() {
        let mut config = ImageConfig::scratch();
        let mut args = BuildArgs::default();
        for path in ["/app", "src", "../lib"] {
            apply(
                Instruction::Workdir {
                    path: path.to_string(),
                },
                &mut config,
                &mut args,
            )
            .await
            .unwrap();
        }
        assert_eq!(config.working_dir.as_deref(), Some("/app/lib"));
    }

    #[tokio::test]
    async fn test_cmd_and_entrypoint_forms() {
        let mut config = ImageConfig::scratch();
        let mut args = BuildArgs::default();
        apply(
            Instruction::Entrypoint {
                command: CommandForm::Exec(vec!["/app".to_string(), "--serve".to_string()]),
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();
        apply(
            Instruction::Cmd {
                command: CommandForm::Shell("echo $HOME".to_string()),
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();
        assert_eq!(
            config.entrypoint,
            Some(vec!["/app".to_string(), "--serve".to_string()])
        );
        assert_eq!(
            config.cmd,
            Some(vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                "echo $HOME".to_string()
            ])
        );
    }

    #[tokio::test]
    async fn test_expose_volume_stopsignal() {
        let mut config = ImageConfig::scratch();
        let mut args = BuildArgs::default();
        apply(
            Instruction::Expose {
                ports: vec!["80".to_string(), "53/UDP".to_string(), "8000-8010".to_string()],
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();
        apply(
            Instruction::Volume {
                paths: vec!["/data".to_string()],
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();
        apply(
            Instruction::StopSignal {
                signal: "SIGTERM".to_string(),
            },
            &mut config,
            &mut args,
        )
        .await
        .unwrap();

        assert!(config.exposed_ports.contains("80/tcp"));
        assert!(config.exposed_ports.contains("53/udp"));
        assert!(config.exposed_ports.contains("8000-8010/tcp"));
        assert!(config.volumes.contains("/data"));
        assert_eq!(config.stop_signal.as_deref(), Some("SIGTERM"));
    }

    #[test]
    fn test_normalize_port_rejects() {
        assert!(normalize_port("http").is_err());
        assert!(normalize_port("80/icmp").is_err());
        assert!(normalize_port("90-80").is_err());
        assert!(normalize_port("70000").is_err());
    }

    #[test]
    fn test_validate_signal() {
        assert!(validate_signal("9").is_ok());
        assert!(validate_signal("SIGRTMIN+3").is_ok());
        assert!(validate_signal("0").is_err());
        assert!(validate_signal("sigterm").is_err());
    }

    #[test]
    fn test_capabilities() {
        let user = MetadataCommand::new(Instruction::User {
            user: "app".to_string(),
        });
        assert!(user.metadata_only());
        assert!(user.requires_unpacked_fs());
        assert_eq!(user.to_string(), "USER app");

        let env = MetadataCommand::new(Instruction::Env {
            pairs: pairs(&[("A", "1")]),
        });
        assert!(!env.requires_unpacked_fs());
        assert!(!env.should_cache_output());
    }
}
