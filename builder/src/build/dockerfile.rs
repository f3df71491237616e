//! Build file parser.
//!
//! Parses a Dockerfile-syntax build file into a base image reference and a
//! linear list of instructions. Supports line continuations (`\`),
//! comments, and both shell and JSON (exec) forms.

use std::fmt;
use std::path::Path;

use kiln_core::error::{BuildError, Result};

/// Shell or exec form of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandForm {
    /// Run through the image shell
    Shell(String),
    /// Executed directly
    Exec(Vec<String>),
}

impl fmt::Display for CommandForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandForm::Shell(cmd) => write!(f, "{}", cmd),
            CommandForm::Exec(argv) => write!(f, "{}", json_array(argv)),
        }
    }
}

/// A single build instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    Run {
        command: CommandForm,
    },
    Copy {
        sources: Vec<String>,
        dest: String,
        chown: Option<String>,
        chmod: Option<String>,
    },
    Add {
        sources: Vec<String>,
        dest: String,
        chown: Option<String>,
        chmod: Option<String>,
    },
    Workdir {
        path: String,
    },
    Env {
        pairs: Vec<(String, String)>,
    },
    Label {
        pairs: Vec<(String, String)>,
    },
    User {
        user: String,
    },
    Expose {
        ports: Vec<String>,
    },
    Arg {
        name: String,
        default: Option<String>,
    },
    Entrypoint {
        command: CommandForm,
    },
    Cmd {
        command: CommandForm,
    },
    Volume {
        paths: Vec<String>,
    },
    Shell {
        argv: Vec<String>,
    },
    StopSignal {
        signal: String,
    },
}

impl Instruction {
    /// Upper-case keyword of this instruction.
    pub fn keyword(&self) -> &'static str {
        match self {
            Instruction::Run { .. } => "RUN",
            Instruction::Copy { .. } => "COPY",
            Instruction::Add { .. } => "ADD",
            Instruction::Workdir { .. } => "WORKDIR",
            Instruction::Env { .. } => "ENV",
            Instruction::Label { .. } => "LABEL",
            Instruction::User { .. } => "USER",
            Instruction::Expose { .. } => "EXPOSE",
            Instruction::Arg { .. } => "ARG",
            Instruction::Entrypoint { .. } => "ENTRYPOINT",
            Instruction::Cmd { .. } => "CMD",
            Instruction::Volume { .. } => "VOLUME",
            Instruction::Shell { .. } => "SHELL",
            Instruction::StopSignal { .. } => "STOPSIGNAL",
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.keyword())?;
        match self {
            Instruction::Run { command }
            | Instruction::Entrypoint { command }
            | Instruction::Cmd { command } => write!(f, " {}", command),
            Instruction::Copy {
                sources,
                dest,
                chown,
                chmod,
            }
            | Instruction::Add {
                sources,
                dest,
                chown,
                chmod,
            } => {
                if let Some(chown) = chown {
                    write!(f, " --chown={}", chown)?;
                }
                if let Some(chmod) = chmod {
                    write!(f, " --chmod={}", chmod)?;
                }
                write!(f, " {} {}", sources.join(" "), dest)
            }
            Instruction::Workdir { path } => write!(f, " {}", path),
            Instruction::Env { pairs } | Instruction::Label { pairs } => {
                for (key, value) in pairs {
                    write!(f, " {}={}", key, quote_if_needed(value))?;
                }
                Ok(())
            }
            Instruction::User { user } => write!(f, " {}", user),
            Instruction::Expose { ports } => write!(f, " {}", ports.join(" ")),
            Instruction::Arg { name, default } => match default {
                Some(default) => write!(f, " {}={}", name, quote_if_needed(default)),
                None => write!(f, " {}", name),
            },
            Instruction::Volume { paths } => write!(f, " {}", json_array(paths)),
            Instruction::Shell { argv } => write!(f, " {}", json_array(argv)),
            Instruction::StopSignal { signal } => write!(f, " {}", signal),
        }
    }
}

fn json_array(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_default()
}

fn quote_if_needed(value: &str) -> String {
    if value.is_empty() || value.contains(char::is_whitespace) {
        format!("\"{}\"", value.replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

/// Parsed build file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dockerfile {
    /// `ARG` declarations preceding `FROM`
    pub args_before_from: Vec<(String, Option<String>)>,
    /// Base image (`scratch`, `oci:<path>` or a registry reference)
    pub base: String,
    pub instructions: Vec<Instruction>,
}

impl Dockerfile {
    /// Parse build file text.
    pub fn parse(content: &str) -> Result<Self> {
        let mut args_before_from = Vec::new();
        let mut base: Option<String> = None;
        let mut instructions = Vec::new();

        for (line, text) in logical_lines(content) {
            let (keyword, rest) = split_first_word(&text);
            let keyword = keyword.to_uppercase();

            if keyword == "FROM" {
                if base.is_some() {
                    return Err(parse_error(line, "multi-stage builds are not supported"));
                }
                base = Some(parse_from(rest, line)?);
                continue;
            }

            match parse_instruction(&keyword, rest, line)? {
                Some(Instruction::Arg { name, default }) if base.is_none() => {
                    args_before_from.push((name, default));
                }
                Some(_) if base.is_none() => {
                    return Err(parse_error(
                        line,
                        "first instruction must be FROM (or ARG before FROM)",
                    ));
                }
                Some(instruction) => instructions.push(instruction),
                None => {}
            }
        }

        let base = base.ok_or_else(|| parse_error(0, "build file has no FROM instruction"))?;
        Ok(Self {
            args_before_from,
            base,
            instructions,
        })
    }

    /// Parse a build file from disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BuildError::Config(format!(
                "Failed to read build file at {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::parse(&content)
    }
}

fn parse_error(line: usize, message: impl Into<String>) -> BuildError {
    BuildError::Parse {
        line,
        message: message.into(),
    }
}

/// Join continuation lines and drop comments and blanks.
/// Yields each logical line with the number of its first physical line.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (index, raw) in content.lines().enumerate() {
        let trimmed = raw.trim();
        if current.is_empty() {
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            start = index + 1;
        } else if trimmed.starts_with('#') {
            continue;
        }

        match trimmed.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head.trim_end());
                current.push(' ');
            }
            None => {
                current.push_str(trimmed);
                lines.push((start, current.trim().to_string()));
                current.clear();
            }
        }
    }
    if !current.trim().is_empty() {
        lines.push((start, current.trim().to_string()));
    }
    lines
}

fn parse_instruction(keyword: &str, rest: &str, line: usize) -> Result<Option<Instruction>> {
    let require = |what: &str| -> Result<()> {
        if rest.is_empty() {
            Err(parse_error(line, format!("{} requires {}", keyword, what)))
        } else {
            Ok(())
        }
    };

    let instruction = match keyword {
        "RUN" => {
            require("a command")?;
            Instruction::Run {
                command: parse_command_form(rest, line)?,
            }
        }
        "COPY" | "ADD" => {
            require("source and destination")?;
            let (flags, operands) = split_flags(rest);
            let mut chown = None;
            let mut chmod = None;
            for flag in flags {
                match flag.split_once('=') {
                    Some(("--chown", value)) => chown = Some(value.to_string()),
                    Some(("--chmod", value)) => chmod = Some(value.to_string()),
                    Some(("--from", _)) => {
                        return Err(parse_error(line, "COPY --from requires multi-stage builds"))
                    }
                    _ => return Err(parse_error(line, format!("unknown flag {}", flag))),
                }
            }
            let mut parts = if operands.starts_with('[') {
                parse_json_array(operands, line)?
            } else {
                split_words(operands)
            };
            if parts.len() < 2 {
                return Err(parse_error(
                    line,
                    format!("{} requires at least one source and a destination", keyword),
                ));
            }
            let dest = parts.pop().unwrap_or_default();
            if keyword == "COPY" {
                Instruction::Copy {
                    sources: parts,
                    dest,
                    chown,
                    chmod,
                }
            } else {
                Instruction::Add {
                    sources: parts,
                    dest,
                    chown,
                    chmod,
                }
            }
        }
        "WORKDIR" => {
            require("a path")?;
            Instruction::Workdir {
                path: unquote(rest),
            }
        }
        "ENV" => {
            require("a key and value")?;
            Instruction::Env {
                pairs: parse_pairs(rest, line)?,
            }
        }
        "LABEL" => {
            require("key=value")?;
            Instruction::Label {
                pairs: parse_pairs(rest, line)?,
            }
        }
        "USER" => {
            require("a user")?;
            Instruction::User {
                user: rest.split_whitespace().next().unwrap_or(rest).to_string(),
            }
        }
        "EXPOSE" => {
            require("a port")?;
            Instruction::Expose {
                ports: rest.split_whitespace().map(str::to_string).collect(),
            }
        }
        "ARG" => {
            require("a name")?;
            match rest.split_once('=') {
                Some((name, default)) => Instruction::Arg {
                    name: name.trim().to_string(),
                    default: Some(unquote(default)),
                },
                None => Instruction::Arg {
                    name: rest.trim().to_string(),
                    default: None,
                },
            }
        }
        "ENTRYPOINT" => {
            require("an argument")?;
            Instruction::Entrypoint {
                command: parse_command_form(rest, line)?,
            }
        }
        "CMD" => {
            require("an argument")?;
            Instruction::Cmd {
                command: parse_command_form(rest, line)?,
            }
        }
        "VOLUME" => {
            require("a path")?;
            let paths = if rest.starts_with('[') {
                parse_json_array(rest, line)?
            } else {
                split_words(rest)
            };
            Instruction::Volume { paths }
        }
        "SHELL" => {
            require("a JSON array")?;
            let argv = parse_json_array(rest, line)?;
            if argv.is_empty() {
                return Err(parse_error(line, "SHELL requires at least one element"));
            }
            Instruction::Shell { argv }
        }
        "STOPSIGNAL" => {
            require("a signal")?;
            Instruction::StopSignal {
                signal: rest.trim().to_string(),
            }
        }
        "HEALTHCHECK" | "ONBUILD" | "MAINTAINER" => {
            tracing::warn!(line, instruction = keyword, "Unsupported instruction, skipping");
            return Ok(None);
        }
        _ => return Err(parse_error(line, format!("unknown instruction '{}'", keyword))),
    };
    Ok(Some(instruction))
}

fn parse_from(rest: &str, line: usize) -> Result<String> {
    let mut words = rest.split_whitespace();
    let mut image = words
        .next()
        .ok_or_else(|| parse_error(line, "FROM requires an image argument"))?;
    if image.starts_with("--platform=") {
        image = words
            .next()
            .ok_or_else(|| parse_error(line, "FROM requires an image argument"))?;
    }
    match (words.next(), words.next()) {
        (None, _) => {}
        (Some(as_kw), Some(_alias)) if as_kw.eq_ignore_ascii_case("AS") => {}
        _ => return Err(parse_error(line, "expected FROM <image> [AS <name>]")),
    }
    Ok(image.to_string())
}

fn parse_command_form(rest: &str, line: usize) -> Result<CommandForm> {
    if rest.starts_with('[') {
        if let Ok(argv) = serde_json::from_str::<Vec<String>>(rest) {
            return Ok(CommandForm::Exec(argv));
        }
        tracing::debug!(line, "Not a JSON array, treating as shell form");
    }
    Ok(CommandForm::Shell(rest.to_string()))
}

/// Split leading `--flag=value` words from the operands.
fn split_flags(rest: &str) -> (Vec<&str>, &str) {
    let mut flags = Vec::new();
    let mut remaining = rest;
    while remaining.starts_with("--") {
        let (flag, after) = split_first_word(remaining);
        flags.push(flag);
        remaining = after;
    }
    (flags, remaining)
}

/// `KEY=VALUE ...` pairs, or the legacy single `KEY VALUE` form.
fn parse_pairs(rest: &str, line: usize) -> Result<Vec<(String, String)>> {
    let (first, remainder) = split_first_word(rest);
    if !first.contains('=') {
        if remainder.is_empty() {
            return Err(parse_error(line, format!("missing value for {}", first)));
        }
        return Ok(vec![(first.to_string(), unquote(remainder))]);
    }

    split_words(rest)
        .into_iter()
        .map(|word| match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(parse_error(line, format!("expected KEY=VALUE, got '{}'", word))),
        })
        .collect()
}

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// Whitespace split honouring quotes; quotes are removed and `\` escapes
/// the next character inside double quotes.
fn split_words(s: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some('"'), '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '"') | (None, '\'') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(current);
    }
    words
}

fn parse_json_array(s: &str, line: usize) -> Result<Vec<String>> {
    serde_json::from_str(s)
        .map_err(|e| parse_error(line, format!("invalid JSON array '{}': {}", s, e)))
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    let quoted = s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')));
    if quoted {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(content: &str) -> Instruction {
        let parsed = Dockerfile::parse(&format!("FROM scratch\n{}", content)).unwrap();
        assert_eq!(parsed.instructions.len(), 1);
        parsed.instructions[0].clone()
    }

    #[test]
    fn test_logical_lines() {
        let lines = logical_lines("# c\nRUN a && \\\n  # inner comment\n  b\n\nENV X=1\n");
        assert_eq!(
            lines,
            vec![(2, "RUN a && b".to_string()), (6, "ENV X=1".to_string())]
        );
    }

    #[test]
    fn test_parse_minimal() {
        let df = Dockerfile::parse("ARG TAG=3.19\nFROM alpine:${TAG} AS base\nRUN true").unwrap();
        assert_eq!(df.base, "alpine:${TAG}");
        assert_eq!(
            df.args_before_from,
            vec![("TAG".to_string(), Some("3.19".to_string()))]
        );
        assert_eq!(df.instructions.len(), 1);
    }

    #[test]
    fn test_parse_run_forms() {
        assert_eq!(
            single("RUN echo hi > /out"),
            Instruction::Run {
                command: CommandForm::Shell("echo hi > /out".to_string())
            }
        );
        assert_eq!(
            single(r#"RUN ["/bin/echo", "hi"]"#),
            Instruction::Run {
                command: CommandForm::Exec(vec!["/bin/echo".to_string(), "hi".to_string()])
            }
        );
    }

    #[test]
    fn test_parse_copy_flags() {
        assert_eq!(
            single("COPY --chown=app:app --chmod=0755 a.sh b.sh /usr/local/bin/"),
            Instruction::Copy {
                sources: vec!["a.sh".to_string(), "b.sh".to_string()],
                dest: "/usr/local/bin/".to_string(),
                chown: Some("app:app".to_string()),
                chmod: Some("0755".to_string()),
            }
        );
    }

    #[test]
    fn test_parse_add_json_form() {
        assert_eq!(
            single(r#"ADD ["my file.txt", "/dest/"]"#),
            Instruction::Add {
                sources: vec!["my file.txt".to_string()],
                dest: "/dest/".to_string(),
                chown: None,
                chmod: None,
            }
        );
    }

    #[test]
    fn test_parse_copy_errors() {
        assert!(Dockerfile::parse("FROM scratch\nCOPY onlyone").is_err());
        assert!(matches!(
            Dockerfile::parse("FROM scratch\nCOPY --from=build /a /b"),
            Err(BuildError::Parse { line: 2, .. })
        ));
        assert!(Dockerfile::parse("FROM scratch\nCOPY --link a b").is_err());
    }

    #[test]
    fn test_parse_env_pairs() {
        assert_eq!(
            single(r#"ENV A=1 B="two words" C="""#),
            Instruction::Env {
                pairs: vec![
                    ("A".to_string(), "1".to_string()),
                    ("B".to_string(), "two words".to_string()),
                    ("C".to_string(), String::new()),
                ]
            }
        );
        assert!(Dockerfile::parse("FROM scratch\nENV A=1 stray").is_err());
    }

    #[test]
    fn test_parse_env_legacy() {
        assert_eq!(
            single("ENV GREETING hello world"),
            Instruction::Env {
                pairs: vec![("GREETING".to_string(), "hello world".to_string())]
            }
        );
    }

    #[test]
    fn test_parse_label_multi() {
        assert_eq!(
            single(r#"LABEL a=1 "b"="two" c='x y'"#),
            Instruction::Label {
                pairs: vec![
                    ("a".to_string(), "1".to_string()),
                    ("b".to_string(), "two".to_string()),
                    ("c".to_string(), "x y".to_string()),
                ]
            }
        );
    }

    #[test]
    fn test_parse_expose_volume_shell_stopsignal() {
        assert_eq!(
            single("EXPOSE 80 443/udp"),
            Instruction::Expose {
                ports: vec!["80".to_string(), "443/udp".to_string()]
            }
        );
        assert_eq!(
            single(r#"VOLUME ["/data", "/logs"]"#),
            Instruction::Volume {
                paths: vec!["/data".to_string(), "/logs".to_string()]
            }
        );
        assert_eq!(
            single(r#"SHELL ["/bin/bash", "-c"]"#),
            Instruction::Shell {
                argv: vec!["/bin/bash".to_string(), "-c".to_string()]
            }
        );
        assert_eq!(
            single("STOPSIGNAL SIGKILL"),
            Instruction::StopSignal {
                signal: "SIGKILL".to_string()
            }
        );
    }

    #[test]
    fn test_parse_arg() {
        assert_eq!(
            single("ARG VERSION"),
            Instruction::Arg {
                name: "VERSION".to_string(),
                default: None
            }
        );
        assert_eq!(
            single("ARG VERSION=\"1.0\""),
            Instruction::Arg {
                name: "VERSION".to_string(),
                default: Some("1.0".to_string())
            }
        );
    }

    #[test]
    fn test_second_from_rejected() {
        let err = Dockerfile::parse("FROM alpine\nRUN true\nFROM scratch").unwrap_err();
        assert!(matches!(err, BuildError::Parse { line: 3, .. }));
    }

    #[test]
    fn test_missing_from_rejected() {
        assert!(Dockerfile::parse("RUN true").is_err());
        assert!(Dockerfile::parse("# only a comment\n").is_err());
        assert!(Dockerfile::parse("FROM\n").is_err());
    }

    #[test]
    fn test_unknown_instruction() {
        assert!(Dockerfile::parse("FROM scratch\nFROBNICATE x").is_err());
    }

    #[test]
    fn test_unsupported_instruction_skipped() {
        let df = Dockerfile::parse("FROM scratch\nMAINTAINER someone\nRUN true").unwrap();
        assert_eq!(df.instructions.len(), 1);
    }

    #[test]
    fn test_display_round_trips() {
        let content = [
            "RUN echo hi",
            r#"RUN ["/bin/echo","hi"]"#,
            "COPY --chown=1000:1000 a b /dest/",
            "ADD https://example.com/f.tgz /opt/",
            "WORKDIR /app",
            "ENV A=1 B=\"two words\"",
            "LABEL version=1.0",
            "USER nobody",
            "EXPOSE 80 443/udp",
            "ARG NAME=default",
            r#"ENTRYPOINT ["/app"]"#,
            "CMD serve --port 80",
            r#"VOLUME ["/data"]"#,
            r#"SHELL ["/bin/bash","-c"]"#,
            "STOPSIGNAL SIGTERM",
        ];
        for line in content {
            let instruction = single(line);
            assert_eq!(instruction.to_string(), line);
            assert_eq!(single(&instruction.to_string()), instruction);
        }
    }

    #[test]
    fn test_split_words() {
        assert_eq!(
            split_words(r#"a "b c" 'd "e"' f\g"#),
            vec!["a", "b c", "d \"e\"", "f\\g"]
        );
    }

    #[test]
    fn test_unquote() {
        assert_eq!(unquote("\"hello\""), "hello");
        assert_eq!(unquote("'hello'"), "hello");
        assert_eq!(unquote("hello"), "hello");
        assert_eq!(unquote("\""), "\"");
    }
}
