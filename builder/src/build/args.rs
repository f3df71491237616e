//! Build arguments and variable substitution.

use std::collections::BTreeMap;

use kiln_core::error::{BuildError, Result};

use crate::oci::ImageConfig;

/// Arguments usable without an `ARG` declaration when supplied on the
/// command line. They never end up in the image configuration.
pub const PREDEFINED_ARGS: &[&str] = &[
    "HTTP_PROXY",
    "http_proxy",
    "HTTPS_PROXY",
    "https_proxy",
    "FTP_PROXY",
    "ftp_proxy",
    "NO_PROXY",
    "no_proxy",
    "ALL_PROXY",
    "all_proxy",
];

/// Build arguments visible to instructions.
///
/// Holds the command-line overrides and every name declared so far by
/// `ARG`. A declared name takes the override value when one was given,
/// otherwise its declared default.
#[derive(Debug, Clone, Default)]
pub struct BuildArgs {
    overrides: BTreeMap<String, String>,
    declared: BTreeMap<String, Option<String>>,
}

impl BuildArgs {
    pub fn new(overrides: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            overrides: overrides.into_iter().collect(),
            declared: BTreeMap::new(),
        }
    }

    /// Declare `name`, with an already-expanded default.
    pub fn declare(&mut self, name: &str, default: Option<String>) {
        let value = self.overrides.get(name).cloned().or(default);
        self.declared.insert(name.to_string(), value);
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.declared.contains_key(name)
    }

    /// Current value of a declared or predefined argument.
    pub fn value(&self, name: &str) -> Option<&str> {
        match self.declared.get(name) {
            Some(value) => value.as_deref(),
            None if PREDEFINED_ARGS.contains(&name) => self.overrides.get(name).map(String::as_str),
            None => None,
        }
    }

    /// Declared arguments and overridden predefined arguments.
    /// Declared names without a value map to the empty string.
    pub fn visible(&self) -> BTreeMap<String, String> {
        let mut visible: BTreeMap<String, String> = self
            .declared
            .iter()
            .map(|(name, value)| (name.clone(), value.clone().unwrap_or_default()))
            .collect();
        for name in PREDEFINED_ARGS {
            if let Some(value) = self.overrides.get(*name) {
                visible
                    .entry(name.to_string())
                    .or_insert_with(|| value.clone());
            }
        }
        visible
    }

    /// Overrides that no `ARG` consumed.
    pub fn unused_overrides(&self) -> Vec<&str> {
        self.overrides
            .keys()
            .filter(|name| !self.declared.contains_key(*name))
            .filter(|name| !PREDEFINED_ARGS.contains(&name.as_str()))
            .map(String::as_str)
            .collect()
    }

    /// Variables available for substitution: visible args overlaid with
    /// the image environment, which wins on conflicts.
    pub fn replacement_envs(&self, config: &ImageConfig) -> BTreeMap<String, String> {
        let mut envs = self.visible();
        for (key, value) in &config.env {
            envs.insert(key.clone(), value.clone());
        }
        envs
    }
}

/// Substitute `$VAR`, `${VAR}`, `${VAR:-default}`, `${VAR:+alt}` (and the
/// colon-less forms) in `word`. `\$` yields a literal `$`.
pub fn expand(word: &str, envs: &BTreeMap<String, String>) -> Result<String> {
    let chars: Vec<char> = word.chars().collect();
    let mut out = String::with_capacity(word.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            '\\' if chars.get(i + 1) == Some(&'$') => {
                out.push('$');
                i += 2;
            }
            '$' if chars.get(i + 1) == Some(&'{') => {
                let close = chars[i + 2..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|p| p + i + 2)
                    .ok_or_else(|| {
                        BuildError::Resolution(format!("missing '}}' in '{}'", word))
                    })?;
                let body: String = chars[i + 2..close].iter().collect();
                out.push_str(&expand_braced(&body, envs, word)?);
                i = close + 1;
            }
            '$' if chars.get(i + 1).map_or(false, |c| is_name_start(*c)) => {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && is_name_char(chars[end]) {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                out.push_str(lookup(&name, envs)?);
                i = end;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Expand each word in order.
pub fn expand_all(words: &[String], envs: &BTreeMap<String, String>) -> Result<Vec<String>> {
    words.iter().map(|w| expand(w, envs)).collect()
}

fn expand_braced(body: &str, envs: &BTreeMap<String, String>, word: &str) -> Result<String> {
    let name_end = body
        .char_indices()
        .find(|(_, c)| !is_name_char(*c))
        .map_or(body.len(), |(i, _)| i);
    let (name, modifier) = body.split_at(name_end);
    if name.is_empty() || !name.starts_with(is_name_start) {
        return Err(BuildError::Resolution(format!(
            "bad substitution '${{{}}}' in '{}'",
            body, word
        )));
    }

    let value = envs.get(name);
    let set_non_empty = value.map_or(false, |v| !v.is_empty());
    let resolved = match modifier {
        "" => lookup(name, envs)?.to_string(),
        m if m.starts_with(":-") => match value {
            Some(v) if set_non_empty => v.clone(),
            _ => expand(&m[2..], envs)?,
        },
        m if m.starts_with(":+") => {
            if set_non_empty {
                expand(&m[2..], envs)?
            } else {
                String::new()
            }
        }
        m if m.starts_with('-') => match value {
            Some(v) => v.clone(),
            None => expand(&m[1..], envs)?,
        },
        m if m.starts_with('+') => match value {
            Some(_) => expand(&m[1..], envs)?,
            None => String::new(),
        },
        _ => {
            return Err(BuildError::Resolution(format!(
                "unsupported modifier in '${{{}}}'",
                body
            )))
        }
    };
    Ok(resolved)
}

fn lookup<'a>(name: &str, envs: &'a BTreeMap<String, String>) -> Result<&'a str> {
    envs.get(name).map(String::as_str).ok_or_else(|| {
        BuildError::Resolution(format!(
            "variable '{}' is not declared and has no default",
            name
        ))
    })
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}
