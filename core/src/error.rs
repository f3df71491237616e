use thiserror::Error;

/// Kiln build error types
#[derive(Error, Debug)]
pub enum BuildError {
    /// Unresolvable variable reference or wildcard
    #[error("Resolution error: {0}")]
    Resolution(String),

    /// An instruction's native effect failed (I/O, permissions, subprocess exit)
    #[error("Effect error: {message}")]
    Effect {
        message: String,
        exit_code: Option<i32>,
    },

    /// Filesystem diff or layer archive construction failed
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// A cache entry is malformed or does not hold exactly one layer
    #[error("Cache corruption: {key} - {message}")]
    CacheCorruption { key: String, message: String },

    /// Registry, cache store or remote fetch failure
    #[error("Transport error: {target} - {message}")]
    Transport { target: String, message: String },

    /// Failure while executing a specific instruction
    #[error("step {index} `{instruction}` failed: {source}")]
    Step {
        index: usize,
        instruction: String,
        #[source]
        source: Box<BuildError>,
    },

    /// Build file could not be parsed
    #[error("Parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// OCI image layout error
    #[error("OCI image error: {0}")]
    OciImage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BuildError {
    /// Build an effect error that carries no subprocess exit code.
    pub fn effect(message: impl Into<String>) -> Self {
        BuildError::Effect {
            message: message.into(),
            exit_code: None,
        }
    }

    /// Wrap an error with the instruction that raised it.
    pub fn at_step(self, index: usize, instruction: impl Into<String>) -> Self {
        BuildError::Step {
            index,
            instruction: instruction.into(),
            source: Box::new(self),
        }
    }

    /// Exit code of the subprocess that caused this failure, if any.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            BuildError::Effect { exit_code, .. } => *exit_code,
            BuildError::Step { source, .. } => source.exit_code(),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for BuildError {
    fn from(err: serde_json::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for BuildError {
    fn from(err: serde_yaml::Error) -> Self {
        BuildError::Serialization(err.to_string())
    }
}

/// Result type alias for kiln operations
pub type Result<T> = std::result::Result<T, BuildError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_error_display() {
        let error = BuildError::Resolution("undefined variable: FOO".to_string());
        assert_eq!(error.to_string(), "Resolution error: undefined variable: FOO");
    }

    #[test]
    fn test_effect_error_display() {
        let error = BuildError::Effect {
            message: "command exited with status 42".to_string(),
            exit_code: Some(42),
        };
        assert_eq!(error.to_string(), "Effect error: command exited with status 42");
    }

    #[test]
    fn test_cache_corruption_display() {
        let error = BuildError::CacheCorruption {
            key: "abc".to_string(),
            message: "expected 1 layer but got 2".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Cache corruption: abc - expected 1 layer but got 2"
        );
    }

    #[test]
    fn test_transport_error_display() {
        let error = BuildError::Transport {
            target: "ghcr.io".to_string(),
            message: "connection refused".to_string(),
        };
        assert_eq!(error.to_string(), "Transport error: ghcr.io - connection refused");
    }

    #[test]
    fn test_step_error_display() {
        let error = BuildError::Snapshot("walk failed".to_string()).at_step(3, "COPY a b");
        assert_eq!(
            error.to_string(),
            "step 3 `COPY a b` failed: Snapshot error: walk failed"
        );
    }

    #[test]
    fn test_exit_code_direct() {
        let error = BuildError::Effect {
            message: "failed".to_string(),
            exit_code: Some(42),
        };
        assert_eq!(error.exit_code(), Some(42));
    }

    #[test]
    fn test_exit_code_through_step() {
        let error = BuildError::Effect {
            message: "failed".to_string(),
            exit_code: Some(7),
        }
        .at_step(2, "RUN false");
        assert_eq!(error.exit_code(), Some(7));
    }

    #[test]
    fn test_exit_code_absent() {
        assert_eq!(BuildError::effect("no subprocess").exit_code(), None);
        assert_eq!(BuildError::Other("x".to_string()).exit_code(), None);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let error: BuildError = io_error.into();
        assert!(matches!(error, BuildError::Io(_)));
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_serde_json_error_conversion() {
        let result: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ invalid");
        let error: BuildError = result.unwrap_err().into();
        assert!(matches!(error, BuildError::Serialization(_)));
    }

    #[test]
    fn test_serde_yaml_error_conversion() {
        let result: std::result::Result<serde_yaml::Value, _> =
            serde_yaml::from_str("invalid: yaml: content:");
        let error: BuildError = result.unwrap_err().into();
        assert!(matches!(error, BuildError::Serialization(_)));
    }
}
