//! Error handling for the herald foundation layer.
//!
//! The main error type for this crate is [`CoreError`], which wraps the more
//! specific [`ConfigError`] and [`LoggingError`]. The domain layer defines its
//! own error type and converts from these where it touches the foundation
//! (configuration loading, policy-file persistence).

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Foundation error type shared by everything below the domain layer.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Configuration loading, parsing, or validation failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The logging system could not be initialized.
    #[error("logging error: {0}")]
    Logging(#[from] LoggingError),

    /// A filesystem operation failed. Carries the path so callers can report
    /// which file is affected without re-deriving it.
    #[error("filesystem error: {message} (path: {path:?})")]
    Filesystem {
        message: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O failure not tied to a specific known path.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected internal failure in the foundation layer.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path:?}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The file parsed but contains values that make no sense together
    /// (zero quotas, negative delays encoded as huge integers, ...).
    #[error("configuration validation failed: {0}")]
    Validation(String),

    #[error("could not determine base directory for {dir_type}")]
    DirectoryUnavailable { dir_type: String },
}

/// Errors raised while bringing up the tracing stack.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    Initialization(String),

    #[error("invalid log filter: {0}")]
    Filter(String),

    #[error("logging i/o error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io::ErrorKind;

    #[test]
    fn config_error_wraps_into_core_error() {
        let err = CoreError::from(ConfigError::Validation("bad quota".into()));
        assert_eq!(
            err.to_string(),
            "configuration error: configuration validation failed: bad quota"
        );
        assert!(err.source().is_some());
    }

    #[test]
    fn filesystem_error_reports_path_and_source() {
        let path = PathBuf::from("/var/lib/herald/policy.toml");
        let err = CoreError::Filesystem {
            message: "rename failed".into(),
            path: path.clone(),
            source: io::Error::new(ErrorKind::PermissionDenied, "denied"),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("rename failed"));
        assert!(rendered.contains("policy.toml"));
        let source = err.source().unwrap().downcast_ref::<io::Error>().unwrap();
        assert_eq!(source.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn parse_error_converts_from_toml() {
        let toml_err = toml::from_str::<toml::Value>("not = = toml").unwrap_err();
        let err = ConfigError::from(toml_err);
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
