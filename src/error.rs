//! Error handling module for modrun
//!
//! Each subsystem owns a focused error enum (`LoadError`, `DispatchError`,
//! `ResolveError`, ...). `ModrunError` is the umbrella type used at the
//! application edge so callers can propagate any of them with `?`.

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::dispatch::DispatchError;
use crate::manifest::ManifestError;
use crate::module::LoadError;
use crate::registry::{RegistryError, ResolveError};

/// Main error type for modrun
#[derive(Error, Debug)]
pub enum ModrunError {
    /// IO errors (reading definitions, scanning plugin trees)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Module definition could not be loaded
    #[error("Load error: {0}")]
    Load(#[from] LoadError),

    /// Module run halted
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Plugin tree could not be scanned
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Plugin could not be turned into a handler
    #[error("Resolution error: {0}")]
    Resolve(#[from] ResolveError),

    /// Plugin manifest errors
    #[error("Manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Startup environment errors
    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// General errors (catch-all for edge cases)
    #[error("{0}")]
    General(String),
}

/// Result type alias for modrun operations
pub type Result<T> = std::result::Result<T, ModrunError>;

impl ModrunError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a general error
    pub fn general(msg: impl Into<String>) -> Self {
        Self::General(msg.into())
    }

    /// Process exit code for this error when it terminates the binary.
    ///
    /// Load failures never reach dispatch and exit with 2; run failures exit
    /// with 1; everything else is a setup problem (3).
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Load(_) => 2,
            Self::Dispatch(_) => 1,
            _ => 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ModrunError::config("workers must be at least 1");
        assert_eq!(
            err.to_string(),
            "Configuration error: workers must be at least 1"
        );

        let err = ModrunError::general("something odd");
        assert_eq!(err.to_string(), "something odd");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ModrunError = io_err.into();
        assert!(matches!(err, ModrunError::Io(_)));
    }

    #[test]
    fn test_exit_codes() {
        let load: ModrunError = LoadError::MissingParameter {
            name: "HOST".to_string(),
        }
        .into();
        assert_eq!(load.exit_code(), 2);

        let dispatch: ModrunError = DispatchError::UnknownLibrary {
            index: 1,
            library: "nope_scan".to_string(),
        }
        .into();
        assert_eq!(dispatch.exit_code(), 1);

        assert_eq!(ModrunError::config("x").exit_code(), 3);
    }
}
