//! Error types for EcoFreq.

use std::io;
use thiserror::Error;

/// Result type alias for EcoFreq operations.
pub type Result<T> = std::result::Result<T, EcoError>;

/// Main error type for EcoFreq.
#[derive(Error, Debug)]
pub enum EcoError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Required backend (driver, sysfs node or CLI tool) is missing
    #[error("Backend not available: {0}")]
    Unavailable(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// External command failed
    #[error("Command failed: {0}")]
    CommandFailed(String),

    /// Upstream provider failure
    #[error("Provider error: {0}")]
    Provider(String),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IPC error
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl EcoError {
    /// Whether the error should abort startup with a run-as-root hint.
    pub fn is_permission(&self) -> bool {
        match self {
            EcoError::PermissionDenied(_) => true,
            EcoError::Io(e) => e.kind() == io::ErrorKind::PermissionDenied,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = EcoError::Config("unknown governor: foo".into());
        assert_eq!(err.to_string(), "Configuration error: unknown governor: foo");
        let err = EcoError::Unavailable("RAPL powercap".into());
        assert!(err.to_string().contains("RAPL"));
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing sysfs node");
        let err: EcoError = io_err.into();
        assert!(err.to_string().contains("missing sysfs node"));
        assert!(!err.is_permission());
    }

    #[test]
    fn test_permission_detection() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "powercap write");
        let err: EcoError = io_err.into();
        assert!(err.is_permission());
        assert!(EcoError::PermissionDenied("msr".into()).is_permission());
    }
}
