//! Error types for sweep-bench-core

use std::path::PathBuf;

use thiserror::Error;

use crate::config::ConfigError;

/// Core error type
///
/// Only run-level failures live here. A workload process that exits
/// non-zero or prints garbage is an [`InvocationFailure`](crate::InvocationFailure)
/// value that invalidates its grid point, not an `Err`.
#[derive(Error, Debug)]
pub enum BenchError {
    /// Invalid axis definitions or run constants
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The workload executable could not be started
    #[error("failed to launch workload {program}: {source}")]
    Launch {
        /// Executable that failed to start
        program: PathBuf,
        /// Underlying spawn error
        #[source]
        source: std::io::Error,
    },

    /// An output file could not be written
    #[error("failed to persist {path}: {source}")]
    Persistence {
        /// Destination that could not be written
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },

    /// The sweep was interrupted before finishing
    #[error("sweep cancelled while running {point}")]
    Cancelled {
        /// Label of the grid point that was in flight
        point: String,
    },

    /// Internal scheduling error (task panic, closed channel)
    #[error("scheduler error: {0}")]
    Scheduler(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BenchError {
    /// Shorthand for a persistence failure at `path`
    pub fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }

    /// Shorthand for an internal scheduler failure
    pub fn scheduler(msg: impl Into<String>) -> Self {
        Self::Scheduler(msg.into())
    }

    /// Whether this error must stop the whole sweep
    ///
    /// Persistence failures are local to one grid point; everything else
    /// aborts the run.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Persistence { .. })
    }
}

/// Result type alias
pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_persistence_is_not_fatal() {
        let err = BenchError::persistence(
            "/tmp/out.json",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("/tmp/out.json"));
    }

    #[test]
    fn test_launch_is_fatal() {
        let err = BenchError::Launch {
            program: PathBuf::from("/missing/workload"),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(err.is_fatal());
        assert!(err.to_string().contains("/missing/workload"));
    }

    #[test]
    fn test_config_error_conversion() {
        let err: BenchError = ConfigError::EmptyAxis("size").into();
        assert!(matches!(err, BenchError::Config(_)));
        assert!(err.is_fatal());
    }
}
