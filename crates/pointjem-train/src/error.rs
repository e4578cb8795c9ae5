//! Error types for pointjem training
//!
//! Wraps the loss engine's fatal errors and adds the I/O-flavoured failures of
//! the training loop.

use pointjem_core::JemError;
use thiserror::Error;

/// Main error type for training operations
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TrainError {
    /// Loss-engine failures (configuration, numeric domain, distributed context)
    #[error(transparent)]
    Core(#[from] JemError),

    /// Errors from the Candle tensor library
    #[error("Candle error: {0}")]
    Candle(String),

    /// Checkpoint save/load failures
    #[error("Checkpoint error at '{path}': {message}")]
    Checkpoint { message: String, path: String },

    /// Configuration validation failures
    #[error("Configuration error: {0}")]
    Config(String),

    /// Non-finite training loss
    #[error("Training diverged at step {step}: loss={loss}")]
    Divergence { loss: f64, step: usize },

    /// I/O errors with path context
    #[error("IO error at '{path}': {message}")]
    Io { message: String, path: String },
}

/// Result type alias for training operations
pub type TrainResult<T> = std::result::Result<T, TrainError>;

impl TrainError {
    /// Filesystem failures may succeed on a later attempt; everything else
    /// is a bug in the run's setup or a diverged model.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TrainError::Io { .. } | TrainError::Checkpoint { .. })
    }

    /// Get the path associated with this error (if any)
    pub fn path(&self) -> Option<&str> {
        match self {
            TrainError::Checkpoint { path, .. } => Some(path),
            TrainError::Io { path, .. } => Some(path),
            _ => None,
        }
    }
}

impl From<candle_core::Error> for TrainError {
    fn from(err: candle_core::Error) -> Self {
        TrainError::Candle(err.to_string())
    }
}

impl From<std::io::Error> for TrainError {
    fn from(err: std::io::Error) -> Self {
        TrainError::Io {
            message: err.to_string(),
            path: String::new(),
        }
    }
}

impl From<serde_json::Error> for TrainError {
    fn from(err: serde_json::Error) -> Self {
        TrainError::Config(format!("json: {}", err))
    }
}

/// Helper trait for adding path context to IO operations
pub trait IoResultExt<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path<P: AsRef<std::path::Path>>(self, path: P) -> TrainResult<T> {
        self.map_err(|e| TrainError::Io {
            message: e.to_string(),
            path: path.as_ref().display().to_string(),
        })
    }
}

/// Helper for creating checkpoint errors
pub fn checkpoint_error<P: AsRef<std::path::Path>>(
    message: impl Into<String>,
    path: P,
) -> TrainError {
    TrainError::Checkpoint {
        message: message.into(),
        path: path.as_ref().display().to_string(),
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> TrainError {
    TrainError::Config(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recoverability() {
        assert!(checkpoint_error("x", "/tmp").is_recoverable());
        assert!(!config_error("x").is_recoverable());
        assert!(TrainError::Io {
            message: "test".to_string(),
            path: "/tmp".to_string(),
        }
        .is_recoverable());
        assert!(!TrainError::Divergence {
            loss: f64::NAN,
            step: 3,
        }
        .is_recoverable());
        assert!(!TrainError::from(pointjem_core::error::config_error("bin")).is_recoverable());
    }

    #[test]
    fn test_core_and_candle_errors_stay_distinct() {
        let core = TrainError::from(pointjem_core::error::context_error("no group"));
        assert!(matches!(core, TrainError::Core(JemError::DistributedContext(_))));
        let plain = candle_core::Error::Msg("boom".to_string());
        assert!(matches!(TrainError::from(plain), TrainError::Candle(_)));
    }

    #[test]
    fn test_io_with_path() {
        let result: std::io::Result<()> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));
        let train_result: TrainResult<()> = result.with_path("/tmp/missing.json");

        match train_result {
            Err(TrainError::Io { path, .. }) => assert_eq!(path, "/tmp/missing.json"),
            _ => panic!("Expected IO error with path"),
        }
        assert_eq!(checkpoint_error("failed", "/tmp/ckpt").path(), Some("/tmp/ckpt"));
    }
}
