//! Typed failures of the loss engine.
//!
//! Every variant is fatal for a training run: shape contracts are checked at
//! construction, the log domain is guarded by the encoder floor, and a
//! collective without a communicator is a wiring bug. None of them is retried.

use thiserror::Error;

/// Main error type for loss-engine operations.
#[derive(Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum JemError {
    /// Unsatisfiable run configuration (block layout, temperature, coefficients).
    #[error("Configuration error: {0}")]
    Config(String),

    /// A probability reached `log` outside of (0, inf).
    #[error("Numeric domain error in {term}: probability {value:e} is not strictly positive and finite")]
    NumericDomain { term: &'static str, value: f64 },

    /// Collective requested without an initialized multi-device context.
    #[error("Distributed context error: {0}")]
    DistributedContext(String),

    /// Embedding batch does not match the configured layout.
    #[error("Tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    /// Errors from the Candle tensor library.
    #[error("Candle error: {0}")]
    Candle(String),
}

/// Result type alias for loss-engine operations.
pub type JemResult<T> = std::result::Result<T, JemError>;

impl JemError {
    /// Loss-engine failures are never transient.
    pub fn is_recoverable(&self) -> bool {
        false
    }

    pub fn is_config(&self) -> bool {
        matches!(self, JemError::Config(_))
    }

    pub fn is_distributed(&self) -> bool {
        matches!(self, JemError::DistributedContext(_))
    }
}

impl From<candle_core::Error> for JemError {
    fn from(err: candle_core::Error) -> Self {
        JemError::Candle(err.to_string())
    }
}

/// Helper for creating config errors
pub fn config_error(message: impl Into<String>) -> JemError {
    JemError::Config(message.into())
}

/// Helper for creating distributed-context errors
pub fn context_error(message: impl Into<String>) -> JemError {
    JemError::DistributedContext(message.into())
}
