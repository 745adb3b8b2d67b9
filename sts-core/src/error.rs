//! Structured error types for the sts placement engine.

use thiserror::Error;

/// Failure reported by a likelihood backend.
///
/// Every variant indicates a contract violation by the caller (usually a
/// buffer-indexing bug), never a user-recoverable condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// Partials buffer index outside the allocated pool.
    #[error("buffer index {index} out of range ({limit} buffers)")]
    BufferOutOfRange { index: usize, limit: usize },

    /// Transition matrix index outside the allocated pool.
    #[error("matrix index {index} out of range ({limit} matrices)")]
    MatrixOutOfRange { index: usize, limit: usize },

    /// Scale buffer index outside the allocated pool.
    #[error("scale buffer index {index} out of range ({limit} scale buffers)")]
    ScaleBufferOutOfRange { index: usize, limit: usize },

    /// Negative, NaN or infinite branch length.
    #[error("invalid branch length: {0}")]
    InvalidBranchLength(f64),

    /// A required piece of model state was never pushed to the backend.
    #[error("backend used before {0} was set")]
    Uninitialized(&'static str),

    /// Input slice of the wrong length.
    #[error("{what}: expected {expected} values, got {got}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// An operation reads and writes the same buffer.
    #[error("operation writes buffer {0} while reading it")]
    AliasedBuffers(usize),
}

/// Unified error type for all sts operations.
#[derive(Debug, Error)]
pub enum StsError {
    /// Invalid input (bad arguments, malformed trees, out-of-range values)
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Engine misconfiguration (duplicate leaves, model not loaded, ...)
    #[error("initialization error: {0}")]
    Initialization(String),

    /// Not enough scratch buffers to lend out
    #[error("insufficient free buffers: requested {requested}, available {available}")]
    InsufficientBuffers { requested: usize, available: usize },

    /// Likelihood backend contract violation
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Iteration or error budget exceeded in a numerical routine
    #[error("numerical non-convergence: {0}")]
    Convergence(String),
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, StsError>;
