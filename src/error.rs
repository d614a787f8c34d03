//! Error types for framewire.

use thiserror::Error;

/// Result type alias using framewire's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for framewire operations.
///
/// Queue-level transients (empty on consumer peek, full on producer peek)
/// are not errors: the peek operations return `Option` and the scheduler
/// retries. Only wiring mistakes and pipeline lifecycle misuse surface here.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid connection: unsupported codec, missing pixel format,
    /// incompatible sample format, or a shape/arity violation.
    #[error("wiring error: {0}")]
    Wiring(String),

    /// Pipeline lifecycle or registry error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// A filter rejected an operation outside the normal cycle contract.
    #[error("filter error: {0}")]
    Filter(String),

    /// I/O error (filters with external I/O propagate through this).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
