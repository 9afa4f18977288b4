//! Error types for acquisition and aggregation.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Settings validation or waveform synthesis failed before any hardware was touched.
    #[error(transparent)]
    Compile(#[from] pvcompiler_backend::Error),

    /// Acquisition parameters outside of what the card supports. Raised before any hardware call.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("DAQmx error {code}: {message}")]
    Hardware { code: i32, message: String },

    #[error("DAQmx warning {code}: {message}")]
    HardwareWarning { code: i32, message: String },

    /// The input read did not complete within the configured timeout.
    #[error("DAQmx read timed out after {timeout_s} s: {message}")]
    HardwareTimeout { timeout_s: f64, message: String },

    #[error("measurement queue is empty")]
    EmptyQueue,

    #[error("buffer layout mismatch: expected {expected} values, got {actual}")]
    LayoutMismatch { expected: usize, actual: usize },

    #[error("measurement cancelled")]
    Cancelled,

    #[error("measurement worker: {0}")]
    Worker(String),
}

impl Error {
    /// True for errors reported by the card itself, timeouts included.
    pub fn is_hardware(&self) -> bool {
        matches!(
            self,
            Error::Hardware { .. } | Error::HardwareWarning { .. } | Error::HardwareTimeout { .. }
        )
    }
}
