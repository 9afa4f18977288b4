//! Error type shared by settings validation, rig configuration and waveform synthesis.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An [`ExperimentSettings`](crate::settings::ExperimentSettings) violates one of its invariants.
    #[error("invalid experiment settings: {0}")]
    InvalidSettings(String),

    /// Hardware parameters or a waveform name outside of what the rig supports.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("settings file I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("settings (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
