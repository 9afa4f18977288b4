//! Pulse synthesis side of the photoconductance/photoluminescence rig.
//!
//! This crate is hardware free: it validates experiment parameters against a [`RigConfig`],
//! applies the hardware safety clamps, and synthesizes the light-pulse voltage sequence that the
//! acquisition crate plays on the card.

pub mod config;
pub mod error;
pub mod settings;
pub mod utils;
pub mod waveform;

pub use config::*;
pub use error::{Error, Result};
pub use settings::*;
pub use utils::*;
pub use waveform::*;
