//! Custom error types for the application.
//!
//! This module defines the primary error type, `CondError`, for the whole
//! conditioning controller. Using the `thiserror` crate, it provides one place
//! to classify what can go wrong during a session.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: Wraps errors from `figment`, typically file parsing or type
//!   mismatches in the configuration file or environment overrides.
//! - **`Configuration`**: Semantic errors in values that parsed fine but are
//!   inconsistent (unknown protocol class, odor index out of range, negative
//!   duration). These are fatal to entering trial execution and recoverable by
//!   correcting the configuration and retrying the block.
//! - **`Device`**: Hardware creation, start or stop failures. Surfaced to the
//!   operator immediately; nothing retries them automatically.
//! - **`Encode`**: A single frame could not be encoded. Writers log these and
//!   drop the frame; they never propagate out of the writer thread.
//! - **`Io`** / **`Csv`**: file system failures while logging or recording.
//!
//! Device drivers themselves report `anyhow::Error`; the coordinator wraps
//! those into `Device` with the device name attached.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, CondError>;

#[derive(Error, Debug)]
pub enum CondError {
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Invalid session state: {0}")]
    InvalidState(String),

    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),

    #[error("Feature '{0}' is enabled but not yet implemented. {1}")]
    FeatureIncomplete(String, String),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<CondError>),

    #[error("Session is no longer running")]
    SessionClosed,
}

impl CondError {
    /// Wraps a driver error with the name of the device that raised it.
    pub fn device(name: &str, err: impl std::fmt::Display) -> Self {
        CondError::Device(format!("{}: {}", name, err))
    }

    /// True for errors the operator fixes by editing configuration.
    pub fn is_config(&self) -> bool {
        matches!(self, CondError::Config(_) | CondError::Configuration(_))
    }

    /// True for hardware faults.
    pub fn is_device(&self) -> bool {
        match self {
            CondError::Device(_) => true,
            CondError::ShutdownFailed(errors) => errors.iter().any(CondError::is_device),
            _ => false,
        }
    }
}
