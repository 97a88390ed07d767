//! Custom error types for the application.
//!
//! This module defines the primary error type, `ImagerError`, for the entire crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of errors an acquisition session can produce.
//!
//! ## Error Hierarchy
//!
//! - **`ConfigLoad`**: Wraps errors from `figment` when the configuration file or the
//!   environment overrides cannot be parsed.
//! - **`Configuration`**: Semantic configuration errors such as a group with zero images,
//!   a non-positive exposure or more groups than the sequencer can hold. Rejected
//!   synchronously; the sequencer state is left untouched.
//! - **`Busy`**: An operation that is only valid while idle (configure, rebinding devices,
//!   start) was attempted while a batch is running.
//! - **`DeviceNotAssigned`** / **`DeviceNotConnected`**: A batch cannot start because a
//!   required device is missing or offline.
//! - **`Storage`**: The image store could not read back a frame.
//! - **`AgentStopped`**: The agent task has shut down and can no longer take requests.
//!
//! Nothing here is fatal to the process: after any error the sequencer returns to
//! `Idle` and can be started again.

use crate::imager::BatchState;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, ImagerError>;

#[derive(Error, Debug)]
pub enum ImagerError {
    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Sequencer is busy ({0}); operation requires Idle")]
    Busy(BatchState),

    #[error("No {0} assigned to the imager")]
    DeviceNotAssigned(&'static str),

    #[error("Device '{0}' is not connected")]
    DeviceNotConnected(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Imager agent has stopped")]
    AgentStopped,
}

impl ImagerError {
    /// Whether the error was raised by argument or state validation at the API boundary.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ImagerError::Configuration(_)
                | ImagerError::Busy(_)
                | ImagerError::DeviceNotAssigned(_)
                | ImagerError::DeviceNotConnected(_)
        )
    }
}
