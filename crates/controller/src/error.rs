//! Error types for the SkyFlow controller.

use std::panic::Location;

use thiserror::Error;
use tracing::error;

/// Errors raised while reconciling a workflow.
#[derive(Error, Debug)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A task depends on a name that is not defined before it
    #[error("dependency not found: {0}")]
    DependencyNotFound(String),

    /// Task timeout is not a valid duration
    #[error("invalid timeout {value:?} for task {task}")]
    InvalidTimeout { task: String, value: String },

    /// Required object field is unset
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// Execution unit could not be created
    #[error("failed to create execution unit for task {task}: {reason}")]
    UnitCreation { task: String, reason: String },

    /// Step termination message over the platform limit
    #[error("termination message too large: {0} bytes")]
    TerminationMessageTooLarge(usize),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using ControllerError.
pub type ControllerResult<T> = Result<T, ControllerError>;

impl From<envy::Error> for ControllerError {
    fn from(err: envy::Error) -> Self {
        ControllerError::Config(err.to_string())
    }
}

/// Records a failed controller call where it happened. The runtime's error
/// policy only sees the error value once it has been returned.
pub trait ResultExt {
    /// Log an `Err` at error level with `action` and the calling line.
    fn log(self, action: &'static str) -> Self;
}

impl<T> ResultExt for ControllerResult<T> {
    #[track_caller]
    fn log(self, action: &'static str) -> Self {
        if let Err(err) = &self {
            let at = Location::caller();
            error!(error = %err, action, at = %format_args!("{}:{}", at.file(), at.line()), "Controller call failed");
        }
        self
    }
}
