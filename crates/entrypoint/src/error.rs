//! Step sequencer error types.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Errors that end a step.
#[derive(Debug, Error)]
pub enum EntrypointError {
    /// File system error on a protocol file.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Script file is not valid base64.
    #[error("Decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    /// Step command could not be started.
    #[error("Process error: {0}")]
    Process(String),

    /// Step command exited unsuccessfully.
    #[error("command exited with code {code}")]
    CommandFailed { code: i32 },

    /// An earlier step failed; this one never ran.
    #[error("previous step failed, marker {}", .0.display())]
    Aborted(PathBuf),

    /// Serialized results exceed the termination message limit.
    #[error("termination message too large: {0} bytes")]
    TerminationMessageTooLarge(usize),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias using EntrypointError.
pub type EntrypointResult<T> = Result<T, EntrypointError>;

impl EntrypointError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| EntrypointError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Process exit status for this error. A failed command passes its own
    /// code through when it fits.
    pub fn exit_code(&self) -> u8 {
        match self {
            EntrypointError::CommandFailed { code } => u8::try_from(*code)
                .ok()
                .filter(|code| *code != 0)
                .unwrap_or(1),
            _ => 1,
        }
    }
}
