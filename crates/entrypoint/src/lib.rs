//! SkyFlow step entrypoint.
//!
//! Runs as the command of every step container. Steps of one task share a
//! pod and a set of volumes; this program decodes the step's script, waits
//! for the previous step's marker file, runs the script, reports declared
//! results through the termination message and writes its own marker.

pub mod args;
pub mod error;
pub mod sequencer;
pub mod termination;

pub use args::Args;
pub use error::{EntrypointError, EntrypointResult};
