//! Error types for process supervision

use std::path::PathBuf;
use std::time::Duration;

use procwatch_text::TextError;
use thiserror::Error;

/// Errors surfaced by [`crate::ManagedProcess`] and its collaborators.
///
/// The first five variants are fatal precondition violations (programmer
/// error — the process never runs). `Timeout` is the one expected, caller-
/// recoverable failure and carries everything captured up to the deadline.
#[derive(Error, Debug)]
pub enum ProcError {
    #[error("process already started, call clean() before starting it again")]
    AlreadyStarted,

    #[error("process is not started")]
    NotStarted,

    #[error("working directory does not exist: {}", path.display())]
    WorkdirMissing { path: PathBuf },

    #[error("executable not found: {}", path.display())]
    ExecutableNotFound { path: PathBuf },

    #[error("merge option requires both stdout and stderr collection enabled")]
    MergeRequiresBothStreams,

    #[error("command '{command}' timed out after {timeout:?}")]
    Timeout {
        command: String,
        timeout: Duration,
        /// Stdout lines captured before the deadline.
        stdout: Vec<String>,
        /// Stderr lines captured before the deadline.
        stderr: Vec<String>,
    },

    #[error(transparent)]
    Text(#[from] TextError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
