//! Shared types for the process supervision layer

/// Which standard stream a capture is bound to. Selects the backing-file
/// suffix and the prefix used in log-callback lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    /// Suffix of the backing file allocated for this stream.
    #[must_use]
    pub const fn file_suffix(self) -> &'static str {
        match self {
            Self::Stdout => ".popen.stdout",
            Self::Stderr => ".popen.stderr",
        }
    }

    /// Human-readable stream label for log lines.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// Result of a completed process run.
///
/// In merge mode `stderr` is always empty: both streams share one backing
/// file and their lines arrive interleaved, in write order, in `stdout`.
#[derive(Debug, Clone)]
pub struct ProcResult {
    /// Exit code of the child, `None` if it was terminated by a signal.
    pub returncode: Option<i32>,
    /// Decoded stdout lines in file order.
    pub stdout: Vec<String>,
    /// Decoded stderr lines in file order.
    pub stderr: Vec<String>,
}

impl ProcResult {
    /// True iff the child exited with code 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.returncode == Some(0)
    }
}
