//! Process supervision with bounded, simultaneously-readable output capture
//!
//! A [`ManagedProcess`] owns one child process end to end: it spawns it with
//! stdout/stderr redirected into file-backed [`StreamCapture`]s, polls
//! liveness while draining decoded lines, enforces an optional deadline, and
//! tears the whole process tree down on [`ManagedProcess::kill`].
//!
//! Capturing through a regular file instead of an OS pipe sidesteps the
//! classic deadlock where a child blocks on a full pipe while the supervisor
//! blocks waiting for exit: the child can always write, and the supervisor
//! catches up at its own pace. A background monitor keeps each backing file
//! within a configured size budget by resetting it, which is deliberately
//! lossy under sustained overflow — see [`StreamCapture`].

pub mod capture;
pub mod error;
pub mod kill;
pub mod process;
pub mod shell;
pub mod types;

pub use capture::StreamCapture;
pub use error::ProcError;
pub use kill::kill_process_tree;
pub use process::{LogCallback, ManagedProcess};
pub use shell::{run_bash_command, run_bash_script};
pub use types::{ProcResult, StreamKind};
