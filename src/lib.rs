//! procwatch - process supervision with bounded output capture
//!
//! procwatch launches and supervises external processes while capturing
//! their stdout/stderr incrementally, safely, and without unbounded growth,
//! even when the child outruns the supervisor or never stops writing.
//!
//! Three coupled problems are handled by one engine:
//!
//! - **Pipe deadlock avoidance**: the child writes into a regular backing
//!   file instead of an OS pipe, so it can never block on a full pipe while
//!   the supervisor blocks waiting for exit.
//! - **Bounded capture**: a background monitor keeps each backing file
//!   within a size budget by resetting it once it passes 1.5x the budget.
//!   Deliberately lossy under sustained overflow; the loss is counted and
//!   logged, never silent.
//! - **Adaptive decoding**: captured bytes are decoded line by line with an
//!   encoding learned mid-stream on the first decode failure, degrading to
//!   replacement characters instead of failing outright.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use procwatch::ManagedProcess;
//! use std::time::Duration;
//!
//! let mut proc = ManagedProcess::new("/bin/sh")
//!     .arg("-c")
//!     .arg("echo hello; echo oops >&2")
//!     .label("demo");
//!
//! let result = proc.run(Some(Duration::from_secs(30))).unwrap();
//! assert_eq!(result.stdout, vec!["hello"]);
//! assert_eq!(result.stderr, vec!["oops"]);
//! ```
//!
//! One-shot shell commands go through [`run_bash_command`] /
//! [`run_bash_script`], which are thin call-throughs to the same controller.

pub mod logging;

pub use procwatch_runner::{
    LogCallback, ManagedProcess, ProcError, ProcResult, StreamCapture, StreamKind,
    kill_process_tree, run_bash_command, run_bash_script,
};
pub use procwatch_text::{
    LineReader, TextError, convert_file_to_utf8, decode_bytes_to_utf8, detect_bytes_encoding,
    detect_file_encoding, read_text_range,
};
