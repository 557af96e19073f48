//! Execution controller: one child process, start to clean
//!
//! [`ManagedProcess`] is configured up front through consuming builder
//! methods, then driven through `start` / `wait` / `kill` / `clean`. The
//! wait loop interleaves draining decoded output with liveness polling and
//! only exits when the child is gone *and* no unread output remains, so
//! nothing written before exit is dropped (short of an overflow reset).

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::fs::File;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::capture::StreamCapture;
use crate::error::ProcError;
use crate::kill::kill_process_tree;
use crate::types::{ProcResult, StreamKind};

/// Shared library appended to `LD_PRELOAD` when line-buffered output is
/// requested. Its effect on the child is opaque to this crate; all that
/// matters here is that the variable is extended, never replaced.
const LINE_BUFFER_SHIM_LIB: &str = "libstdbufctl.so";

/// Default per-stream size budget: 100 MiB.
const DEFAULT_STREAM_LIMIT: u64 = 100 * 1024 * 1024;

/// Sleep between wait-loop iterations that drained nothing, to avoid
/// busy-spinning against a quiet child.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Sink for per-line output notifications and lifecycle messages. Receives
/// pre-formatted strings like `[proc: build] [stderr] warning: ...`.
pub type LogCallback = Box<dyn FnMut(&str) + Send>;

/// Supervises a single child process with file-backed output capture.
///
/// A controller holds at most one live OS process: `start` fails on a
/// controller that is already attached, and [`ManagedProcess::clean`] must
/// run (explicitly or via the successful-`wait` path) before the next
/// `start`.
///
/// # Example
///
/// ```rust,no_run
/// use procwatch_runner::ManagedProcess;
/// use std::time::Duration;
///
/// let mut proc = ManagedProcess::new("/bin/sh")
///     .arg("-c")
///     .arg("echo hello")
///     .label("greeter");
///
/// let result = proc.run(Some(Duration::from_secs(10))).unwrap();
/// assert_eq!(result.stdout, vec!["hello"]);
/// ```
pub struct ManagedProcess {
    program: PathBuf,
    args: Vec<OsString>,
    cwd: PathBuf,
    env: Option<HashMap<OsString, OsString>>,
    collect_stdout: bool,
    collect_stderr: bool,
    merge_output: bool,
    line_buffered: bool,
    stdout_limit: Option<u64>,
    stderr_limit: Option<u64>,
    stdin_file: Option<PathBuf>,
    new_process_group: bool,
    delete_output_files: bool,
    label: String,
    callback: Option<LogCallback>,
    stdout_capture: Option<StreamCapture>,
    stderr_capture: Option<StreamCapture>,
    child: Option<Child>,
    started_at: Option<Instant>,
}

impl ManagedProcess {
    /// Create a controller for `program` with defaults: both streams
    /// collected with 100 MiB budgets, no merge, working directory `.`,
    /// inherited environment, label `"tmp"`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: PathBuf::from("."),
            env: None,
            collect_stdout: true,
            collect_stderr: true,
            merge_output: false,
            line_buffered: false,
            stdout_limit: Some(DEFAULT_STREAM_LIMIT),
            stderr_limit: Some(DEFAULT_STREAM_LIMIT),
            stdin_file: None,
            new_process_group: false,
            delete_output_files: true,
            label: "tmp".to_string(),
            callback: None,
            stdout_capture: None,
            stderr_capture: None,
            child: None,
            started_at: None,
        }
    }

    /// Append a single argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append multiple arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory. It must exist by the time `start` runs.
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = cwd.into();
        self
    }

    /// Replace the child's entire environment with `env`. Without this (or
    /// [`Self::env`]) the child inherits the parent environment.
    #[must_use]
    pub fn envs<I, K, V>(mut self, env: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env = Some(
            env.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
        self
    }

    /// Set one environment variable. The first call snapshots the parent
    /// environment as the base, so this adds to rather than replaces it.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env
            .get_or_insert_with(|| std::env::vars_os().collect())
            .insert(key.into(), value.into());
        self
    }

    /// Enable or disable stdout collection (default: enabled).
    #[must_use]
    pub fn collect_stdout(mut self, collect: bool) -> Self {
        self.collect_stdout = collect;
        self
    }

    /// Enable or disable stderr collection (default: enabled).
    #[must_use]
    pub fn collect_stderr(mut self, collect: bool) -> Self {
        self.collect_stderr = collect;
        self
    }

    /// Merge stderr into the stdout capture. Requires both collect flags;
    /// `start` rejects the configuration otherwise. In merge mode
    /// [`Self::pick_stderr`] always returns `([], 0)`.
    #[must_use]
    pub fn merge_output(mut self, merge: bool) -> Self {
        self.merge_output = merge;
        self
    }

    /// Ask the child for line-buffered output via the preload shim.
    #[must_use]
    pub fn line_buffered(mut self, enabled: bool) -> Self {
        self.line_buffered = enabled;
        self
    }

    /// Stdout size budget in bytes; `None` disables bounding.
    #[must_use]
    pub fn stdout_limit(mut self, limit: Option<u64>) -> Self {
        self.stdout_limit = limit;
        self
    }

    /// Stderr size budget in bytes; `None` disables bounding.
    #[must_use]
    pub fn stderr_limit(mut self, limit: Option<u64>) -> Self {
        self.stderr_limit = limit;
        self
    }

    /// File to feed the child on stdin. Without it stdin is inherited.
    #[must_use]
    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// Put the child in a new process group (unix).
    #[must_use]
    pub fn new_process_group(mut self, enabled: bool) -> Self {
        self.new_process_group = enabled;
        self
    }

    /// Whether a successful [`Self::wait`] deletes the backing files
    /// (default: true). With `false` they survive on disk for post-mortem
    /// inspection and their removal becomes the caller's job.
    #[must_use]
    pub fn delete_output_files(mut self, delete: bool) -> Self {
        self.delete_output_files = delete;
        self
    }

    /// Human-readable label used for backing-file names and log prefixes.
    #[must_use]
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Relabel the controller. Affects backing files of *future* captures,
    /// not ones already allocated.
    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    /// Append arguments after construction.
    pub fn append_args<I, S>(&mut self, args: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
    }

    /// Install a sink receiving one formatted message per captured line plus
    /// lifecycle messages.
    pub fn set_log_callback(&mut self, callback: LogCallback) {
        self.callback = Some(callback);
    }

    /// The command as a display string: program followed by its arguments.
    #[must_use]
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// OS process id of the attached child, if started.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    /// Wall-clock time since `start`; zero when no process is attached.
    #[must_use]
    pub fn running_time(&self) -> Duration {
        match (&self.child, self.started_at) {
            (Some(_), Some(started)) => started.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Non-blocking exit-code poll. `None` if never started, still running,
    /// or killed by a signal.
    pub fn returncode(&mut self) -> Result<Option<i32>, ProcError> {
        match self.child.as_mut() {
            None => Ok(None),
            Some(child) => Ok(child.try_wait()?.and_then(|status| status.code())),
        }
    }

    /// True iff the OS reports the child still running. Calling this before
    /// `start` is a lifecycle error.
    pub fn is_living(&mut self) -> Result<bool, ProcError> {
        let child = self.child.as_mut().ok_or(ProcError::NotStarted)?;
        Ok(child.try_wait()?.is_none())
    }

    /// Spawn the child process.
    ///
    /// Fatal preconditions checked here: no process may already be attached,
    /// the working directory must exist, the executable must resolve (as a
    /// file, or through a PATH lookup), and merge mode requires both streams
    /// collected.
    pub fn start(&mut self) -> Result<(), ProcError> {
        if self.child.is_some() {
            return Err(ProcError::AlreadyStarted);
        }
        if !self.cwd.is_dir() {
            return Err(ProcError::WorkdirMissing {
                path: self.cwd.clone(),
            });
        }
        if self.merge_output && !(self.collect_stdout && self.collect_stderr) {
            return Err(ProcError::MergeRequiresBothStreams);
        }
        self.resolve_executable()?;
        if self.line_buffered {
            self.apply_line_buffer_shim();
        }
        self.setup_captures()?;

        let stdin = match &self.stdin_file {
            Some(path) => Some(File::open(path)?),
            None => None,
        };

        let starting = format!("Start process: {}", self.command_line());
        info!(label = %self.label, "{starting}");
        if let Some(callback) = self.callback.as_mut() {
            callback(&starting);
        }

        let mut command = Command::new(&self.program);
        command.args(&self.args).current_dir(&self.cwd);
        if let Some(env) = &self.env {
            command.env_clear().envs(env);
        }
        if let Some(stdin) = stdin {
            command.stdin(Stdio::from(stdin));
        }
        command.stdout(match &self.stdout_capture {
            Some(capture) => Stdio::from(capture.write_handle()?),
            None => Stdio::null(),
        });
        let stderr_capture = if self.merge_output {
            self.stdout_capture.as_ref()
        } else {
            self.stderr_capture.as_ref()
        };
        command.stderr(match stderr_capture {
            Some(capture) => Stdio::from(capture.write_handle()?),
            None => Stdio::null(),
        });
        #[cfg(unix)]
        if self.new_process_group {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        self.started_at = Some(Instant::now());
        self.child = Some(command.spawn()?);
        Ok(())
    }

    /// Kill the attached child and its whole descendant tree.
    ///
    /// Returns `Ok(true)` when nothing remains running afterwards — which
    /// includes the no-op case of a child that already exited. Lifecycle
    /// error before `start`.
    pub fn kill(&mut self) -> Result<bool, ProcError> {
        if !self.is_living()? {
            return Ok(true);
        }
        // is_living just proved the child is attached.
        let Some(child) = self.child.as_mut() else {
            return Err(ProcError::NotStarted);
        };
        let pid = child.id();

        #[cfg(unix)]
        if self.new_process_group {
            use nix::sys::signal::{Signal, killpg};
            use nix::unistd::Pid;
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                warn!(pid, error = %e, "failed to kill process group");
            }
        }

        let all_dead = kill_process_tree(pid);
        // Reap the direct child so it does not linger as a zombie.
        let _ = child.try_wait();
        Ok(all_dead)
    }

    /// `start` followed by [`Self::wait`].
    pub fn run(&mut self, timeout: Option<Duration>) -> Result<ProcResult, ProcError> {
        self.start()?;
        self.wait(timeout)
    }

    /// Drain output until the child has exited and nothing unread remains.
    ///
    /// Each iteration drains all currently-available stderr lines, then all
    /// stdout lines — a fixed, documented ordering — feeding the log
    /// callback per line. The deadline is checked once per iteration after
    /// draining; on expiry the process tree is killed and
    /// [`ProcError::Timeout`] carries the partial buffers. Resources stay
    /// attached on the timeout path so the caller can inspect them; call
    /// [`Self::clean`] when done. On success the controller cleans itself,
    /// deleting the backing files unless [`Self::delete_output_files`]
    /// opted out.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<ProcResult, ProcError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut stdout_lines = Vec::new();
        let mut stderr_lines = Vec::new();

        loop {
            let mut drained = 0usize;

            let (lines, _) = self.pick_stderr(None, None, false)?;
            for line in lines {
                if let Some(callback) = self.callback.as_mut() {
                    callback(&format!("[proc: {}] [stderr] {line}", self.label));
                }
                stderr_lines.push(line);
                drained += 1;
            }

            let (lines, _) = self.pick_stdout(None, None, false)?;
            for line in lines {
                if let Some(callback) = self.callback.as_mut() {
                    callback(&format!("[proc: {}] [stdout] {line}", self.label));
                }
                stdout_lines.push(line);
                drained += 1;
            }

            if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                if Instant::now() >= deadline {
                    debug!(label = %self.label, ?timeout, "deadline elapsed, killing process tree");
                    let _ = self.kill();
                    return Err(ProcError::Timeout {
                        command: self.command_line(),
                        timeout,
                        stdout: stdout_lines,
                        stderr: stderr_lines,
                    });
                }
            }

            // Liveness before backlog: if the child was already dead at the
            // first check, everything it ever wrote is on disk and visible
            // to the second, so no final write can slip between the checks.
            if !self.is_living()? && !self.has_unread_output()? {
                break;
            }
            if drained == 0 {
                thread::sleep(IDLE_POLL);
            }
        }

        let result = ProcResult {
            returncode: self.returncode()?,
            stdout: stdout_lines,
            stderr: stderr_lines,
        };
        self.clean(self.delete_output_files);
        Ok(result)
    }

    /// Decoded stdout lines currently available. `([], 0)` when stdout is
    /// not collected.
    pub fn pick_stdout(
        &self,
        limit: Option<usize>,
        max_line_len: Option<usize>,
        strict: bool,
    ) -> Result<(Vec<String>, u64), ProcError> {
        match &self.stdout_capture {
            None => Ok((Vec::new(), 0)),
            Some(capture) => Ok(capture.pick_lines(limit, max_line_len, strict)?),
        }
    }

    /// Decoded stderr lines currently available. `([], 0)` when stderr is
    /// not collected, and always in merge mode: the merged stream is only
    /// readable through [`Self::pick_stdout`].
    pub fn pick_stderr(
        &self,
        limit: Option<usize>,
        max_line_len: Option<usize>,
        strict: bool,
    ) -> Result<(Vec<String>, u64), ProcError> {
        if self.merge_output {
            return Ok((Vec::new(), 0));
        }
        match &self.stderr_capture {
            None => Ok((Vec::new(), 0)),
            Some(capture) => Ok(capture.pick_lines(limit, max_line_len, strict)?),
        }
    }

    /// Bytes discarded from the stdout capture by overflow resets.
    #[must_use]
    pub fn stdout_lost_bytes(&self) -> u64 {
        self.stdout_capture
            .as_ref()
            .map_or(0, StreamCapture::lost_bytes)
    }

    /// Overflow resets performed on the stdout capture.
    #[must_use]
    pub fn stdout_overflow_resets(&self) -> u64 {
        self.stdout_capture
            .as_ref()
            .map_or(0, StreamCapture::overflow_resets)
    }

    /// Release every resource attached to the last run: kill the child if it
    /// is still alive, tear down both captures (deleting their backing files
    /// unless `delete_output_files` is false), and detach the process
    /// handle. Idempotent, and safe on a controller that never started.
    pub fn clean(&mut self, delete_output_files: bool) {
        if self.child.is_some() && matches!(self.is_living(), Ok(true)) {
            let _ = self.kill();
        }

        for capture in [self.stdout_capture.take(), self.stderr_capture.take()]
            .into_iter()
            .flatten()
        {
            if delete_output_files {
                if let Err(e) = capture.delete_file() {
                    warn!(path = %capture.path().display(), error = %e, "failed to delete backing file");
                }
            }
            // Dropping the capture stops its size monitor.
            drop(capture);
        }

        if let Some(mut child) = self.child.take() {
            let _ = child.try_wait();
        }
    }

    fn setup_captures(&mut self) -> std::io::Result<()> {
        if self.collect_stdout && self.stdout_capture.is_none() {
            self.stdout_capture = Some(StreamCapture::new(
                &self.label,
                StreamKind::Stdout,
                self.stdout_limit,
            )?);
        }
        // Merge mode routes stderr into the stdout capture at spawn time.
        if self.collect_stderr && !self.merge_output && self.stderr_capture.is_none() {
            self.stderr_capture = Some(StreamCapture::new(
                &self.label,
                StreamKind::Stderr,
                self.stderr_limit,
            )?);
        }
        Ok(())
    }

    /// Resolve a program that does not exist as a file: first against the
    /// ambient PATH (leaving the name untouched for the OS to resolve at
    /// exec time), then against the configured environment's PATH, rebinding
    /// to the found path.
    fn resolve_executable(&mut self) -> Result<(), ProcError> {
        if self.program.exists() {
            return Ok(());
        }
        if which::which(self.program.as_os_str()).is_ok() {
            return Ok(());
        }
        if let Some(env) = &self.env {
            if let Some(path_var) = env.get(OsStr::new("PATH")) {
                if let Ok(found) = which::which_in(self.program.as_os_str(), Some(path_var), &self.cwd)
                {
                    debug!(program = %self.program.display(), found = %found.display(),
                        "resolved executable through configured environment PATH");
                    self.program = found;
                    return Ok(());
                }
            }
        }
        Err(ProcError::ExecutableNotFound {
            path: self.program.clone(),
        })
    }

    /// Append the line-buffer shim library to `LD_PRELOAD`, preserving any
    /// existing entries. With no configured environment the parent's is
    /// snapshotted first so the addition stays additive.
    fn apply_line_buffer_shim(&mut self) {
        let env = self
            .env
            .get_or_insert_with(|| std::env::vars_os().collect());
        let preload = env.entry(OsString::from("LD_PRELOAD")).or_default();
        if preload.is_empty() {
            *preload = OsString::from(LINE_BUFFER_SHIM_LIB);
        } else {
            preload.push(":");
            preload.push(LINE_BUFFER_SHIM_LIB);
        }
    }

    fn has_unread_output(&self) -> Result<bool, ProcError> {
        let stdout_pending = match &self.stdout_capture {
            Some(capture) => !capture.is_stream_end()?,
            None => false,
        };
        let stderr_pending = match &self.stderr_capture {
            Some(capture) => !capture.is_stream_end()?,
            None => false,
        };
        Ok(stdout_pending || stderr_pending)
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        self.clean(true);
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("cwd", &self.cwd)
            .field("label", &self.label)
            .field("merge_output", &self.merge_output)
            .field("started", &self.child.is_some())
            .finish_non_exhaustive()
    }
}
