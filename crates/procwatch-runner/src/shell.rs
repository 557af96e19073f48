//! Convenience wrappers for one-shot shell invocations
//!
//! Pure call-throughs to [`ManagedProcess`]: a literal command string run
//! through `/bin/bash -c`, or a script file run through `/bin/bash <path>`.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use crate::error::ProcError;
use crate::process::ManagedProcess;
use crate::types::ProcResult;

/// Run `command` through `/bin/bash -c` and wait for it.
///
/// `env: None` inherits the parent environment; `Some(map)` replaces it
/// wholesale. With `merge_stderr` the result's `stdout` carries both streams
/// interleaved and `stderr` stays empty.
pub fn run_bash_command(
    command: &str,
    cwd: impl AsRef<Path>,
    env: Option<HashMap<OsString, OsString>>,
    timeout: Option<Duration>,
    merge_stderr: bool,
) -> Result<ProcResult, ProcError> {
    let mut proc = ManagedProcess::new("/bin/bash")
        .arg("-c")
        .arg(command)
        .cwd(cwd.as_ref())
        .merge_output(merge_stderr);
    if let Some(env) = env {
        proc = proc.envs(env);
    }
    proc.run(timeout)
}

/// Run the script at `script_path` through `/bin/bash` and wait for it.
pub fn run_bash_script(
    script_path: impl AsRef<Path>,
    cwd: impl AsRef<Path>,
    env: Option<HashMap<OsString, OsString>>,
    timeout: Option<Duration>,
    merge_stderr: bool,
) -> Result<ProcResult, ProcError> {
    let mut proc = ManagedProcess::new("/bin/bash")
        .arg(script_path.as_ref().as_os_str())
        .cwd(cwd.as_ref())
        .merge_output(merge_stderr);
    if let Some(env) = env {
        proc = proc.envs(env);
    }
    proc.run(timeout)
}
