//! Best-effort termination of a process and all of its descendants

use std::thread;
use std::time::{Duration, Instant};

use sysinfo::{Pid, Process, ProcessStatus, ProcessesToUpdate, System};
use tracing::warn;

/// Upper bound on how long to wait for any single process to die after
/// being force-killed.
const KILL_WAIT: Duration = Duration::from_secs(1);

const KILL_POLL: Duration = Duration::from_millis(50);

/// Force-kill `root` and every live descendant, bottom-up.
///
/// Each process gets a SIGKILL-equivalent and a bounded (~1s) wait. A
/// descendant that cannot be found or killed — permission problems, races
/// with re-parenting — is logged and skipped rather than aborting the pass.
///
/// Returns `true` only if, after the pass, neither the root nor any
/// enumerated descendant is still running. A root that cannot be found at
/// all is logged and reported as failure, matching the "best effort, check
/// the flag" contract.
#[must_use]
pub fn kill_process_tree(root: u32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);

    let root_pid = Pid::from_u32(root);
    if sys.process(root_pid).is_none() {
        warn!(pid = root, "failed to find process to kill");
        return false;
    }

    // Deepest-first so children die before the parent that would reap them.
    let mut descendants = collect_descendants(&sys, root_pid);
    descendants.reverse();

    for &pid in &descendants {
        match sys.process(pid) {
            Some(process) => {
                if !process.kill() {
                    warn!(pid = pid.as_u32(), "failed to kill child process");
                }
            }
            None => warn!(pid = pid.as_u32(), "child process disappeared before kill"),
        }
        wait_for_exit(&mut sys, pid);
    }

    if let Some(process) = sys.process(root_pid) {
        if !process.kill() {
            warn!(pid = root, "failed to kill process");
        }
    }
    wait_for_exit(&mut sys, root_pid);

    sys.refresh_processes(ProcessesToUpdate::All, true);
    let child_survives = descendants
        .iter()
        .any(|pid| sys.process(*pid).is_some_and(is_running));
    let root_survives = sys.process(root_pid).is_some_and(is_running);
    !child_survives && !root_survives
}

/// All descendants of `root`, parents before children.
fn collect_descendants(sys: &System, root: Pid) -> Vec<Pid> {
    let mut result = Vec::new();
    let mut frontier = vec![root];

    while let Some(parent) = frontier.pop() {
        for (&pid, process) in sys.processes() {
            if process.parent() == Some(parent) && pid != parent {
                result.push(pid);
                frontier.push(pid);
            }
        }
    }

    result
}

/// A zombie is dead for our purposes: it no longer runs or writes, it just
/// has not been reaped yet.
fn is_running(process: &Process) -> bool {
    !matches!(process.status(), ProcessStatus::Zombie | ProcessStatus::Dead)
}

fn wait_for_exit(sys: &mut System, pid: Pid) {
    let deadline = Instant::now() + KILL_WAIT;
    loop {
        sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        match sys.process(pid) {
            None => return,
            Some(process) if !is_running(process) => return,
            Some(_) => {}
        }
        if Instant::now() >= deadline {
            warn!(pid = pid.as_u32(), "process still running after kill wait");
            return;
        }
        thread::sleep(KILL_POLL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serial_test::serial;
    use std::process::{Command, Stdio};

    #[test]
    #[serial]
    fn test_kill_single_process() -> Result<()> {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::null())
            .spawn()?;
        let pid = child.id();

        assert!(kill_process_tree(pid));

        // Reap so the assertion below does not see a zombie of our own making.
        let mut child = child;
        let status = child.wait()?;
        assert!(!status.success());
        Ok(())
    }

    #[test]
    #[serial]
    fn test_kill_process_with_children() -> Result<()> {
        // A shell that forks two sleepers and waits on them.
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30 & wait")
            .stdout(Stdio::null())
            .spawn()?;
        let pid = child.id();

        // Give the shell a moment to fork.
        thread::sleep(Duration::from_millis(300));

        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);
        let child_pids = collect_descendants(&sys, Pid::from_u32(pid));
        assert!(!child_pids.is_empty(), "shell should have forked sleepers");

        assert!(kill_process_tree(pid));
        let _ = child.wait()?;

        sys.refresh_processes(ProcessesToUpdate::All, true);
        for pid in child_pids {
            assert!(
                !sys.process(pid).is_some_and(is_running),
                "descendant {pid} survived the tree kill"
            );
        }
        Ok(())
    }

    #[test]
    #[serial]
    fn test_kill_nonexistent_process() {
        // Likely-unused pid; enumeration failure reports false.
        assert!(!kill_process_tree(u32::MAX - 7));
    }
}
