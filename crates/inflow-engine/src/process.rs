//! Cancellation hooks for externally spawned processes.
//!
//! Handlers that launch an external tool register its PID on the shared
//! [`ProcessHandle`] passed in their context, so a cancellation request can
//! reach the whole process tree even though the handler itself is blocked
//! waiting on the child.

use std::process::{Child, Command};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, warn};

/// Shared, cloneable handle to the external process of one running job.
///
/// Empty until the handler registers a PID; cleared when the process exits
/// or is killed.
#[derive(Debug, Clone, Default)]
pub struct ProcessHandle {
    pid: Arc<Mutex<Option<u32>>>,
}

impl ProcessHandle {
    /// Creates an empty handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the PID of a freshly spawned external process.
    pub fn register(&self, pid: u32) {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = Some(pid);
    }

    /// Clears the registered PID.
    pub fn clear(&self) {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Returns the registered PID, if any.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        *self.pid.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks whether the registered process is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.pid().is_some_and(is_process_running)
    }

    /// Kills the registered process and its descendants.
    ///
    /// Returns true if a kill was attempted. The PID is cleared either way.
    pub fn kill_tree(&self) -> bool {
        let Some(pid) = self.pid() else {
            return false;
        };
        debug!(pid, "killing external process tree");
        let attempted = kill_process_tree(pid);
        self.clear();
        attempted
    }
}

/// Checks if a process with the given PID is still running.
#[must_use]
pub fn is_process_running(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything.
    #[cfg(unix)]
    {
        Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    #[cfg(windows)]
    {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}")])
            .output()
            .map(|output| {
                let stdout = String::from_utf8_lossy(&output.stdout);
                stdout.contains(&pid.to_string())
            })
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Kills a process and its descendants.
///
/// On unix the process is expected to lead its own group (see
/// [`spawn_managed`]), so the signal is sent to the negative PID. TERM is
/// tried first; KILL follows if the group is still alive shortly after.
fn kill_process_tree(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let group = format!("-{pid}");
        let term = Command::new("kill")
            .args(["-TERM", &group])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false);
        std::thread::sleep(std::time::Duration::from_millis(200));
        if is_process_running(pid) {
            let killed = Command::new("kill")
                .args(["-KILL", &group])
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false);
            if !killed {
                warn!(pid, "failed to force-kill process group");
            }
            return killed;
        }
        term
    }

    #[cfg(windows)]
    {
        Command::new("taskkill")
            .args(["/F", "/T", "/PID", &pid.to_string()])
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }

    #[cfg(not(any(unix, windows)))]
    {
        false
    }
}

/// Spawns an external command in its own process group and registers its
/// PID on `handle`.
///
/// Grouping the child lets [`ProcessHandle::kill_tree`] reach every
/// descendant the tool forks.
///
/// # Errors
///
/// Returns the io error from spawning the command.
pub fn spawn_managed(command: &mut Command, handle: &ProcessHandle) -> std::io::Result<Child> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
        command.creation_flags(CREATE_NEW_PROCESS_GROUP);
    }

    let child = command.spawn()?;
    handle.register(child.id());
    Ok(child)
}
