//! Platform-specific process management.
//!
//! Signal delivery for the reaper and the `pre_exec` hooks applied to
//! children before they exec.

// This module owns the `pre_exec` boundary.
#![allow(unsafe_code)]

use crate::error::{LauncherError, Result};
use tokio::process::Command;
use tracing::debug;

/// Check if a process with the given PID is alive.
///
/// # Platform Behavior
/// - **Linux/macOS**: Uses `kill(pid, 0)` signal check
/// - **Other**: Assumes the process exists
pub fn is_process_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // Signal 0 doesn't actually send a signal, just checks if we can
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }

    #[cfg(not(unix))]
    {
        tracing::warn!("Process alive check not implemented for this platform");
        let _ = pid;
        true
    }
}

/// Ask a process to exit (SIGTERM).
///
/// Returns `Ok(false)` if there was no such process.
pub fn request_terminate(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        debug!("Sending SIGTERM to process {}", pid);
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) => Ok(true),
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(LauncherError::io_with_context(
                std::io::Error::from(e),
                format!("send SIGTERM to {}", pid),
            )),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = pid;
        Err(LauncherError::io_with_context(
            std::io::Error::from(std::io::ErrorKind::Unsupported),
            "graceful termination",
        ))
    }
}

/// Adjustments applied in the child between fork and exec.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChildFlags {
    /// Detach from the controlling terminal (`setsid`).
    pub new_session: bool,
    /// Put the child into its own process group (`setpgid(0, 0)`).
    pub new_process_group: bool,
    /// Lower scheduling priority (`nice(5)`).
    pub low_priority: bool,
}

impl ChildFlags {
    pub fn is_empty(&self) -> bool {
        *self == ChildFlags::default()
    }
}

/// Install `flags` on `command` so they take effect in the spawned child.
pub fn configure_child(command: &mut Command, flags: ChildFlags) {
    if flags.is_empty() {
        return;
    }

    #[cfg(unix)]
    {
        // SAFETY: the closure only calls setsid, setpgid and nice, which are
        // async-signal-safe and touch no memory shared with the parent.
        unsafe {
            command.pre_exec(move || {
                if flags.new_session {
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                } else if flags.new_process_group && libc::setpgid(0, 0) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if flags.low_priority {
                    // nice() may legitimately return -1; priority is best effort.
                    libc::nice(5);
                }
                Ok(())
            });
        }
    }

    #[cfg(not(unix))]
    {
        let _ = command;
        tracing::warn!("Child flags {:?} are not supported on this platform", flags);
    }
}
