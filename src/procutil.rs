//! Cross-platform process liveness and signaling primitives.
//!
//! These are the few operations the rest of the crate needs directly on a
//! bare PID, independent of any `tokio::process::Child` handle — in
//! particular for reaping processes left behind by a previous session,
//! where no `Child` exists to wait on.

use std::time::Duration;

/// The signal flavor to deliver to a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to terminate; it may catch this and clean up.
    Term,
    /// Force the process to terminate immediately.
    Kill,
}

/// Returns whether a process with the given PID currently exists.
///
/// Non-positive PIDs are always reported as not running. Any OS error
/// (e.g. permission denied) is treated as "not running" rather than
/// propagated, since callers only ever use this for best-effort cleanup.
pub fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        // Signal 0 performs no-op permission/existence checks only.
        unsafe { libc::kill(pid, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// Sends a signal to a process, returning whether it was delivered.
///
/// Delivery means the kernel accepted the signal; it says nothing about
/// whether the process has actually exited yet.
pub fn kill_process(pid: i32, signal: Signal) -> bool {
    if pid <= 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let sig = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        unsafe { libc::kill(pid, sig) == 0 }
    }
    #[cfg(windows)]
    {
        send_ctrl_break(pid as u32, signal)
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = signal;
        false
    }
}

/// Windows has no SIGTERM/SIGKILL; `CTRL_BREAK` is the closest console
/// signal a detached child can be asked to honor. The crate's liveness
/// and orphan-reaping logic (`is_process_running`, above) stays
/// POSIX-only — this is just enough to keep `stop_tool`/`cleanup`
/// functional on Windows rather than silently doing nothing.
#[cfg(windows)]
fn send_ctrl_break(pid: u32, signal: Signal) -> bool {
    use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};
    let _ = signal;
    unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) != 0 }
}

/// Sends `term`, waits up to `timeout` polling every 100ms, then escalates
/// to `kill` if the process is still alive.
///
/// Returns `true` if the process is confirmed dead by the time this
/// returns (immediately, via the graceful wait, or via the force kill).
pub async fn kill_process_gracefully(pid: i32, timeout: Duration) -> bool {
    if !is_process_running(pid) {
        return true;
    }

    kill_process(pid, Signal::Term);

    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !is_process_running(pid) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    if !is_process_running(pid) {
        return true;
    }

    kill_process(pid, Signal::Kill)
}

/// Default graceful-wait timeout used when callers don't specify one.
pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_secs(3);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_pids_are_never_running() {
        assert!(!is_process_running(0));
        assert!(!is_process_running(-1));
    }

    #[test]
    fn kill_rejects_non_positive_pids() {
        assert!(!kill_process(0, Signal::Term));
        assert!(!kill_process(-5, Signal::Kill));
    }

    #[tokio::test]
    async fn graceful_kill_is_idempotent_on_dead_pid() {
        // PID 1 is init on any live Unix box; picking an implausibly large
        // PID instead keeps this test from depending on the host's PID
        // space in the other direction (a PID that might race into reuse).
        let implausible_pid = i32::MAX - 1;
        assert!(kill_process_gracefully(implausible_pid, Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn graceful_kill_terminates_a_real_child() {
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id().expect("pid") as i32;
        assert!(is_process_running(pid));
        assert!(kill_process_gracefully(pid, Duration::from_millis(500)).await);
        let _ = child.wait().await;
    }
}
