//! OS process helpers (liveness, signals, process-group termination)

use std::time::Duration;
use tokio::process::Child;

/// Check if a process is alive by sending signal 0.
///
/// A process owned by another user still counts as alive (EPERM); an
/// unreaped zombie does not.
pub fn is_process_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    let exists = rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    exists && !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // The state field follows the parenthesised command name
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

/// Send `signal` to one process. Returns false if it no longer exists.
pub fn signal_process(pid: u32, signal: libc::c_int) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(pid as libc::pid_t, signal) == 0 }
}

/// Send `signal` to every process in the group led by `pgid`.
pub fn signal_group(pgid: u32, signal: libc::c_int) -> bool {
    if pgid <= 1 || pgid > i32::MAX as u32 {
        return false;
    }
    unsafe { libc::kill(-(pgid as libc::pid_t), signal) == 0 }
}

/// SIGTERM the child's process group, wait up to `grace`, then SIGKILL the
/// group and reap the child. The child must have been spawned as a group
/// leader (`process_group(0)`).
pub async fn terminate_group(child: &mut Child, grace: Duration) {
    let pid = child.id();

    match pid {
        Some(pid) => {
            signal_group(pid, libc::SIGTERM);
        }
        None => {
            // Already reaped; only stragglers in the group may remain
            let _ = child.start_kill();
        }
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::debug!(pid = ?pid, "Process ignored SIGTERM, killing");
    }

    if let Some(pid) = pid {
        signal_group(pid, libc::SIGKILL);
    }
    let _ = child.kill().await;
}

/// Poll until `pid` is gone or `timeout` elapses. Returns true if it exited.
pub async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_process_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
