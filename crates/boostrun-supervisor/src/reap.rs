//! Termination of orphaned workers left behind by a previous supervisor.

use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::SupervisorError;

/// SIGKILL `pid` and wait until it is gone.
///
/// A pid that no longer exists counts as already reaped. The process is
/// usually not our child, so its exit status is not observed; it is gone
/// once the kernel stops knowing the pid (or only a zombie is left).
pub async fn reap_orphan(pid: u32, interval: Duration, timeout: Duration) -> Result<(), SupervisorError> {
    let target = to_pid(pid)?;

    match kill(target, Signal::SIGKILL) {
        Ok(()) => debug!(pid = pid, "Sent SIGKILL to orphaned worker"),
        Err(Errno::ESRCH) => {
            debug!(pid = pid, "Orphaned worker already gone");
            return Ok(());
        }
        Err(errno) => {
            return Err(SupervisorError::Reap {
                pid,
                reason: format!("kill failed: {}", errno),
            })
        }
    }

    let deadline = Instant::now() + timeout;
    loop {
        if !is_alive(target) {
            info!(pid = pid, "Orphaned worker reaped");
            return Ok(());
        }

        if Instant::now() >= deadline {
            return Err(SupervisorError::Reap {
                pid,
                reason: format!("still alive {:?} after SIGKILL", timeout),
            });
        }

        tokio::time::sleep(interval).await;
    }
}

/// Returns true while `pid` names a live, non-zombie process.
fn is_alive(pid: Pid) -> bool {
    // Collects the zombie if the orphan happens to be our own child; fails
    // with ECHILD otherwise, which is fine.
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));

    match kill(pid, None) {
        Err(Errno::ESRCH) => false,
        Ok(()) | Err(_) => !is_zombie(pid),
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
        return false;
    };

    // The state field follows the parenthesised command name, which may
    // itself contain spaces or parentheses.
    stat.rfind(')')
        .and_then(|i| stat[i + 1..].split_whitespace().next())
        .map(|state| state == "Z")
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: Pid) -> bool {
    false
}

fn to_pid(pid: u32) -> Result<Pid, SupervisorError> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 1 => Ok(Pid::from_raw(raw)),
        _ => Err(SupervisorError::Reap {
            pid,
            reason: "not a worker pid".to_string(),
        }),
    }
}
