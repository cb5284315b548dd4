//! Graceful-then-forced termination of a set of processes.
use std::{
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::{
        signal::{self, Signal},
        wait::{WaitPidFlag, WaitStatus, waitpid},
    },
    unistd::Pid,
};
use tracing::{debug, info, warn};

/// Result of a [`DrainController::stop`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Processes that exited within the grace period.
    pub exited: Vec<Pid>,
    /// Processes that had to be sent `SIGKILL`.
    pub killed: Vec<Pid>,
}

/// Sends a signal to a set of processes, waits, and escalates to `SIGKILL`.
#[derive(Debug, Clone)]
pub struct DrainController {
    poll_interval: Duration,
}

impl Default for DrainController {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl DrainController {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Signals every pid, polls for exit until `grace` expires, then kills
    /// the survivors. Children of this process are reaped along the way.
    pub fn stop(&self, pids: &[Pid], signal: Signal, grace: Duration) -> DrainReport {
        let mut report = DrainReport::default();
        let mut remaining = Vec::with_capacity(pids.len());

        for &pid in pids {
            match signal::kill(pid, signal) {
                Ok(()) => remaining.push(pid),
                Err(Errno::ESRCH) => {
                    // Already gone, possibly still a zombie.
                    let _ = has_exited(pid);
                    report.exited.push(pid);
                }
                Err(err) => {
                    warn!("Failed to send {signal} to {pid}: {err}");
                    remaining.push(pid);
                }
            }
        }

        let deadline = Instant::now() + grace;
        loop {
            remaining.retain(|&pid| {
                if has_exited(pid) {
                    report.exited.push(pid);
                    false
                } else {
                    true
                }
            });

            if remaining.is_empty() || Instant::now() >= deadline {
                break;
            }
            thread::sleep(self.poll_interval);
        }

        if !remaining.is_empty() {
            warn!(
                "{} process(es) did not exit within {:?} after {signal}; sending SIGKILL",
                remaining.len(),
                grace
            );
            for pid in remaining {
                match signal::kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(Errno::ESRCH) => {}
                    Err(err) => warn!("Failed to kill {pid}: {err}"),
                }
                reap_blocking(pid);
                report.killed.push(pid);
            }
        }

        if !report.exited.is_empty() || !report.killed.is_empty() {
            info!(
                "Drained {} process(es), {} forcibly killed",
                report.exited.len() + report.killed.len(),
                report.killed.len()
            );
        }
        report
    }
}

/// Non-blocking exit check. Reaps `pid` when it is our child, otherwise
/// falls back to a zero-signal probe.
pub fn has_exited(pid: Pid) -> bool {
    match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
        Ok(WaitStatus::StillAlive) => false,
        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => true,
        Ok(other) => {
            debug!("Ignoring status change of {pid}: {other:?}");
            false
        }
        Err(Errno::ECHILD) => matches!(signal::kill(pid, None), Err(Errno::ESRCH)),
        Err(err) => {
            debug!("waitpid({pid}) failed: {err}");
            false
        }
    }
}

fn reap_blocking(pid: Pid) {
    // SIGKILL cannot be caught; the wait is bounded by the kernel tearing the process down.
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => return,
            Ok(_) => continue,
            Err(Errno::EINTR) => continue,
            Err(_) => return,
        }
    }
}
