//! Daemonization and control of a running supervisor through its pidfile.
use std::{
    fs::OpenOptions,
    io,
    os::fd::AsRawFd,
    thread,
    time::{Duration, Instant},
};

use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::{ForkResult, Pid, dup2, fork, setsid},
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pidfile::PidFile;

const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors raised while signalling a supervisor from the command line.
#[derive(Debug, Error)]
pub enum ControlError {
    /// No live supervisor is recorded in the pidfile.
    #[error("no running supervisor recorded in {0:?}")]
    NotRunning(std::path::PathBuf),

    /// The pidfile could not be read.
    #[error("failed to read pidfile: {0}")]
    PidFile(#[from] io::Error),

    /// The signal could not be delivered.
    #[error("failed to signal supervisor {pid}: {source}")]
    Signal {
        pid: Pid,
        #[source]
        source: Errno,
    },
}

/// Detaches from the controlling terminal with the classic double fork.
///
/// The original process and the intermediate child exit with status 0.
/// Standard streams are pointed at `/dev/null` and the working directory is
/// changed to `/`, so every configured path must already be absolute.
pub fn daemonize() -> io::Result<()> {
    // SAFETY: called from the single threaded supervisor before any worker exists.
    if let ForkResult::Parent { .. } = unsafe { fork() }.map_err(io::Error::from)? {
        std::process::exit(0);
    }

    setsid().map_err(io::Error::from)?;

    // SAFETY: as above; the session leader exits immediately.
    if let ForkResult::Parent { .. } = unsafe { fork() }.map_err(io::Error::from)? {
        std::process::exit(0);
    }

    std::env::set_current_dir("/")?;
    let devnull = OpenOptions::new().read(true).write(true).open("/dev/null")?;
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        dup2(devnull.as_raw_fd(), target).map_err(io::Error::from)?;
    }

    debug!("Detached from controlling terminal as pid {}", std::process::id());
    Ok(())
}

/// Returns the recorded supervisor pid when that process is alive.
pub fn running_pid(pidfile: &PidFile) -> Result<Option<Pid>, ControlError> {
    let Some(pid) = pidfile.read()? else {
        return Ok(None);
    };
    match signal::kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => Ok(Some(pid)),
        Err(_) => Ok(None),
    }
}

/// Sends hangup to the recorded supervisor, requesting a graceful restart.
pub fn request_restart(pidfile: &PidFile) -> Result<Pid, ControlError> {
    let pid = running_pid(pidfile)?
        .ok_or_else(|| ControlError::NotRunning(pidfile.path().to_path_buf()))?;
    signal::kill(pid, Signal::SIGHUP).map_err(|source| ControlError::Signal { pid, source })?;
    info!("Sent SIGHUP to supervisor {pid}");
    Ok(pid)
}

/// Sends terminate to the recorded supervisor and waits for it to exit,
/// falling back to `SIGKILL` once `timeout` has passed.
///
/// Returns `true` when the supervisor had to be killed.
pub fn stop(pidfile: &PidFile, timeout: Duration) -> Result<bool, ControlError> {
    let pid = running_pid(pidfile)?
        .ok_or_else(|| ControlError::NotRunning(pidfile.path().to_path_buf()))?;

    match signal::kill(pid, Signal::SIGTERM) {
        Ok(()) => info!("Sent SIGTERM to supervisor {pid}"),
        Err(Errno::ESRCH) => return Ok(false),
        Err(source) => return Err(ControlError::Signal { pid, source }),
    }

    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if matches!(signal::kill(pid, None), Err(Errno::ESRCH)) {
            return Ok(false);
        }
        thread::sleep(STOP_POLL_INTERVAL);
    }

    warn!("Supervisor {pid} did not exit within {timeout:?} after SIGTERM; sending SIGKILL");
    if let Err(source) = signal::kill(pid, Signal::SIGKILL)
        && source != Errno::ESRCH
    {
        return Err(ControlError::Signal { pid, source });
    }
    // The supervisor cannot clean up after SIGKILL.
    if let Err(err) = pidfile.remove_if_owned(pid) {
        warn!("Failed to remove pidfile {:?}: {err}", pidfile.path());
    }
    Ok(true)
}
