//! On-disk record of the active supervisor's process id.
use std::{
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
};

use nix::{errno::Errno, sys::signal, unistd::Pid};
use tracing::{debug, info};

use crate::error::StartupError;

/// A plain-text pidfile holding the decimal pid of the active supervisor.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling that holds the previous contents during a restart.
    pub fn old_path(&self) -> PathBuf {
        with_suffix(&self.path, ".old")
    }

    /// Reads the recorded pid. Missing files and unparsable contents yield `None`.
    pub fn read(&self) -> io::Result<Option<Pid>> {
        read_pid(&self.path)
    }

    /// Fails with `AlreadyRunning` if the recorded process still exists,
    /// otherwise removes the stale file.
    ///
    /// A permission error from the zero-signal probe still proves the process
    /// exists, so it counts as running.
    pub fn ensure_not_running(&self) -> Result<(), StartupError> {
        let recorded = self.read().map_err(|source| self.error(source))?;

        if let Some(pid) = recorded {
            match signal::kill(pid, None) {
                Ok(()) | Err(Errno::EPERM) => {
                    return Err(StartupError::AlreadyRunning { pid: pid.as_raw() });
                }
                Err(err) => debug!("Recorded pid {pid} is not alive ({err})"),
            }
        }

        if self.path.exists() {
            info!("Removing stale pidfile {:?}", self.path);
            self.remove().map_err(|source| self.error(source))?;
        }

        Ok(())
    }

    /// Creates or overwrites the file with `pid`.
    ///
    /// The contents are written to a temporary sibling and renamed into
    /// place, so readers never observe a partially written pid.
    pub fn write(&self, pid: Pid) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let staging = with_suffix(&self.path, &format!(".{}.tmp", pid.as_raw()));
        fs::write(&staging, pid.as_raw().to_string())?;
        fs::rename(&staging, &self.path)
    }

    /// Renames the live file to its `.old` sibling. Returns whether a file was moved.
    pub fn atomic_replace(&self) -> io::Result<bool> {
        match fs::rename(&self.path, self.old_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Moves the `.old` sibling back into place, undoing [`PidFile::atomic_replace`].
    pub fn restore(&self) -> io::Result<()> {
        fs::rename(self.old_path(), &self.path)
    }

    /// Deletes the `.old` sibling once a restart has been confirmed.
    pub fn discard_old(&self) -> io::Result<()> {
        remove_if_present(&self.old_path())
    }

    /// Deletes the pidfile. A missing file is not an error.
    pub fn remove(&self) -> io::Result<()> {
        remove_if_present(&self.path)
    }

    /// Deletes the pidfile only while it still names `pid`.
    pub fn remove_if_owned(&self, pid: Pid) -> io::Result<bool> {
        if self.read()? == Some(pid) {
            self.remove()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn error(&self, source: io::Error) -> StartupError {
        StartupError::PidFile {
            path: self.path.clone(),
            source,
        }
    }
}

fn read_pid(path: &Path) -> io::Result<Option<Pid>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };

    // Non-positive values would address process groups when probed.
    Ok(contents
        .trim()
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(Pid::from_raw))
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
