//! Error handling for prefork.
use std::{io, path::PathBuf, process::ExitStatus};

use thiserror::Error;

/// Errors raised while loading or validating the supervisor configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading a configuration file.
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference names a variable that is not set.
    #[error("Missing environment variable: {0}")]
    MissingVariable(String),

    /// A field holds a value the supervisor cannot run with.
    #[error("Invalid value for '{field}': {reason}")]
    Invalid {
        /// Name of the offending field.
        field: &'static str,
        /// Human readable reason.
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Fatal errors that abort startup before any worker is forked.
#[derive(Debug, Error)]
pub enum StartupError {
    /// The listening socket could not be bound.
    #[error("Failed to bind {target}: {source}")]
    Bind {
        /// Display form of the bind target.
        target: String,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Another supervisor answered the liveness probe.
    #[error("already running with pid {pid}")]
    AlreadyRunning {
        /// Process id recorded in the pidfile.
        pid: i32,
    },

    /// The pidfile could not be read, written or removed.
    #[error("PID file error for {path:?}: {source}")]
    PidFile {
        /// Location of the pidfile.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// A descriptor inherited through the environment was unusable.
    #[error("Inherited listening socket is unusable: {0}")]
    Inherited(#[source] io::Error),

    /// The descriptor handoff from the previous supervisor failed.
    #[error("Failed to receive listening socket from previous supervisor: {0}")]
    Handoff(#[from] HandoffError),
}

/// Failure to fork a worker into a slot. Never fatal to the supervisor.
#[derive(Debug, Error)]
#[error("Failed to spawn worker {index}: {source}")]
pub struct SpawnError {
    /// Slot the worker was meant to occupy.
    pub index: usize,
    /// The underlying error that occurred.
    #[source]
    pub source: nix::errno::Errno,
}

/// Errors raised while passing the listening socket between supervisors.
#[derive(Debug, Error)]
pub enum HandoffError {
    /// Socket level failure on the private channel.
    #[error("handoff channel I/O failed: {0}")]
    Io(#[from] io::Error),

    /// `sendmsg`/`recvmsg` failure.
    #[error("handoff message failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    /// The message did not carry exactly one descriptor.
    #[error("expected one descriptor in handoff message, received {0}")]
    DescriptorCount(usize),

    /// The header accompanying the descriptor could not be decoded.
    #[error("malformed handoff header: {0}")]
    Header(#[from] serde_json::Error),

    /// The header was produced by an incompatible supervisor.
    #[error("unsupported handoff protocol version {0}")]
    Version(u32),
}

/// Reasons a graceful restart attempt was rolled back.
#[derive(Debug, Error)]
pub enum RestartError {
    /// The replacement did not write its pidfile in time.
    #[error("replacement supervisor did not confirm readiness within {0:?}")]
    Timeout(std::time::Duration),

    /// The replacement exited before confirming readiness.
    #[error("replacement supervisor exited before confirming readiness ({0})")]
    ChildCrashed(ExitStatus),

    /// The restart command could not be started.
    #[error("failed to start restart command: {0}")]
    Spawn(#[source] io::Error),

    /// The listening socket could not be transferred.
    #[error(transparent)]
    Handoff(#[from] HandoffError),

    /// The pidfile could not be moved aside.
    #[error("failed to move pidfile aside: {0}")]
    PidFile(#[source] io::Error),
}

/// Top level error returned by [`crate::supervisor::Supervisor::run`].
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Startup(#[from] StartupError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sys(#[from] nix::errno::Errno),
    #[error(transparent)]
    State(#[from] crate::state::InvalidTransition),
}
