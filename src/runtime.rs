//! Worker runtimes: what a forked worker does with the shared socket.
//!
//! The supervisor treats the runtime as a black box that is handed a ready
//! listening socket. The contract it relies on:
//!
//! * `SIGHUP` asks the worker to stop accepting, finish in-flight work and exit.
//! * `SIGINT`, `SIGTERM` and `SIGQUIT` ask the worker to exit promptly.
use std::{
    ffi::CString,
    io::{self, Read, Write},
    net::TcpStream,
    os::{
        fd::{AsRawFd, RawFd},
        unix::{net::UnixStream, process::CommandExt},
    },
    process::Command,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use nix::{
    fcntl::{FcntlArg, FdFlag, fcntl},
    sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction},
};
use tracing::{debug, error, warn};

use crate::socket::{LISTEN_FDS_START, Listener, ListeningSocket};

/// Exit status used when a worker cannot start its runtime.
pub const EXIT_RUNTIME_FAILURE: i32 = 70;
/// Exit status used when the worker command cannot be executed.
pub const EXIT_EXEC_FAILURE: i32 = 127;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);

/// Everything a worker knows about itself.
#[derive(Debug, Clone, Copy)]
pub struct WorkerContext<'a> {
    /// Stable slot index, reused across respawns.
    pub index: usize,
    /// The shared listening socket.
    pub socket: &'a ListeningSocket,
    /// Connection limit hint from the configuration.
    pub max_connections: u32,
    /// Display name of the supervisor.
    pub name: &'a str,
}

/// Runs inside each forked worker. The return value becomes the worker's
/// exit status.
pub trait WorkerRuntime {
    fn run(&self, ctx: WorkerContext<'_>) -> i32;
}

/// Replaces the worker with an external command that serves on descriptor 3.
///
/// Exports `LISTEN_FDS=1` and `LISTEN_PID` so socket-activation aware servers
/// pick the descriptor up, plus `PREFORK_LISTEN_FD`, `PREFORK_WORKER_INDEX`
/// and `PREFORK_MAX_CONNECTIONS`.
#[derive(Debug, Clone)]
pub struct ExecRuntime {
    argv: Vec<String>,
}

impl ExecRuntime {
    pub fn new(argv: Vec<String>) -> io::Result<Self> {
        if argv.first().is_none_or(|program| program.is_empty()) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "worker command is empty",
            ));
        }
        Ok(Self { argv })
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    fn command(&self, ctx: &WorkerContext<'_>) -> Command {
        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .env("LISTEN_FDS", "1")
            .env("LISTEN_PID", std::process::id().to_string())
            .env("PREFORK_LISTEN_FD", LISTEN_FDS_START.to_string())
            .env("PREFORK_WORKER_INDEX", ctx.index.to_string())
            .env("PREFORK_MAX_CONNECTIONS", ctx.max_connections.to_string())
            .env_remove("LISTEN_FDNAMES")
            .env_remove(crate::socket::HANDOFF_FD_ENV);
        command
    }
}

impl WorkerRuntime for ExecRuntime {
    fn run(&self, ctx: WorkerContext<'_>) -> i32 {
        if let Err(err) = place_listener(ctx.socket.as_raw_fd()) {
            error!("Worker {} could not place listening socket: {err}", ctx.index);
            return EXIT_RUNTIME_FAILURE;
        }

        let err = self.command(&ctx).exec();
        error!("Worker {} failed to exec {:?}: {err}", ctx.index, self.argv);
        EXIT_EXEC_FAILURE
    }
}

/// Moves the listener to descriptor 3 and clears close-on-exec on it.
fn place_listener(fd: RawFd) -> nix::Result<()> {
    if fd == LISTEN_FDS_START {
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
    } else {
        // dup2 never sets close-on-exec on the new descriptor.
        nix::unistd::dup2(fd, LISTEN_FDS_START)?;
    }
    Ok(())
}

/// An accepted client connection.
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl Read for Connection {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => stream.read(buf),
            Connection::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Connection {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Connection::Tcp(stream) => stream.write(buf),
            Connection::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.flush(),
            Connection::Unix(stream) => stream.flush(),
        }
    }
}

impl Listener {
    /// Accepts one connection, returned in blocking mode.
    pub fn accept(&self) -> io::Result<Connection> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok(Connection::Tcp(stream))
            }
            Listener::Unix(listener) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(false)?;
                Ok(Connection::Unix(stream))
            }
        }
    }
}

/// In-process accept loop that hands each connection to `handler`.
///
/// Connections are served one at a time, so once a drain is requested the
/// loop exits as soon as the current handler returns. Terminating signals
/// keep their default action and end the worker immediately.
pub struct ServeRuntime<F> {
    handler: F,
}

impl<F> ServeRuntime<F>
where
    F: Fn(Connection) -> io::Result<()>,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F> WorkerRuntime for ServeRuntime<F>
where
    F: Fn(Connection) -> io::Result<()>,
{
    fn run(&self, ctx: WorkerContext<'_>) -> i32 {
        if let Err(err) = install_drain_handler() {
            error!("Worker {} could not install drain handler: {err}", ctx.index);
            return EXIT_RUNTIME_FAILURE;
        }

        let listener = match ctx.socket.listener() {
            Ok(listener) => listener,
            Err(err) => {
                error!("Worker {} could not clone listener: {err}", ctx.index);
                return EXIT_RUNTIME_FAILURE;
            }
        };

        match serve(&listener, &self.handler, &DRAIN_REQUESTED) {
            Ok(served) => {
                debug!("Worker {} drained after {served} connection(s)", ctx.index);
                0
            }
            Err(err) => {
                error!("Worker {} accept loop failed: {err}", ctx.index);
                1
            }
        }
    }
}

static DRAIN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn request_drain(_: libc::c_int) {
    DRAIN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs the `SIGHUP` handler directly: the signal-hook registry is a copy
/// of the supervisor's after `fork` and would not re-arm the handler.
fn install_drain_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(request_drain),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic.
    unsafe { sigaction(Signal::SIGHUP, &action) }.map(|_| ())
}

/// Accepts until `drain` is set. Returns the number of connections served.
pub fn serve<F>(listener: &Listener, handler: &F, drain: &AtomicBool) -> io::Result<u64>
where
    F: Fn(Connection) -> io::Result<()>,
{
    let mut served = 0;
    while !drain.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(connection) => {
                served += 1;
                if let Err(err) = handler(connection) {
                    warn!("Connection handler failed: {err}");
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_BACKOFF)
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::ConnectionAborted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(served)
}

/// Renames the current process for `ps`. Best effort.
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    {
        // The kernel keeps at most 15 bytes plus the terminator.
        let truncated: String = title.chars().take(15).collect();
        if let Ok(name) = CString::new(truncated) {
            let rc = unsafe { libc::prctl(libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0) };
            if rc != 0 {
                debug!(
                    "Failed to set process title: {}",
                    io::Error::last_os_error()
                );
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = CString::new(title);
        debug!("Process titles are not supported on this platform");
    }
}
