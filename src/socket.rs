//! Acquisition and inheritance of the shared listening socket.
use std::{
    env, fs, io,
    net::{TcpListener, ToSocketAddrs},
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        unix::{
            fs::{FileTypeExt, PermissionsExt},
            net::{UnixListener, UnixStream},
        },
    },
    path::Path,
};

use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use socket2::{Domain, SockAddr, Socket, Type};
use tracing::{debug, info, warn};

use crate::{
    config::{BindTarget, SupervisorConfig},
    error::StartupError,
    handoff,
};

/// Environment variable naming the descriptor of the handoff channel.
pub const HANDOFF_FD_ENV: &str = "PREFORK_HANDOFF_FD";
/// First descriptor used for socket-activation style inheritance.
pub const LISTEN_FDS_START: RawFd = 3;

/// Address family of the listening socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Inet,
    Unix,
}

/// Standard-library view of the listening socket, for in-process runtimes.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// The socket shared by the supervisor, its workers and, during a restart,
/// the replacement supervisor.
///
/// The socket is non-blocking and close-on-exec. It crosses `exec` only by
/// explicit duplication (worker descriptor 3) or by descriptor passing.
#[derive(Debug)]
pub struct ListeningSocket {
    socket: Socket,
    target: BindTarget,
    family: Family,
    inherited: bool,
    predecessor: Option<UnixStream>,
}

impl ListeningSocket {
    /// Binds a fresh socket for `config.bind`.
    pub fn acquire(config: &SupervisorConfig) -> Result<Self, StartupError> {
        let bind_err = |source| StartupError::Bind {
            target: config.bind.to_string(),
            source,
        };

        let (socket, family) = match &config.bind {
            BindTarget::Tcp { host, port } => {
                (bind_tcp(host, *port, config.backlog).map_err(bind_err)?, Family::Inet)
            }
            BindTarget::Unix(path) => {
                (bind_unix(path, config.backlog).map_err(bind_err)?, Family::Unix)
            }
        };

        info!("Bound listening socket on {}", config.bind);
        Ok(Self {
            socket,
            target: config.bind.clone(),
            family,
            inherited: false,
            predecessor: None,
        })
    }

    /// Wraps an already listening descriptor without re-binding it.
    pub fn reuse(fd: OwnedFd, target: BindTarget) -> io::Result<Self> {
        let socket = Socket::from(fd);
        socket.set_nonblocking(true)?;
        socket.set_cloexec(true)?;

        let family = if socket.local_addr()?.as_socket().is_some() {
            Family::Inet
        } else {
            Family::Unix
        };

        debug!("Reusing inherited listening socket for {target}");
        Ok(Self {
            socket,
            target,
            family,
            inherited: true,
            predecessor: None,
        })
    }

    /// Picks up a socket handed over by a previous supervisor, or passed by
    /// socket activation. Returns `None` when nothing was inherited.
    pub fn from_environment(target: &BindTarget) -> Result<Option<Self>, StartupError> {
        if let Some(fd) = take_fd_from_env(HANDOFF_FD_ENV)? {
            fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
                .map_err(|err| StartupError::Inherited(err.into()))?;
            let channel = UnixStream::from(fd);
            let (listener, header) = handoff::receive_listener(&channel)?;
            if header.target != *target {
                warn!(
                    "Inherited socket is bound to {} rather than the configured {}; keeping the inherited socket",
                    header.target, target
                );
            }
            info!("Received listening socket for {} from previous supervisor", header.target);
            let mut socket =
                Self::reuse(listener, header.target).map_err(StartupError::Inherited)?;
            socket.predecessor = Some(channel);
            return Ok(Some(socket));
        }

        if let Some(fd) = capture_socket_activation()? {
            info!("Using socket-activation descriptor {LISTEN_FDS_START}");
            return Self::reuse(fd, target.clone())
                .map(Some)
                .map_err(StartupError::Inherited);
        }

        Ok(None)
    }

    pub fn target(&self) -> &BindTarget {
        &self.target
    }

    pub fn family(&self) -> Family {
        self.family
    }

    /// Whether the socket came from a previous holder rather than `acquire`.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    /// Takes the channel to the supervisor that handed this socket over.
    /// `None` unless the socket arrived through a restart handoff.
    pub fn take_predecessor(&mut self) -> Option<UnixStream> {
        self.predecessor.take()
    }

    /// Duplicates the descriptor as a standard-library listener.
    pub fn listener(&self) -> io::Result<Listener> {
        let socket = self.socket.try_clone()?;
        Ok(match self.family {
            Family::Inet => Listener::Tcp(socket.into()),
            Family::Unix => Listener::Unix(socket.into()),
        })
    }

    /// Removes the socket path for Unix targets.
    pub fn remove_path(&self) -> io::Result<()> {
        if let Some(path) = self.target.path() {
            match fs::remove_file(path) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
                _ => debug!("Removed socket path {:?}", path),
            }
        }
        Ok(())
    }
}

impl AsRawFd for ListeningSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

impl AsFd for ListeningSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.socket.as_fd()
    }
}

fn bind_tcp(host: &str, port: u16, backlog: u32) -> io::Result<Socket> {
    let addr = (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("{host} did not resolve to any address"),
        )
    })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog_depth(backlog))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_unix(path: &Path, backlog: u32) -> io::Result<Socket> {
    remove_stale_socket(path)?;

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None)?;
    socket.bind(&SockAddr::unix(path)?)?;
    socket.listen(backlog_depth(backlog))?;
    socket.set_nonblocking(true)?;

    // Workers of any uid may need to connect.
    fs::set_permissions(path, fs::Permissions::from_mode(0o777))?;
    Ok(socket)
}

/// Removes a leftover socket file, refusing when something still accepts on it.
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };

    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }

    if UnixStream::connect(path).is_ok() {
        return Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is held by a live process", path.display()),
        ));
    }

    info!("Removing stale socket path {:?}", path);
    fs::remove_file(path)
}

fn backlog_depth(backlog: u32) -> i32 {
    i32::try_from(backlog).unwrap_or(i32::MAX)
}

/// Reads a descriptor number from `var`, removing the variable so that
/// children never see a stale hint.
fn take_fd_from_env(var: &str) -> Result<Option<OwnedFd>, StartupError> {
    let Some(raw) = env::var_os(var) else {
        return Ok(None);
    };
    unsafe {
        env::remove_var(var);
    }

    let fd = raw
        .to_str()
        .and_then(|value| value.trim().parse::<RawFd>().ok())
        .filter(|fd| *fd >= 0)
        .ok_or_else(|| {
            StartupError::Inherited(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{var} does not name a descriptor: {raw:?}"),
            ))
        })?;

    claim_fd(fd).map(Some).map_err(StartupError::Inherited)
}

/// Captures a socket-activation descriptor (`LISTEN_PID`/`LISTEN_FDS`).
fn capture_socket_activation() -> Result<Option<OwnedFd>, StartupError> {
    let listen_pid = env::var("LISTEN_PID")
        .ok()
        .and_then(|pid| pid.trim().parse::<u32>().ok());
    if listen_pid != Some(std::process::id()) {
        return Ok(None);
    }

    let fd_count = env::var("LISTEN_FDS")
        .ok()
        .and_then(|count| count.trim().parse::<i32>().ok())
        .unwrap_or(0);

    unsafe {
        env::remove_var("LISTEN_PID");
        env::remove_var("LISTEN_FDS");
        env::remove_var("LISTEN_FDNAMES");
    }

    if fd_count < 1 {
        return Ok(None);
    }
    if fd_count > 1 {
        warn!("Socket activation passed {fd_count} descriptors; only the first is used");
    }

    claim_fd(LISTEN_FDS_START)
        .map(Some)
        .map_err(StartupError::Inherited)
}

/// Takes ownership of `fd` after checking that it is open.
fn claim_fd(fd: RawFd) -> io::Result<OwnedFd> {
    fcntl(fd, FcntlArg::F_GETFD).map_err(io::Error::from)?;
    // SAFETY: the descriptor is open and was handed to this process exclusively.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}
