//! Descriptor passing between an outgoing and an incoming supervisor.
//!
//! The outgoing supervisor creates a `socketpair`, leaves one end open across
//! `exec` for the replacement, and sends the listening socket over the other
//! end as `SCM_RIGHTS` ancillary data. The message body is a small JSON
//! [`HandoffHeader`] describing what the descriptor is bound to.
//!
//! The channel stays open after the transfer. Once the replacement has
//! written its pidfile, the outgoing supervisor either [`release`]s it with a
//! single byte or closes its end, which the replacement reads as a rejection.
use std::{
    io::{self, IoSlice, IoSliceMut, Read},
    os::{
        fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
        unix::net::UnixStream,
    },
    time::Duration,
};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, send, sendmsg};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{config::BindTarget, error::HandoffError};

/// Version written into every header.
pub const PROTOCOL_VERSION: u32 = 1;

/// How long the replacement waits for the descriptor to arrive.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_HEADER_LEN: usize = 4096;
const RELEASE: u8 = b'R';

/// Metadata sent alongside the descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandoffHeader {
    pub version: u32,
    pub target: BindTarget,
}

/// Sends `listener` across `channel`. The caller keeps its own copy of the
/// descriptor; the kernel duplicates it into the receiver.
pub fn send_listener<F: AsRawFd>(
    channel: &UnixStream,
    listener: &F,
    target: &BindTarget,
) -> Result<(), HandoffError> {
    let header = HandoffHeader {
        version: PROTOCOL_VERSION,
        target: target.clone(),
    };
    let payload = serde_json::to_vec(&header)?;
    let fds = [listener.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    let iov = [IoSlice::new(&payload)];

    let sent = sendmsg::<()>(channel.as_raw_fd(), &iov, &cmsgs, send_flags(), None)?;
    if sent != payload.len() {
        return Err(HandoffError::Io(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            format!("short handoff write: {sent} of {} bytes", payload.len()),
        )));
    }

    debug!("Sent listening socket for {target} over handoff channel");
    Ok(())
}

/// Receives the listening socket sent by [`send_listener`].
pub fn receive_listener(
    channel: &UnixStream,
) -> Result<(OwnedFd, HandoffHeader), HandoffError> {
    channel.set_read_timeout(Some(RECEIVE_TIMEOUT))?;

    let mut buf = vec![0u8; MAX_HEADER_LEN];
    let (len, fds) = {
        let mut iov = [IoSliceMut::new(&mut buf)];
        let mut cmsg_space = nix::cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<()>(
            channel.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_space),
            receive_flags(),
        )?;

        let mut fds = Vec::new();
        for cmsg in msg.cmsgs()? {
            if let ControlMessageOwned::ScmRights(received) = cmsg {
                fds.extend(received);
            }
        }
        (msg.bytes, fds)
    };

    // SAFETY: SCM_RIGHTS installed these descriptors in this process and
    // nothing else refers to them.
    let mut owned: Vec<OwnedFd> = fds
        .into_iter()
        .map(|fd| unsafe { OwnedFd::from_raw_fd(fd) })
        .collect();

    if owned.len() != 1 {
        return Err(HandoffError::DescriptorCount(owned.len()));
    }

    let header: HandoffHeader = serde_json::from_slice(&buf[..len])?;
    if header.version != PROTOCOL_VERSION {
        return Err(HandoffError::Version(header.version));
    }

    let fd = owned.remove(0);
    #[cfg(not(target_os = "linux"))]
    nix::fcntl::fcntl(
        fd.as_raw_fd(),
        nix::fcntl::FcntlArg::F_SETFD(nix::fcntl::FdFlag::FD_CLOEXEC),
    )?;

    debug!("Received listening socket for {}", header.target);
    Ok((fd, header))
}

/// What the outgoing supervisor decided about its replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The outgoing supervisor is retiring. The socket path is ours.
    Released,
    /// The outgoing supervisor rolled back and keeps serving.
    Rejected,
}

/// Hands ownership of the socket over to the replacement.
pub fn release(channel: &UnixStream) -> Result<(), HandoffError> {
    let sent = send(channel.as_raw_fd(), &[RELEASE], send_flags())?;
    if sent != 1 {
        return Err(HandoffError::Io(io::Error::new(
            io::ErrorKind::WriteZero,
            "release byte was not sent",
        )));
    }
    debug!("Released listening socket to replacement");
    Ok(())
}

/// Blocks until the outgoing supervisor releases or rejects this process.
/// A closed channel is a rejection.
pub fn await_verdict(channel: &UnixStream, timeout: Duration) -> Result<Verdict, HandoffError> {
    channel.set_read_timeout(Some(timeout))?;

    let mut reader = channel;
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(Verdict::Rejected),
            Ok(_) if byte[0] == RELEASE => return Ok(Verdict::Released),
            Ok(_) => {
                return Err(HandoffError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unexpected byte {:#04x} on handoff channel", byte[0]),
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err.into()),
        }
    }
}

#[cfg(target_os = "linux")]
fn send_flags() -> MsgFlags {
    MsgFlags::MSG_NOSIGNAL
}

#[cfg(not(target_os = "linux"))]
fn send_flags() -> MsgFlags {
    MsgFlags::empty()
}

#[cfg(target_os = "linux")]
fn receive_flags() -> MsgFlags {
    MsgFlags::MSG_CMSG_CLOEXEC
}

#[cfg(not(target_os = "linux"))]
fn receive_flags() -> MsgFlags {
    MsgFlags::empty()
}
