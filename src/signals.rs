//! Translation of asynchronous process signals into supervisor commands.
//!
//! Handlers registered here only flip atomic flags and write a wakeup byte to
//! a self-pipe. Everything else happens on the control loop, which drains the
//! flags with [`SignalRouter::wait`] or [`SignalRouter::poll`].
use std::{
    io::{self, Read},
    os::unix::net::UnixStream,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use signal_hook::SigId;
use strum_macros::{AsRefStr, Display};
use tracing::debug;

/// Signals the supervisor reacts to, in the order they are reported.
pub const HANDLED_SIGNALS: [Signal; 5] = [
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGQUIT,
    Signal::SIGHUP,
    Signal::SIGCHLD,
];

/// What the control loop should do in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum SupervisorCommand {
    /// A child changed state; reap and reconcile the pool.
    Reap,
    /// Stop workers and exit.
    Shutdown(Signal),
    /// Hand the socket to a replacement supervisor.
    Restart,
}

/// The fixed signal table.
///
/// Hangup restarts only when a restart command is configured and otherwise
/// behaves like terminate.
pub fn route(signal: Signal, restart_configured: bool) -> Option<SupervisorCommand> {
    match signal {
        Signal::SIGCHLD => Some(SupervisorCommand::Reap),
        Signal::SIGINT | Signal::SIGTERM | Signal::SIGQUIT => {
            Some(SupervisorCommand::Shutdown(signal))
        }
        Signal::SIGHUP if restart_configured => Some(SupervisorCommand::Restart),
        Signal::SIGHUP => Some(SupervisorCommand::Shutdown(signal)),
        _ => None,
    }
}

/// Owns the signal registrations of the supervisor process.
pub struct SignalRouter {
    pending: Vec<(Signal, Arc<AtomicBool>)>,
    wakeup: UnixStream,
    ids: Vec<SigId>,
}

impl SignalRouter {
    /// Registers flag and wakeup handlers for every signal in [`HANDLED_SIGNALS`].
    pub fn install() -> io::Result<Self> {
        let (wakeup, notifier) = UnixStream::pair()?;
        notifier.set_nonblocking(true)?;
        wakeup.set_nonblocking(true)?;

        let mut pending = Vec::with_capacity(HANDLED_SIGNALS.len());
        let mut ids = Vec::with_capacity(HANDLED_SIGNALS.len() * 2);

        for signal in HANDLED_SIGNALS {
            let flag = Arc::new(AtomicBool::new(false));
            ids.push(signal_hook::flag::register(signal as i32, Arc::clone(&flag))?);
            ids.push(signal_hook::low_level::pipe::register(
                signal as i32,
                notifier.try_clone()?,
            )?);
            pending.push((signal, flag));
        }

        Ok(Self {
            pending,
            wakeup,
            ids,
        })
    }

    /// Returns the signals delivered since the last call without blocking.
    pub fn poll(&self) -> Vec<Signal> {
        self.drain_wakeups();
        self.pending
            .iter()
            .filter(|(_, flag)| flag.swap(false, Ordering::SeqCst))
            .map(|(signal, _)| *signal)
            .collect()
    }

    /// Blocks for up to `timeout` until a signal arrives, then behaves like
    /// [`SignalRouter::poll`]. May return an empty list on timeout.
    pub fn wait(&self, timeout: Duration) -> Vec<Signal> {
        let delivered = self.poll();
        if !delivered.is_empty() {
            return delivered;
        }

        let mut byte = [0u8; 1];
        let _ = self.wakeup.set_nonblocking(false);
        let _ = self.wakeup.set_read_timeout(Some(timeout.max(Duration::from_millis(1))));
        let _ = (&self.wakeup).read(&mut byte);
        let _ = self.wakeup.set_nonblocking(true);

        self.poll()
    }

    fn drain_wakeups(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.wakeup).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }
}

impl Drop for SignalRouter {
    fn drop(&mut self) {
        for id in self.ids.drain(..) {
            signal_hook::low_level::unregister(id);
        }
    }
}

/// Restores default dispositions in a freshly forked worker so that the
/// supervisor's handlers never run in a child.
pub fn restore_default_dispositions() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in HANDLED_SIGNALS {
        // SAFETY: installing SIG_DFL has no preconditions.
        if let Err(err) = unsafe { sigaction(signal, &default) } {
            debug!("Failed to reset {signal} in worker: {err}");
        }
    }
}
