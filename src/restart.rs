//! Zero-downtime handoff of the listening socket to a replacement supervisor.
//!
//! The sequence is:
//!
//! 1. move the pidfile aside so the replacement can write its own,
//! 2. spawn the restart command with one end of a private socket pair,
//! 3. send the listening socket over the other end,
//! 4. wait, bounded by the restart timeout, for the replacement's pidfile,
//! 5. release the replacement over the socket pair, or close it on rollback.
//!
//! The outgoing supervisor keeps accepting through its own workers the whole
//! time, so whichever way the attempt ends the socket always has an owner.
use std::{
    io,
    os::{
        fd::AsRawFd,
        unix::{net::UnixStream, process::CommandExt},
    },
    process::{Child, Command},
    thread,
    time::{Duration, Instant},
};

use nix::{
    fcntl::{FcntlArg, FdFlag, fcntl},
    sys::signal::{self, Signal},
    unistd::{Pid, getpid},
};
use tracing::{debug, info, warn};

use crate::{
    drain::DrainController,
    error::RestartError,
    handoff,
    pidfile::PidFile,
    pool::WorkerPool,
    signals::{self, SignalRouter, SupervisorCommand},
    socket::{HANDOFF_FD_ENV, ListeningSocket},
};

const CONFIRM_POLL_INTERVAL: Duration = Duration::from_millis(100);
const CRASH_SETTLE_TIME: Duration = Duration::from_millis(200);

/// How a restart attempt ended.
#[derive(Debug)]
pub enum RestartOutcome {
    /// The replacement wrote its pidfile. The caller must retire.
    Confirmed { replacement: Pid },
    /// The attempt failed and was undone. The caller resumes running.
    RolledBack(RestartError),
    /// A shutdown signal arrived while waiting. The replacement was stopped
    /// and the pidfile restored; the caller must shut down.
    Aborted(Signal),
}

/// Drives one restart attempt at a time.
#[derive(Debug, Clone)]
pub struct RestartCoordinator {
    command: Vec<String>,
    pidfile: PidFile,
    timeout: Duration,
    grace: Duration,
    drain: DrainController,
}

impl RestartCoordinator {
    /// `timeout` bounds the wait for the replacement's pidfile and `grace`
    /// bounds how long an unconfirmed replacement gets to exit on rollback.
    pub fn new(command: Vec<String>, pidfile: PidFile, timeout: Duration, grace: Duration) -> Self {
        Self {
            command,
            pidfile,
            timeout,
            grace,
            drain: DrainController::default(),
        }
    }

    /// Starts a replacement and waits for it to confirm readiness.
    ///
    /// While waiting, dead workers are dropped from `pool` without being
    /// replaced, and any shutdown signal delivered through `router` aborts
    /// the attempt.
    pub fn begin_restart(
        &self,
        socket: &ListeningSocket,
        pool: &mut WorkerPool,
        router: &SignalRouter,
    ) -> RestartOutcome {
        let moved = match self.pidfile.atomic_replace() {
            Ok(moved) => moved,
            Err(err) => return RestartOutcome::RolledBack(RestartError::PidFile(err)),
        };

        let (mut child, channel) = match self.spawn_replacement(socket) {
            Ok(spawned) => spawned,
            Err(err) => {
                self.restore_pidfile(moved);
                return RestartOutcome::RolledBack(err);
            }
        };
        let replacement = Pid::from_raw(child.id() as i32);
        info!(
            "Started replacement supervisor (pid {replacement}); waiting up to {:?} for it to confirm",
            self.timeout
        );

        match self.await_confirmation(&mut child, pool, router) {
            Ok(Confirmation::Ready(pid)) => match handoff::release(&channel) {
                Ok(()) => {
                    if let Err(err) = self.pidfile.discard_old() {
                        warn!("Failed to remove {:?}: {err}", self.pidfile.old_path());
                    }
                    RestartOutcome::Confirmed { replacement: pid }
                }
                Err(err) => {
                    warn!("Replacement {pid} could not be released: {err}");
                    self.roll_back(&mut child, channel, moved);
                    RestartOutcome::RolledBack(err.into())
                }
            },
            Ok(Confirmation::Interrupted(signal)) => {
                warn!("Received {signal} during restart; stopping replacement {replacement}");
                self.roll_back(&mut child, channel, moved);
                RestartOutcome::Aborted(signal)
            }
            Err(err) => {
                warn!("Restart failed, keeping current workers: {err}");
                self.roll_back(&mut child, channel, moved);
                RestartOutcome::RolledBack(err)
            }
        }
    }

    fn spawn_replacement(
        &self,
        socket: &ListeningSocket,
    ) -> Result<(Child, UnixStream), RestartError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(RestartError::Spawn(io::Error::new(
                io::ErrorKind::InvalidInput,
                "restart command is empty",
            )));
        };
        let (ours, theirs) = UnixStream::pair().map_err(RestartError::Spawn)?;
        let inherited_fd = theirs.as_raw_fd();

        let mut command = Command::new(program);
        command
            .args(args)
            .env(HANDOFF_FD_ENV, inherited_fd.to_string());
        // SAFETY: fcntl is async-signal-safe and touches only the inherited descriptor.
        unsafe {
            command.pre_exec(move || {
                fcntl(inherited_fd, FcntlArg::F_SETFD(FdFlag::empty()))
                    .map(|_| ())
                    .map_err(io::Error::from)
            });
        }

        let mut child = command.spawn().map_err(RestartError::Spawn)?;
        drop(theirs);

        if let Err(err) = handoff::send_listener(&ours, socket, socket.target()) {
            // A replacement that died immediately closes its end first.
            thread::sleep(CRASH_SETTLE_TIME);
            let crashed = match child.try_wait() {
                Ok(Some(status)) if !status.success() => Some(status),
                _ => None,
            };
            self.stop_replacement(&mut child);
            return Err(match crashed {
                Some(status) => RestartError::ChildCrashed(status),
                None => RestartError::Handoff(err),
            });
        }
        Ok((child, ours))
    }

    fn await_confirmation(
        &self,
        child: &mut Child,
        pool: &mut WorkerPool,
        router: &SignalRouter,
    ) -> Result<Confirmation, RestartError> {
        let deadline = Instant::now() + self.timeout;
        let mut exited_cleanly = false;

        loop {
            for delivered in router.wait(CONFIRM_POLL_INTERVAL) {
                match signals::route(delivered, true) {
                    Some(SupervisorCommand::Shutdown(signal)) => {
                        return Ok(Confirmation::Interrupted(signal));
                    }
                    Some(SupervisorCommand::Reap) => {
                        let dead = pool.reap();
                        if !dead.is_empty() {
                            debug!("Worker slot(s) {dead:?} vacated during restart; not respawning");
                        }
                    }
                    Some(SupervisorCommand::Restart) => {
                        info!("Restart already in progress; ignoring {delivered}");
                    }
                    None => {}
                }
            }

            if let Some(pid) = self.confirmed_pid() {
                info!("Replacement supervisor {pid} confirmed readiness");
                return Ok(Confirmation::Ready(pid));
            }

            if !exited_cleanly {
                match child.try_wait() {
                    Ok(Some(status)) if status.success() => {
                        // Daemonizing replacements exit 0 from the first fork.
                        debug!("Restart command exited with {status}; still waiting for pidfile");
                        exited_cleanly = true;
                    }
                    Ok(Some(status)) => return Err(RestartError::ChildCrashed(status)),
                    Ok(None) => {}
                    Err(err) => debug!("Failed to poll replacement: {err}"),
                }
            }

            if Instant::now() >= deadline {
                // The pidfile may have landed while this pass was polling the child.
                if let Some(pid) = self.confirmed_pid() {
                    info!("Replacement supervisor {pid} confirmed readiness at the deadline");
                    return Ok(Confirmation::Ready(pid));
                }
                return Err(RestartError::Timeout(self.timeout));
            }
        }
    }

    /// A pidfile naming a live process other than this one proves readiness.
    fn confirmed_pid(&self) -> Option<Pid> {
        let pid = self.pidfile.read().ok().flatten()?;
        if pid == getpid() {
            return None;
        }
        match signal::kill(pid, None) {
            Ok(()) => Some(pid),
            Err(_) => None,
        }
    }

    /// Closing the channel tells a replacement that is still starting to
    /// give up. It is then stopped and waited for, so it cannot write the
    /// pidfile after it has been restored.
    fn roll_back(&self, child: &mut Child, channel: UnixStream, moved: bool) {
        drop(channel);
        self.stop_replacement(child);
        // A replacement that detached from the restart command is only
        // known through the pidfile it wrote.
        if let Some(pid) = self.confirmed_pid()
            && pid != Pid::from_raw(child.id() as i32)
        {
            warn!("Stopping detached replacement supervisor {pid}");
            self.drain.stop(&[pid], Signal::SIGTERM, self.grace);
        }
        self.restore_pidfile(moved);
    }

    fn stop_replacement(&self, child: &mut Child) {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        let pid = Pid::from_raw(child.id() as i32);
        self.drain.stop(&[pid], Signal::SIGTERM, self.grace);
    }

    fn restore_pidfile(&self, moved: bool) {
        let result = if moved {
            self.pidfile.restore()
        } else {
            self.pidfile.write(getpid())
        };
        match result {
            Ok(()) => debug!("Restored pidfile {:?}", self.pidfile.path()),
            Err(err) => warn!("Failed to restore pidfile {:?}: {err}", self.pidfile.path()),
        }
    }
}

enum Confirmation {
    Ready(Pid),
    Interrupted(Signal),
}
