//! The supervisor process: startup, the control loop, shutdown and retirement.
use std::{os::unix::net::UnixStream, time::Duration};

use nix::{
    sys::signal::Signal,
    unistd::{Pid, getpid},
};
use tracing::{debug, info, warn};

use crate::{
    config::SupervisorConfig,
    daemon,
    drain::DrainController,
    error::SupervisorError,
    handoff::{self, Verdict},
    pidfile::PidFile,
    pool::{AfterFork, SpawnContext, WorkerPool},
    restart::{RestartCoordinator, RestartOutcome},
    runtime::{WorkerRuntime, set_process_title},
    signals::{self, SignalRouter, SupervisorCommand},
    socket::ListeningSocket,
    state::{Lifecycle, SupervisorState},
};

/// Longest the control loop sleeps without a signal. Empty slots left by
/// failed spawns are retried at this pace.
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// How a supervisor that ran to completion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Workers were stopped after the given signal.
    Shutdown(Signal),
    /// A replacement supervisor took over the socket.
    HandedOff { replacement: Pid },
    /// This process was started as a replacement, and the previous
    /// supervisor rolled back and kept the socket.
    Rejected,
}

/// Owns the listening socket and the worker pool for its whole lifetime.
pub struct Supervisor {
    config: SupervisorConfig,
    runtime: Box<dyn WorkerRuntime>,
    before_fork: Option<Box<dyn FnOnce()>>,
    after_fork: Option<Box<AfterFork>>,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig, runtime: impl WorkerRuntime + 'static) -> Self {
        Self {
            config,
            runtime: Box::new(runtime),
            before_fork: None,
            after_fork: None,
        }
    }

    /// Runs once in the supervisor right before the pool is first forked.
    pub fn before_fork(mut self, hook: impl FnOnce() + 'static) -> Self {
        self.before_fork = Some(Box::new(hook));
        self
    }

    /// Runs inside every new worker with its slot index and pid.
    pub fn after_fork(mut self, hook: impl Fn(usize, Pid) + 'static) -> Self {
        self.after_fork = Some(Box::new(hook));
        self
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Runs the supervisor until it shuts down or hands off to a replacement.
    ///
    /// Startup errors are returned before any worker is forked. The pidfile
    /// is written only once the whole pool has been spawned, so its
    /// appearance tells a restarting predecessor that this process is ready.
    pub fn run(self) -> Result<Exit, SupervisorError> {
        let Supervisor {
            config,
            runtime,
            before_fork,
            after_fork,
        } = self;

        let pidfile = PidFile::new(&config.pidfile);
        pidfile.ensure_not_running()?;

        let mut socket = match ListeningSocket::from_environment(&config.bind)? {
            Some(socket) => socket,
            None => ListeningSocket::acquire(&config)?,
        };
        let predecessor = socket.take_predecessor();

        let mut guard = CleanupGuard::new(&pidfile, &socket);

        // A replacement must stay the process its predecessor spawned, or a
        // rollback could not stop it.
        if config.daemonize && predecessor.is_none() {
            daemon::daemonize()?;
            guard.adopt();
        } else if config.daemonize {
            debug!("Started by a restarting supervisor; already detached");
        }

        let router = SignalRouter::install()?;
        set_process_title(&config.master_name());

        if let Some(hook) = before_fork {
            hook();
        }

        let mut control = ControlLoop {
            config: &config,
            socket: &socket,
            pidfile: &pidfile,
            router: &router,
            spawn: SpawnContext {
                socket: &socket,
                runtime: runtime.as_ref(),
                after_fork: after_fork.as_deref(),
                max_connections: config.max_connections,
                name: config.display_name(),
            },
            pool: WorkerPool::new(config.pool),
            lifecycle: Lifecycle::default(),
            drain: DrainController::default(),
        };

        control.start()?;
        let owns_path = match &predecessor {
            None => true,
            Some(channel) => match control.await_release(channel) {
                Some(Verdict::Released) => true,
                Some(Verdict::Rejected) => {
                    control.stop()?;
                    guard.release();
                    return Ok(Exit::Rejected);
                }
                None => false,
            },
        };
        // From here on this process owns the socket path, inherited or not.
        if owns_path {
            guard.claim_socket(&socket);
        }

        let exit = control.serve()?;
        match exit {
            Exit::HandedOff { .. } => guard.disarm(),
            Exit::Shutdown(_) | Exit::Rejected => guard.release(),
        }
        Ok(exit)
    }
}

struct ControlLoop<'a> {
    config: &'a SupervisorConfig,
    socket: &'a ListeningSocket,
    pidfile: &'a PidFile,
    router: &'a SignalRouter,
    spawn: SpawnContext<'a>,
    pool: WorkerPool,
    lifecycle: Lifecycle,
    drain: DrainController,
}

impl ControlLoop<'_> {
    /// Forks the pool, then publishes the pidfile and enters `Running`.
    fn start(&mut self) -> Result<(), SupervisorError> {
        self.pool.fill(&self.spawn);
        if let Err(err) = self.pidfile.write(getpid()) {
            self.stop_workers(Signal::SIGTERM);
            return Err(err.into());
        }
        self.lifecycle.transition(SupervisorState::Running)?;
        info!(
            "starting {} with {} workers listening on {}",
            self.config.master_name(),
            self.pool.size(),
            self.socket.target()
        );
        Ok(())
    }

    /// Waits for the previous supervisor to retire or roll back. `None`
    /// when it never answered.
    fn await_release(&self, channel: &UnixStream) -> Option<Verdict> {
        match handoff::await_verdict(channel, self.config.restart_timeout) {
            Ok(Verdict::Released) => {
                info!("Previous supervisor released the socket");
                Some(Verdict::Released)
            }
            Ok(Verdict::Rejected) => {
                warn!("Previous supervisor kept the socket; stopping");
                Some(Verdict::Rejected)
            }
            Err(err) => {
                warn!("No answer from previous supervisor, serving without its socket path: {err}");
                None
            }
        }
    }

    fn serve(&mut self) -> Result<Exit, SupervisorError> {
        loop {
            let mut shutdown = None;
            let mut restart = false;
            for signal in self.router.wait(RECONCILE_INTERVAL) {
                match signals::route(signal, self.config.restart_enabled()) {
                    Some(SupervisorCommand::Shutdown(signal)) => {
                        shutdown.get_or_insert(signal);
                    }
                    Some(SupervisorCommand::Restart) => restart = true,
                    Some(SupervisorCommand::Reap) | None => {}
                }
            }

            if let Some(signal) = shutdown {
                return self.shutdown(signal);
            }

            if restart && let Some(exit) = self.restart()? {
                return Ok(exit);
            }

            self.reconcile();
        }
    }

    /// Reaps dead workers and refills their slots while running.
    fn reconcile(&mut self) {
        let dead = self.pool.reap();
        if self.lifecycle.state().respawns_workers() {
            self.pool.respawn_dead(&dead, &self.spawn);
        }
    }

    fn shutdown(&mut self, signal: Signal) -> Result<Exit, SupervisorError> {
        info!("Received {signal}; stopping {} workers", self.pool.live_count());
        self.stop()?;
        Ok(Exit::Shutdown(signal))
    }

    fn stop(&mut self) -> Result<(), SupervisorError> {
        self.lifecycle.transition(SupervisorState::Stopping)?;
        self.stop_workers(Signal::SIGTERM);
        self.lifecycle.transition(SupervisorState::Stopped)?;
        info!("{} stopped", self.config.master_name());
        Ok(())
    }

    /// Returns `Some` when this supervisor is done, either because the
    /// replacement took over or because a shutdown aborted the attempt.
    fn restart(&mut self) -> Result<Option<Exit>, SupervisorError> {
        let Some(command) = self.config.restart_command.clone() else {
            return Ok(None);
        };

        info!("Received SIGHUP; starting replacement with {command:?}");
        self.lifecycle.transition(SupervisorState::Restarting)?;
        let coordinator = RestartCoordinator::new(
            command,
            self.pidfile.clone(),
            self.config.restart_timeout,
            self.config.drain_timeout,
        );

        match coordinator.begin_restart(self.socket, &mut self.pool, self.router) {
            RestartOutcome::Confirmed { replacement } => {
                self.lifecycle.transition(SupervisorState::Stopping)?;
                info!("Handing off to supervisor {replacement}; draining workers");
                self.stop_workers(Signal::SIGHUP);
                self.lifecycle.transition(SupervisorState::Stopped)?;
                Ok(Some(Exit::HandedOff { replacement }))
            }
            RestartOutcome::RolledBack(err) => {
                warn!("Restart rolled back: {err}");
                self.lifecycle.transition(SupervisorState::Running)?;
                Ok(None)
            }
            RestartOutcome::Aborted(signal) => self.shutdown(signal).map(Some),
        }
    }

    fn stop_workers(&mut self, signal: Signal) {
        let pids = self.pool.pids();
        let report = self.drain.stop(&pids, signal, self.config.drain_timeout);
        self.pool.forget(&pids);
        debug!(
            "Workers stopped: {} exited, {} killed",
            report.exited.len(),
            report.killed.len()
        );
    }
}

/// Removes the pidfile and socket path on every exit path of the process
/// that created it, unless ownership passed to a replacement.
struct CleanupGuard<'a> {
    pidfile: &'a PidFile,
    socket: Option<&'a ListeningSocket>,
    owner: Pid,
    armed: bool,
}

impl<'a> CleanupGuard<'a> {
    /// An inherited socket path still belongs to the previous supervisor
    /// until this one is running.
    fn new(pidfile: &'a PidFile, socket: &'a ListeningSocket) -> Self {
        let mut guard = Self {
            pidfile,
            socket: None,
            owner: getpid(),
            armed: true,
        };
        if !socket.is_inherited() {
            guard.claim_socket(socket);
        }
        guard
    }

    fn claim_socket(&mut self, socket: &'a ListeningSocket) {
        self.socket = Some(socket);
    }

    /// Follows the process across daemonization.
    fn adopt(&mut self) {
        self.owner = getpid();
    }

    /// The replacement now owns both the pidfile and the socket path.
    fn disarm(&mut self) {
        self.armed = false;
    }

    fn release(&mut self) {
        if !self.armed || getpid() != self.owner {
            return;
        }
        self.armed = false;

        match self.pidfile.remove_if_owned(self.owner) {
            Ok(true) => debug!("Removed pidfile {:?}", self.pidfile.path()),
            Ok(false) => {}
            Err(err) => warn!("Failed to remove pidfile {:?}: {err}", self.pidfile.path()),
        }
        if let Some(socket) = self.socket
            && let Err(err) = socket.remove_path()
        {
            warn!("Failed to remove socket path for {}: {err}", socket.target());
        }
    }
}

impl Drop for CleanupGuard<'_> {
    fn drop(&mut self) {
        self.release();
    }
}
