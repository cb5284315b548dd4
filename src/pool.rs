//! Worker slots, forking, reaping and respawning.
use std::{
    num::NonZeroUsize,
    panic::{self, AssertUnwindSafe},
};

use chrono::{DateTime, Local};
use nix::{
    errno::Errno,
    sys::wait::{WaitPidFlag, WaitStatus, waitpid},
    unistd::{ForkResult, Pid, fork, getpid},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::SpawnError,
    runtime::{EXIT_RUNTIME_FAILURE, WorkerContext, WorkerRuntime, set_process_title},
    signals,
    socket::ListeningSocket,
};

/// Callback run inside each freshly forked worker, before its runtime starts.
pub type AfterFork = dyn Fn(usize, Pid);

/// One position in the pool. Indices are stable across respawns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSlot {
    pub index: usize,
    /// Live worker, or `None` while the slot is waiting to be filled.
    pub pid: Option<Pid>,
    pub spawned_at: Option<DateTime<Local>>,
}

/// What a forked worker needs from the supervisor.
pub struct SpawnContext<'a> {
    pub socket: &'a ListeningSocket,
    pub runtime: &'a dyn WorkerRuntime,
    pub after_fork: Option<&'a AfterFork>,
    pub max_connections: u32,
    pub name: &'a str,
}

/// Fixed-size set of worker slots owned by the supervisor.
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
}

impl WorkerPool {
    pub fn new(size: NonZeroUsize) -> Self {
        let slots = (0..size.get())
            .map(|index| WorkerSlot {
                index,
                pid: None,
                spawned_at: None,
            })
            .collect();
        Self { slots }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn slots(&self) -> &[WorkerSlot] {
        &self.slots
    }

    /// Pids of every tracked worker, in slot order.
    pub fn pids(&self) -> Vec<Pid> {
        self.slots.iter().filter_map(|slot| slot.pid).collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.pid.is_some()).count()
    }

    /// Forks a worker into `index`. The child never returns from this call.
    pub fn spawn(&mut self, index: usize, ctx: &SpawnContext<'_>) -> Result<Pid, SpawnError> {
        if index >= self.slots.len() {
            return Err(SpawnError {
                index,
                source: Errno::EINVAL,
            });
        }

        // SAFETY: the supervisor control loop is single threaded, and the
        // child only runs the worker runtime before exiting.
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let slot = &mut self.slots[index];
                slot.pid = Some(child);
                slot.spawned_at = Some(Local::now());
                debug!("Spawned worker {index} with pid {child}");
                Ok(child)
            }
            Ok(ForkResult::Child) => {
                // A panic must never unwind back into the supervisor's frames.
                let status = panic::catch_unwind(AssertUnwindSafe(|| run_worker(index, ctx)))
                    .unwrap_or(EXIT_RUNTIME_FAILURE);
                std::process::exit(status);
            }
            Err(source) => Err(SpawnError { index, source }),
        }
    }

    /// Spawns a worker into every empty slot. Failures are logged and left
    /// for the next reconciliation.
    pub fn fill(&mut self, ctx: &SpawnContext<'_>) -> usize {
        let empty: Vec<usize> = self
            .slots
            .iter()
            .filter(|slot| slot.pid.is_none())
            .map(|slot| slot.index)
            .collect();

        let mut spawned = 0;
        for index in empty {
            match self.spawn(index, ctx) {
                Ok(_) => spawned += 1,
                Err(err) => error!("{err}; will retry"),
            }
        }
        spawned
    }

    /// Collects workers that have exited, without blocking and without
    /// touching processes the pool does not own. Returns the vacated indices.
    pub fn reap(&mut self) -> Vec<usize> {
        let mut dead = Vec::new();
        for slot in &mut self.slots {
            let Some(pid) = slot.pid else { continue };

            let exited = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => false,
                Ok(WaitStatus::Exited(_, code)) => {
                    debug!("Worker {} (pid {pid}) exited with status {code}", slot.index);
                    true
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    debug!("Worker {} (pid {pid}) was killed by {signal}", slot.index);
                    true
                }
                Ok(_) => false,
                // Someone else already collected it.
                Err(Errno::ECHILD) => true,
                Err(err) => {
                    warn!("Failed to check worker {} (pid {pid}): {err}", slot.index);
                    false
                }
            };

            if exited {
                slot.pid = None;
                slot.spawned_at = None;
                dead.push(slot.index);
            }
        }
        dead
    }

    /// Spawns replacements for `dead` and for any slot left empty by an
    /// earlier spawn failure.
    pub fn respawn_dead(&mut self, dead: &[usize], ctx: &SpawnContext<'_>) -> Vec<(usize, Pid)> {
        let mut replaced = Vec::new();
        for index in 0..self.slots.len() {
            if self.slots[index].pid.is_some() {
                continue;
            }
            if dead.contains(&index) {
                info!("Worker {index} died, starting a new one");
            } else {
                info!("Retrying spawn of worker {index}");
            }
            match self.spawn(index, ctx) {
                Ok(pid) => replaced.push((index, pid)),
                Err(err) => error!("{err}; will retry"),
            }
        }
        replaced
    }

    /// Stops tracking the given workers, e.g. after they were drained.
    pub fn forget(&mut self, pids: &[Pid]) {
        for slot in &mut self.slots {
            if slot.pid.is_some_and(|pid| pids.contains(&pid)) {
                slot.pid = None;
                slot.spawned_at = None;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn track(&mut self, index: usize, pid: Pid) {
        self.slots[index].pid = Some(pid);
        self.slots[index].spawned_at = Some(Local::now());
    }
}

fn run_worker(index: usize, ctx: &SpawnContext<'_>) -> i32 {
    signals::restore_default_dispositions();
    if let Some(after_fork) = ctx.after_fork {
        after_fork(index, getpid());
    }
    set_process_title(&format!("{} worker {index}", ctx.name));

    ctx.runtime.run(WorkerContext {
        index,
        socket: ctx.socket,
        max_connections: ctx.max_connections,
        name: ctx.name,
    })
}
