//! Supervisor lifecycle states.
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;
use tracing::debug;

/// Lifecycle of the supervisor process. Only the control loop mutates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum SupervisorState {
    /// Socket acquired, pidfile not yet written.
    Starting,
    /// Pool at full strength, dead workers are respawned.
    Running,
    /// A replacement supervisor is being started.
    Restarting,
    /// Workers are being drained.
    Stopping,
    /// Terminal.
    Stopped,
}

impl SupervisorState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: SupervisorState) -> bool {
        use SupervisorState::*;
        matches!(
            (self, next),
            (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Restarting)
                | (Restarting, Stopping)
                | (Restarting, Running)
                | (Stopping, Stopped)
        )
    }

    /// Dead workers are replaced only while running.
    pub fn respawns_workers(self) -> bool {
        self == SupervisorState::Running
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("illegal supervisor transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: SupervisorState,
    pub to: SupervisorState,
}

/// Holder of the current state that rejects illegal transitions.
#[derive(Debug)]
pub struct Lifecycle {
    state: SupervisorState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: SupervisorState::Starting,
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn transition(&mut self, next: SupervisorState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Supervisor state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }
}
