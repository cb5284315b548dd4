//! Prefork is a preforking process supervisor. A master process owns one
//! listening socket, forks a pool of workers that accept on it, replaces
//! workers that die, and can hand the live socket to a freshly started copy of
//! itself so that a restart never refuses a connection.

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Detaching from the terminal and signalling a running supervisor.
pub mod daemon;

/// Graceful-then-forced termination of process sets.
pub mod drain;

/// Error handling.
pub mod error;

/// Listening socket transfer between supervisors.
pub mod handoff;

/// Log output setup.
pub mod logs;

/// Pidfile management.
pub mod pidfile;

/// Worker pool bookkeeping.
pub mod pool;

/// Zero-downtime restart orchestration.
pub mod restart;

/// What workers run.
pub mod runtime;

/// Signal routing.
pub mod signals;

/// The shared listening socket.
pub mod socket;

/// Supervisor lifecycle states.
pub mod state;

/// Supervisor runtime.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
