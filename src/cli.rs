//! Command-line interface for prefork.
use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::{
    config::{DEFAULT_PIDFILE, RawConfig, SupervisorConfig, load_config},
    error::ConfigError,
    pidfile::PidFile,
};

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };
            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => LevelFilter::OFF,
            "error" | "err" => LevelFilter::ERROR,
            "warn" | "warning" => LevelFilter::WARN,
            "info" => LevelFilter::INFO,
            "debug" => LevelFilter::DEBUG,
            "trace" => LevelFilter::TRACE,
            _ => return Err(format!("invalid log level '{trimmed}'")),
        };
        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for prefork.
#[derive(Parser, Debug)]
#[command(name = "prefork", version)]
#[command(about = "A preforking supervisor with zero-downtime restarts", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bind the socket, fork the worker pool and supervise it.
    Start(StartArgs),

    /// Stop the running supervisor and wait for it to exit.
    Stop {
        #[command(flatten)]
        target: ControlArgs,

        /// Seconds to wait before escalating to SIGKILL.
        #[arg(long, default_value_t = 60)]
        timeout: u64,
    },

    /// Ask the running supervisor to hand its socket to a fresh copy of itself.
    Restart {
        #[command(flatten)]
        target: ControlArgs,
    },

    /// Report whether the supervisor is running. Exits 1 when it is not.
    Status {
        #[command(flatten)]
        target: ControlArgs,
    },
}

/// Options of `prefork start`. Every value overrides the config file.
#[derive(Args, Debug, Default)]
pub struct StartArgs {
    /// YAML configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Number of worker processes.
    #[arg(short, long)]
    pub pool: Option<usize>,

    /// TCP host to bind.
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to bind.
    #[arg(long)]
    pub port: Option<u16>,

    /// Bind a Unix domain socket at this path instead of TCP.
    #[arg(long, conflicts_with_all = ["host", "port"])]
    pub socket: Option<PathBuf>,

    /// Listen backlog.
    #[arg(long, alias = "queue")]
    pub backlog: Option<u32>,

    /// Connection limit hint passed to workers.
    #[arg(long)]
    pub max_connections: Option<u32>,

    /// Seconds workers get to drain before they are killed.
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Seconds a replacement supervisor gets to confirm readiness.
    #[arg(long)]
    pub restart_timeout: Option<u64>,

    /// Detach from the controlling terminal.
    #[arg(long)]
    pub daemonize: bool,

    /// Pidfile location.
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Name used in process titles and the default log file.
    #[arg(long)]
    pub name: Option<String>,

    /// Append logs to this file instead of stderr.
    #[arg(long)]
    pub logfile: Option<PathBuf>,

    /// Command that starts a replacement supervisor on SIGHUP, split on whitespace.
    #[arg(long, value_name = "COMMAND")]
    pub restart_command: Option<String>,

    /// Worker command, given after `--`.
    #[arg(last = true, value_name = "WORKER_CMD")]
    pub worker: Vec<String>,
}

impl StartArgs {
    /// Flag values as a config layer.
    pub fn overrides(&self) -> RawConfig {
        RawConfig {
            pool: self.pool,
            host: self.host.clone(),
            port: self.port,
            socket: self.socket.clone(),
            backlog: self.backlog,
            max_connections: self.max_connections,
            timeout: self.timeout,
            restart_timeout: self.restart_timeout,
            daemonize: self.daemonize.then_some(true),
            pidfile: self.pidfile.clone(),
            name: self.name.clone(),
            logfile: self.logfile.clone(),
            restart_command: self
                .restart_command
                .as_deref()
                .map(|command| command.split_whitespace().map(str::to_string).collect()),
            worker: (!self.worker.is_empty()).then(|| self.worker.clone()),
        }
    }

    /// Loads the config file, if any, and layers the flags on top.
    pub fn load(&self) -> Result<SupervisorConfig, ConfigError> {
        let base = match &self.config {
            Some(path) => load_config(path)?,
            None => RawConfig::default(),
        };
        SupervisorConfig::from_raw(base.merge(self.overrides()))
    }
}

/// Locates the supervisor for `stop`, `restart` and `status`.
#[derive(Args, Debug)]
pub struct ControlArgs {
    /// Pidfile of the supervisor.
    #[arg(long)]
    pub pidfile: Option<PathBuf>,

    /// Read the pidfile location from this configuration file.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl ControlArgs {
    /// `--pidfile`, then the config file's `pidfile`, then the default.
    pub fn pidfile(&self) -> Result<PidFile, ConfigError> {
        if let Some(path) = &self.pidfile {
            return Ok(PidFile::new(path));
        }
        let from_config = match &self.config {
            Some(path) => load_config(path)?.pidfile,
            None => None,
        };
        Ok(PidFile::new(
            from_config.unwrap_or_else(|| PathBuf::from(DEFAULT_PIDFILE)),
        ))
    }
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
