//! Configuration management for prefork.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    env, fmt, fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::ConfigError;

/// Host used when neither `host` nor `socket` is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Port used when neither `port` nor `socket` is configured.
pub const DEFAULT_PORT: u16 = 3000;
/// Listen queue depth.
pub const DEFAULT_BACKLOG: u32 = 1024;
/// Per-worker connection hint.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 1024;
/// Drain grace period in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
/// Time a replacement supervisor gets to write its pidfile.
pub const DEFAULT_RESTART_TIMEOUT_SECS: u64 = 30;
/// Pidfile location.
pub const DEFAULT_PIDFILE: &str = "/tmp/prefork.pid";
/// Display name used for process titles and the default log file.
pub const DEFAULT_NAME: &str = "prefork";

/// Configuration file contents. Every field is optional so that command-line
/// flags can be layered on top with [`RawConfig::merge`].
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfig {
    /// Number of worker processes.
    pub pool: Option<usize>,
    /// TCP host to bind.
    pub host: Option<String>,
    /// TCP port to bind.
    pub port: Option<u16>,
    /// Filesystem path of a Unix domain socket to bind instead of TCP.
    pub socket: Option<PathBuf>,
    /// Listen backlog.
    #[serde(alias = "queue")]
    pub backlog: Option<u32>,
    /// Hint forwarded to each worker.
    pub max_connections: Option<u32>,
    /// Drain grace period in seconds.
    pub timeout: Option<u64>,
    /// Seconds a replacement supervisor has to confirm readiness.
    pub restart_timeout: Option<u64>,
    /// Detach from the controlling terminal.
    pub daemonize: Option<bool>,
    /// Pidfile location.
    pub pidfile: Option<PathBuf>,
    /// Process display name.
    pub name: Option<String>,
    /// Log file; defaults to `/tmp/<name>.log` when daemonized.
    pub logfile: Option<PathBuf>,
    /// argv used to start a replacement supervisor on hangup.
    pub restart_command: Option<Vec<String>>,
    /// argv executed by each worker.
    pub worker: Option<Vec<String>>,
}

impl RawConfig {
    /// Layers `overrides` on top of `self`, field by field.
    pub fn merge(self, overrides: RawConfig) -> RawConfig {
        RawConfig {
            pool: overrides.pool.or(self.pool),
            host: overrides.host.or(self.host),
            port: overrides.port.or(self.port),
            socket: overrides.socket.or(self.socket),
            backlog: overrides.backlog.or(self.backlog),
            max_connections: overrides.max_connections.or(self.max_connections),
            timeout: overrides.timeout.or(self.timeout),
            restart_timeout: overrides.restart_timeout.or(self.restart_timeout),
            daemonize: overrides.daemonize.or(self.daemonize),
            pidfile: overrides.pidfile.or(self.pidfile),
            name: overrides.name.or(self.name),
            logfile: overrides.logfile.or(self.logfile),
            restart_command: overrides.restart_command.or(self.restart_command),
            worker: overrides.worker.or(self.worker),
        }
    }
}

/// Where the listening socket is bound. Exactly one of TCP or a filesystem path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindTarget {
    /// `host:port` TCP listener.
    Tcp { host: String, port: u16 },
    /// Unix domain socket at a filesystem path.
    Unix(PathBuf),
}

impl BindTarget {
    /// Filesystem path of the socket, for Unix targets.
    pub fn path(&self) -> Option<&Path> {
        match self {
            BindTarget::Unix(path) => Some(path),
            BindTarget::Tcp { .. } => None,
        }
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Tcp { host, port } => write!(f, "port {port} on {host}"),
            BindTarget::Unix(path) => write!(f, "socket {}", path.display()),
        }
    }
}

/// Validated, immutable supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub pool: NonZeroUsize,
    pub bind: BindTarget,
    pub backlog: u32,
    pub max_connections: u32,
    pub drain_timeout: Duration,
    pub restart_timeout: Duration,
    pub daemonize: bool,
    pub pidfile: PathBuf,
    pub name: Option<String>,
    pub logfile: Option<PathBuf>,
    pub restart_command: Option<Vec<String>>,
    pub worker_command: Option<Vec<String>>,
}

impl SupervisorConfig {
    /// The single validating constructor.
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let pool = NonZeroUsize::new(raw.pool.unwrap_or(1))
            .ok_or_else(|| ConfigError::invalid("pool", "must be at least 1"))?;

        let bind = match raw.socket {
            Some(path) => {
                if raw.host.is_some() || raw.port.is_some() {
                    return Err(ConfigError::invalid(
                        "socket",
                        "cannot be combined with host or port",
                    ));
                }
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::invalid("socket", "path is empty"));
                }
                BindTarget::Unix(absolute(path, "socket")?)
            }
            None => BindTarget::Tcp {
                host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: raw.port.unwrap_or(DEFAULT_PORT),
            },
        };

        let backlog = raw.backlog.unwrap_or(DEFAULT_BACKLOG);
        if backlog == 0 {
            return Err(ConfigError::invalid("backlog", "must be at least 1"));
        }

        let restart_timeout = raw.restart_timeout.unwrap_or(DEFAULT_RESTART_TIMEOUT_SECS);
        if restart_timeout == 0 {
            return Err(ConfigError::invalid("restart_timeout", "must be at least 1"));
        }

        let restart_command = non_empty_argv(raw.restart_command, "restart_command")?;
        let worker_command = non_empty_argv(raw.worker, "worker")?;

        let name = raw.name.filter(|name| !name.trim().is_empty());
        let logfile = raw.logfile.map(|p| absolute(p, "logfile")).transpose()?;

        Ok(Self {
            pool,
            bind,
            backlog,
            max_connections: raw.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS),
            drain_timeout: Duration::from_secs(
                raw.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS),
            ),
            restart_timeout: Duration::from_secs(restart_timeout),
            daemonize: raw.daemonize.unwrap_or(false),
            pidfile: absolute(
                raw.pidfile.unwrap_or_else(|| PathBuf::from(DEFAULT_PIDFILE)),
                "pidfile",
            )?,
            name,
            logfile,
            restart_command,
            worker_command,
        })
    }

    /// Name shown in process titles and log lines.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(DEFAULT_NAME)
    }

    /// Title of the supervisor process.
    pub fn master_name(&self) -> String {
        format!("{} master", self.display_name())
    }

    /// Log destination, if logs should go to a file rather than stderr.
    pub fn log_path(&self) -> Option<PathBuf> {
        match (&self.logfile, self.daemonize) {
            (Some(path), _) => Some(path.clone()),
            (None, true) => Some(PathBuf::from(format!("/tmp/{}.log", self.display_name()))),
            (None, false) => None,
        }
    }

    /// Whether hangup triggers a graceful restart rather than a shutdown.
    pub fn restart_enabled(&self) -> bool {
        self.restart_command.is_some()
    }
}

fn absolute(path: PathBuf, field: &'static str) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path);
    }
    std::path::absolute(&path).map_err(|err| ConfigError::invalid(field, err.to_string()))
}

fn non_empty_argv(
    argv: Option<Vec<String>>,
    field: &'static str,
) -> Result<Option<Vec<String>>, ConfigError> {
    match argv {
        Some(argv) if argv.is_empty() || argv[0].trim().is_empty() => {
            Err(ConfigError::invalid(field, "command is empty"))
        }
        other => Ok(other),
    }
}

/// Expands `$VAR` and `${VAR}` references against the process environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?")
        .map_err(|err| ConfigError::invalid("config", err.to_string()))?;

    let mut missing = None;
    let expanded = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var_name) => Err(ConfigError::MissingVariable(var_name)),
        None => Ok(expanded.into_owned()),
    }
}

/// Loads and parses a YAML configuration file, expanding environment variables.
pub fn load_config(config_path: &Path) -> Result<RawConfig, ConfigError> {
    let content = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;

    let expanded = expand_env_vars(&content)?;
    let config: RawConfig = serde_yaml::from_str(&expanded)?;
    Ok(config)
}
