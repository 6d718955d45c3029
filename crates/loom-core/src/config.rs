use crate::error::{LoomError, Result};
use crate::ledger::RetryPolicy;
use crate::paths;
use crate::types::{ReplayMode, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// StoreKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// One YAML document per ceremony under `.loom/ceremonies/`.
    #[default]
    File,
    /// Embedded redb database at `.loom/ledger.redb`. Single process.
    Redb,
}

// ---------------------------------------------------------------------------
// TransportConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// One OS process per worker.
    Isolated {
        /// Worker executable. Defaults to the running `loom` binary.
        #[serde(default)]
        program: Option<String>,
        /// Extra arguments placed before the `worker` subcommand.
        #[serde(default)]
        args: Vec<String>,
        /// Sandbox launcher prepended to the worker command line, e.g.
        /// `["docker", "run", "--rm", "-v", "/work:/work", "loom-worker"]`.
        #[serde(default)]
        wrapper: Vec<String>,
    },
    /// A task inside the coordinator process.
    Lightweight,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Isolated {
            program: None,
            args: Vec::new(),
            wrapper: Vec::new(),
        }
    }
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::Isolated { .. } => TransportKind::Isolated,
            TransportConfig::Lightweight => TransportKind::Lightweight,
        }
    }
}

// ---------------------------------------------------------------------------
// CommandConfig / ResponderConfig
// ---------------------------------------------------------------------------

/// An external program that speaks JSON on stdin/stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponderConfig {
    #[default]
    AcceptAll,
    Command(CommandConfig),
}

// ---------------------------------------------------------------------------
// ReplayConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Mode the monitor applies to stalled or failed tasks.
    #[serde(default = "default_replay_mode")]
    pub default_mode: ReplayMode,
}

fn default_replay_mode() -> ReplayMode {
    ReplayMode::Resume
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            default_mode: default_replay_mode(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Invitations per task before it settles as FAILED.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Charged reverts per ceremony before it is ABANDONED.
    #[serde(default = "default_global_retry_budget")]
    pub global_retry_budget: u32,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub conflict_retry: RetryPolicy,
    #[serde(default = "default_spawn_retry")]
    pub spawn_retry: RetryPolicy,
    #[serde(default)]
    pub store: StoreKind,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decomposer: Option<CommandConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work: Option<CommandConfig>,
    #[serde(default)]
    pub responder: ResponderConfig,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_global_retry_budget() -> u32 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    5
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_spawn_retry() -> RetryPolicy {
    RetryPolicy::new(3, 200)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            global_retry_budget: default_global_retry_budget(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            replay: ReplayConfig::default(),
            conflict_retry: RetryPolicy::default(),
            spawn_retry: default_spawn_retry(),
            store: StoreKind::default(),
            transport: TransportConfig::default(),
            decomposer: None,
            work: None,
            responder: ResponderConfig::default(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(LoomError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Write this config unless one already exists. Returns true if written.
    pub fn save_if_missing(&self, root: &Path) -> Result<bool> {
        let data = serde_yaml::to_string(self)?;
        crate::io::write_if_missing(&paths::config_path(root), data.as_bytes())
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.max_attempts == 0 {
            warnings.push(warn(
                WarnLevel::Error,
                "max_attempts is 0: no task could ever be offered".into(),
            ));
        } else if self.max_attempts > 10 {
            warnings.push(warn(
                WarnLevel::Warning,
                format!("max_attempts={} (>10 is unusual)", self.max_attempts),
            ));
        }

        if self.heartbeat_timeout_secs == 0 {
            warnings.push(warn(WarnLevel::Error, "heartbeat_timeout_secs is 0".into()));
        }
        if self.heartbeat_interval_secs >= self.heartbeat_timeout_secs {
            warnings.push(warn(
                WarnLevel::Warning,
                format!(
                    "heartbeat_interval_secs ({}) is not below heartbeat_timeout_secs ({}); \
                     healthy workers will be judged stalled",
                    self.heartbeat_interval_secs, self.heartbeat_timeout_secs
                ),
            ));
        }

        if let TransportConfig::Isolated {
            program, wrapper, ..
        } = &self.transport
        {
            if self.store == StoreKind::Redb {
                warnings.push(warn(
                    WarnLevel::Error,
                    "isolated transport needs a ledger workers can open from another \
                     process; use store: file"
                        .into(),
                ));
            }
            match wrapper.first() {
                Some(launcher) => {
                    if which::which(launcher).is_err() {
                        warnings.push(warn(
                            WarnLevel::Warning,
                            format!("sandbox launcher '{launcher}' not found on PATH"),
                        ));
                    }
                }
                // Inside a wrapper the program resolves in the sandbox, not here.
                None => {
                    if let Some(program) = program {
                        if which::which(program).is_err() {
                            warnings.push(warn(
                                WarnLevel::Warning,
                                format!("worker program '{program}' not found on PATH"),
                            ));
                        }
                    }
                }
            }
        }

        match &self.decomposer {
            Some(cmd) => warnings.extend(check_command("decomposer", cmd)),
            None => warnings.push(warn(
                WarnLevel::Warning,
                "no decomposer configured: 'loom begin' needs --graph".into(),
            )),
        }
        match &self.work {
            Some(cmd) => warnings.extend(check_command("work", cmd)),
            None => warnings.push(warn(
                WarnLevel::Warning,
                "no work command configured: every accepted task will fail".into(),
            )),
        }
        if let ResponderConfig::Command(cmd) = &self.responder {
            warnings.extend(check_command("responder", cmd));
        }

        warnings
    }
}

fn warn(level: WarnLevel, message: String) -> ConfigWarning {
    ConfigWarning { level, message }
}

fn check_command(section: &str, cmd: &CommandConfig) -> Option<ConfigWarning> {
    if cmd.command.trim().is_empty() {
        Some(warn(WarnLevel::Error, format!("{section}.command is empty")))
    } else if which::which(&cmd.command).is_err() {
        Some(warn(
            WarnLevel::Warning,
            format!("{section}.command '{}' not found on PATH", cmd.command),
        ))
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
