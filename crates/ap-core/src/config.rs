use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV_VAR: &str = "AUTOPILOT_CONFIG";

/// Top-level configuration loaded from `~/.autopilot/config.toml`.
///
/// Every section falls back to its defaults, so a partial file (or no file at
/// all) is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub work_log: WorkLogConfig,
    #[serde(default = "default_executors")]
    pub executors: BTreeMap<String, ExecutorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            engine: EngineConfig::default(),
            supervisor: SupervisorConfig::default(),
            dispatch: DispatchConfig::default(),
            approval: ApprovalConfig::default(),
            risk: RiskConfig::default(),
            work_log: WorkLogConfig::default(),
            executors: default_executors(),
        }
    }
}

impl Config {
    /// Load config from `$AUTOPILOT_CONFIG` or `~/.autopilot/config.toml`,
    /// falling back to defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            let cfg = Config::default();
            cfg.validate()?;
            Ok(cfg)
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let cfg: Config = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        self.validate()?;
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Semantic validation for settings that are not fully expressible via type checks.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        self.supervisor.validate()?;
        if self.supervisor.stall_threshold_secs <= self.engine.tick_interval_secs {
            return Err(ConfigError::Validation(format!(
                "supervisor.stall_threshold_secs ({}) must exceed engine.tick_interval_secs ({})",
                self.supervisor.stall_threshold_secs, self.engine.tick_interval_secs
            )));
        }
        if self.dispatch.chain.is_empty() {
            return Err(ConfigError::Validation(
                "dispatch.chain must name at least one executor".into(),
            ));
        }
        for name in &self.dispatch.chain {
            if !self.executors.contains_key(name) {
                return Err(ConfigError::Validation(format!(
                    "dispatch.chain references unknown executor `{name}`"
                )));
            }
        }
        if self.dispatch.default_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "dispatch.default_timeout_ms must be > 0".into(),
            ));
        }
        if self.approval.expiry_secs == 0 {
            return Err(ConfigError::Validation("approval.expiry_secs must be > 0".into()));
        }
        if self.work_log.retention == 0 {
            return Err(ConfigError::Validation("work_log.retention must be > 0".into()));
        }
        Ok(())
    }

    /// Data directory with a leading `~/` expanded to the home directory.
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.general.data_dir)
    }

    fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".autopilot")
            .join("config.toml")
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest),
        None => PathBuf::from(path),
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("validation: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneralConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// `human` or `json`.
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_name() -> String {
    "autopilot".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "human".into()
}
fn default_data_dir() -> String {
    "~/.autopilot".into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Upper bound on a single proposer call.
    #[serde(default = "default_proposer_timeout_secs")]
    pub proposer_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            proposer_timeout_secs: default_proposer_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn proposer_timeout(&self) -> Duration {
        Duration::from_secs(self.proposer_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_secs == 0 {
            return Err(ConfigError::Validation("engine.tick_interval_secs must be > 0".into()));
        }
        if self.proposer_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "engine.proposer_timeout_secs must be > 0".into(),
            ));
        }
        Ok(())
    }
}

fn default_tick_interval_secs() -> u64 {
    60
}
fn default_proposer_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Inactivity longer than this (outside rest windows) is a stall.
    #[serde(default = "default_stall_threshold_secs")]
    pub stall_threshold_secs: u64,
    /// Minimum interval between two automatic restarts.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Restarts without any observed activity before giving up.
    #[serde(default = "default_max_unproductive_restarts")]
    pub max_unproductive_restarts: u32,
    #[serde(default)]
    pub rest_windows: Vec<RestWindow>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            stall_threshold_secs: default_stall_threshold_secs(),
            cooldown_secs: default_cooldown_secs(),
            max_unproductive_restarts: default_max_unproductive_restarts(),
            rest_windows: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn stall_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stall_threshold_secs as i64)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.cooldown_secs as i64)
    }

    /// Liveness heartbeat period while work is in flight: a quarter of the
    /// stall threshold.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_secs.saturating_mul(250))
    }

    /// Returns `true` when `now` falls inside any configured rest window.
    pub fn is_resting(&self, now: DateTime<Utc>) -> bool {
        self.rest_windows.iter().any(|w| w.contains(now))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "supervisor.check_interval_secs must be > 0".into(),
            ));
        }
        if self.max_unproductive_restarts == 0 {
            return Err(ConfigError::Validation(
                "supervisor.max_unproductive_restarts must be > 0".into(),
            ));
        }
        for window in &self.rest_windows {
            window.bounds()?;
        }
        Ok(())
    }
}

fn default_check_interval_secs() -> u64 {
    30
}
fn default_stall_threshold_secs() -> u64 {
    600
}
fn default_cooldown_secs() -> u64 {
    300
}
fn default_max_unproductive_restarts() -> u32 {
    3
}

/// A daily UTC window (`"HH:MM"`) during which the engine is expected to idle.
/// `end` earlier than `start` wraps past midnight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestWindow {
    pub start: String,
    pub end: String,
}

impl RestWindow {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    pub fn bounds(&self) -> Result<(NaiveTime, NaiveTime), ConfigError> {
        let parse = |s: &str| {
            NaiveTime::parse_from_str(s, "%H:%M").map_err(|e| {
                ConfigError::Validation(format!("rest window time `{s}` is not HH:MM: {e}"))
            })
        };
        Ok((parse(&self.start)?, parse(&self.end)?))
    }

    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let Ok((start, end)) = self.bounds() else {
            return false;
        };
        let t = now.time();
        if start <= end {
            t >= start && t < end
        } else {
            t >= start || t < end
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Used when an action's plan carries no timeout.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Executor names, tried in order.
    #[serde(default = "default_chain")]
    pub chain: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            chain: default_chain(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    300_000
}
fn default_chain() -> Vec<String> {
    vec!["shell".into()]
}

/// Backend definition referenced by name from `dispatch.chain`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutorConfig {
    /// Runs a local process. Without a fixed `program`, the program and args
    /// are read from the action payload.
    Command {
        #[serde(default)]
        program: Option<String>,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        working_dir: Option<String>,
        /// Exit code the process uses to signal rate limiting.
        #[serde(default)]
        rate_limited_exit_code: Option<i32>,
        /// Exit code the process uses to signal the backend is unavailable.
        #[serde(default)]
        unavailable_exit_code: Option<i32>,
    },
    /// Never ready; placeholder for a backend that is not wired up.
    Stub {
        #[serde(default)]
        reason: String,
    },
}

fn default_executors() -> BTreeMap<String, ExecutorConfig> {
    let mut map = BTreeMap::new();
    map.insert(
        "shell".to_string(),
        ExecutorConfig::Command {
            program: None,
            args: Vec::new(),
            working_dir: None,
            rate_limited_exit_code: None,
            unavailable_exit_code: None,
        },
    );
    map
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_expiry_secs")]
    pub expiry_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            expiry_secs: default_expiry_secs(),
        }
    }
}

impl ApprovalConfig {
    pub fn expiry(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.expiry_secs as i64)
    }
}

fn default_expiry_secs() -> u64 {
    3600
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Action types that run without approval.
    #[serde(default = "default_safe_action_types")]
    pub safe_action_types: Vec<String>,
    /// Action types that always need approval, even if listed as safe.
    #[serde(default)]
    pub manual_types: Vec<String>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            safe_action_types: default_safe_action_types(),
            manual_types: Vec::new(),
        }
    }
}

fn default_safe_action_types() -> Vec<String> {
    vec!["research".into(), "analysis".into(), "planning".into()]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkLogConfig {
    /// Entries kept; older ones are evicted.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

impl Default for WorkLogConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

fn default_retention() -> usize {
    1000
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
