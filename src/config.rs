//! Failover Configuration
//!
//! This module provides configuration structures for a failover peer:
//! the election group it contends in, the per-state test intervals,
//! the heartbeat store backend and logging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::state::StateKind;

/// Main failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Election group and peer identity
    pub election: ElectionConfig,

    /// Per-state test intervals
    #[serde(default)]
    pub intervals: IntervalConfig,

    /// Heartbeat store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Demo worker configuration (used by the `run` command)
    #[serde(default)]
    pub demo: DemoConfig,
}

/// Election group and peer identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Election group name, peers with the same name contend together
    pub name: String,

    /// Identity of this peer in heartbeat records. Never rendered, so every
    /// process loading a generated file resolves its own `host:pid`.
    #[serde(default = "default_member", skip_serializing)]
    pub member: String,

    /// Initial fencing identifier
    #[serde(default)]
    pub identifier: Option<String>,

    /// Replace the store tests with deterministic counters
    #[serde(default)]
    pub test_mode: bool,
}

/// Per-state test intervals in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalConfig {
    /// Delay before the first master test (0 = next tick)
    #[serde(default)]
    pub init_ms: u64,

    /// Master renewal interval, also the heartbeat freshness window
    #[serde(default = "default_master_ms")]
    pub master_ms: u64,

    /// Slave test interval (slightly longer than master)
    #[serde(default = "default_slave_ms")]
    pub slave_ms: u64,

    /// Ticking observation delay
    #[serde(default = "default_ticking_ms")]
    pub ticking_ms: u64,

    /// Retry interval while the store is failing
    #[serde(default = "default_error_ms")]
    pub error_ms: u64,
}

/// Heartbeat store backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, only shared by peers of one process
    Memory,
    /// SQLite database file, shared by processes on one host
    Sqlite,
}

/// Heartbeat store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    /// Database file for the SQLite backend
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Idle period after which heartbeat records are purged
    /// (don't set the intervals above this)
    #[serde(default = "default_expire_after_secs")]
    pub expire_after_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Demo worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemoConfig {
    /// Task submission period in milliseconds
    #[serde(default = "default_submit_every_ms")]
    pub submit_every_ms: u64,

    /// Reject every n-th task (0 = never)
    #[serde(default = "default_reject_every")]
    pub reject_every: u64,

    /// Delay before a rejection in milliseconds
    #[serde(default = "default_reject_delay_ms")]
    pub reject_delay_ms: u64,
}

// Default value functions
fn default_member() -> String {
    let host = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}

fn default_master_ms() -> u64 {
    2000
}

fn default_slave_ms() -> u64 {
    2500
}

fn default_ticking_ms() -> u64 {
    2000
}

fn default_error_ms() -> u64 {
    5000
}

fn default_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

fn default_store_path() -> PathBuf {
    PathBuf::from("/var/lib/failover/heartbeats.db")
}

fn default_expire_after_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_submit_every_ms() -> u64 {
    1000
}

fn default_reject_every() -> u64 {
    10
}

fn default_reject_delay_ms() -> u64 {
    5000
}

impl ElectionConfig {
    /// Election config for group `name` with the default member identity
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            member: default_member(),
            identifier: None,
            test_mode: false,
        }
    }

    /// Override the member identity
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = member.into();
        self
    }
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            init_ms: 0,
            master_ms: default_master_ms(),
            slave_ms: default_slave_ms(),
            ticking_ms: default_ticking_ms(),
            error_ms: default_error_ms(),
        }
    }
}

impl IntervalConfig {
    /// Interval of a state
    pub fn for_state(&self, state: StateKind) -> Duration {
        let ms = match state {
            StateKind::Init => self.init_ms,
            StateKind::Master => self.master_ms,
            StateKind::Slave => self.slave_ms,
            StateKind::Ticking => self.ticking_ms,
            StateKind::Error => self.error_ms,
        };
        Duration::from_millis(ms)
    }

    /// Override the interval of a state given by name
    pub fn set(&mut self, state: &str, ms: u64) -> crate::Result<()> {
        match StateKind::parse(state)? {
            StateKind::Init => self.init_ms = ms,
            StateKind::Master => self.master_ms = ms,
            StateKind::Slave => self.slave_ms = ms,
            StateKind::Ticking => self.ticking_ms = ms,
            StateKind::Error => self.error_ms = ms,
        }
        Ok(())
    }

    /// Parse and apply a `state=ms` override
    pub fn apply_override(&mut self, value: &str) -> crate::Result<()> {
        let (state, ms) = value.split_once('=').ok_or_else(|| {
            crate::Error::Config(format!("interval override '{}' is not state=ms", value))
        })?;
        let ms = ms.trim().parse::<u64>().map_err(|e| {
            crate::Error::Config(format!("interval override '{}': {}", value, e))
        })?;
        self.set(state, ms)
    }

    /// Heartbeat freshness window
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.master_ms)
    }

    /// Largest configured interval
    pub fn max(&self) -> Duration {
        StateKind::ALL
            .iter()
            .map(|state| self.for_state(*state))
            .max()
            .unwrap_or_default()
    }

    /// Validate the intervals
    pub fn validate(&self) -> crate::Result<()> {
        for state in [StateKind::Master, StateKind::Slave, StateKind::Error] {
            if self.for_state(state).is_zero() {
                return Err(crate::Error::Config(format!(
                    "intervals.{}_ms must be greater than zero",
                    state
                )));
            }
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: default_store_path(),
            expire_after_secs: default_expire_after_secs(),
        }
    }
}

impl StoreConfig {
    /// Get the record idle expiry as Duration
    pub fn expire_after(&self) -> Duration {
        Duration::from_secs(self.expire_after_secs)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            submit_every_ms: default_submit_every_ms(),
            reject_every: default_reject_every(),
            reject_delay_ms: default_reject_delay_ms(),
        }
    }
}

impl DemoConfig {
    /// Get the submission period as Duration
    pub fn submit_every(&self) -> Duration {
        Duration::from_millis(self.submit_every_ms.max(1))
    }

    /// Get the rejection delay as Duration
    pub fn reject_delay(&self) -> Duration {
        Duration::from_millis(self.reject_delay_ms)
    }
}

impl FailoverConfig {
    /// Configuration for group `name` with all defaults
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            election: ElectionConfig::new(name),
            intervals: IntervalConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            demo: DemoConfig::default(),
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: FailoverConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> crate::Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("cannot render configuration: {}", e)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.election.name.is_empty() {
            return Err(crate::Error::Config("election.name cannot be empty".into()));
        }

        if self.election.member.is_empty() {
            return Err(crate::Error::Config("election.member cannot be empty".into()));
        }

        self.intervals.validate()?;

        if self.store.expire_after() <= self.intervals.max() {
            return Err(crate::Error::Config(format!(
                "store.expire_after_secs ({}s) must exceed the largest interval ({}ms)",
                self.store.expire_after_secs,
                self.intervals.max().as_millis()
            )));
        }

        if self.store.backend == StoreBackend::Sqlite && self.store.path.as_os_str().is_empty() {
            return Err(crate::Error::Config("store.path cannot be empty".into()));
        }

        Ok(())
    }
}
