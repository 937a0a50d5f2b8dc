// src/config.rs

//! Configuration file parsing for both daemons.
//!
//! Supports TOML configuration files:
//! - Worker: listen address, auth, `[master]` uplink, `[mysql]` storage,
//!   `[launcher]` child-process template, `[targets]` concurrency map
//! - Master: listen address, auth, keepalive and poke-throttle intervals
//!
//! Parsing is serde-driven; `validate()` enforces the rules that cannot be
//! expressed in types (reserved target names, positive concurrency, a
//! non-empty launcher command).

use crate::error::{Error, Result};
use crate::net::connection::AuthPolicy;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Target name that can never be configured or added at runtime.
pub const RESERVED_TARGET: &str = "null";

/// Worker daemon configuration (`worker.toml`)
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_worker_port")]
    pub port: u16,

    /// Shared secret; auth is enabled when present
    #[serde(default)]
    pub password: Option<String>,

    /// Accept loopback peers without a password
    #[serde(default = "default_true")]
    pub always_allow_localhost: bool,

    /// Display name advertised to the master
    #[serde(default)]
    pub name: Option<String>,

    /// Master uplink; absent means standalone operation
    #[serde(default)]
    pub master: Option<MasterLinkSection>,

    /// Job table storage
    pub mysql: MysqlSection,

    /// Child-process launcher
    pub launcher: LauncherSection,

    /// Target name -> concurrency limit
    pub targets: BTreeMap<String, u32>,
}

/// Master daemon configuration (`master.toml`)
#[derive(Debug, Clone, Deserialize)]
pub struct MasterConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_master_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default = "default_true")]
    pub always_allow_localhost: bool,

    /// Seconds between keepalive pings to registered workers
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,

    /// Poke coalescing window in seconds
    #[serde(default = "default_poke_throttle_interval")]
    pub poke_throttle_interval: f64,
}

/// `[master]` section of the worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MasterLinkSection {
    pub host: String,

    #[serde(default = "default_master_port")]
    pub port: u16,

    /// Password sent with requests to the master
    #[serde(default)]
    pub password: Option<String>,

    /// Seconds to wait before redialing a lost master connection
    #[serde(default = "default_reconnect_timeout")]
    pub reconnect_timeout: u64,
}

/// `[mysql]` section of the worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MysqlSection {
    #[serde(default = "default_mysql_host")]
    pub host: String,

    #[serde(default = "default_mysql_port")]
    pub port: u16,

    pub user: String,

    #[serde(default)]
    pub password: String,

    pub database: String,

    /// Job table name
    #[serde(default = "default_table")]
    pub table: String,

    /// Row cap per claim transaction; 0 disables the LIMIT clause entirely,
    /// claiming every matching row in one transaction
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: u32,
}

/// `[launcher]` section of the worker configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LauncherSection {
    /// Command template; the literal `{id}` is replaced with the job id and
    /// the result is split on whitespace into argv
    pub command: String,

    /// Working directory for spawned children
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Cap on captured bytes per stream
    #[serde(default = "default_max_output_buffer")]
    pub max_output_buffer: usize,

    /// Environment additions for spawned children
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_worker_port() -> u16 {
    7080
}

fn default_master_port() -> u16 {
    7081
}

fn default_true() -> bool {
    true
}

fn default_ping_interval() -> u64 {
    30
}

fn default_poke_throttle_interval() -> f64 {
    0.5
}

fn default_reconnect_timeout() -> u64 {
    10
}

fn default_mysql_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_table() -> String {
    "jobs".to_string()
}

fn default_fetch_limit() -> u32 {
    100
}

fn default_max_output_buffer() -> usize {
    1024 * 1024
}

impl WorkerConfig {
    /// Load and validate a worker configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".to_string()));
        }
        if self.targets.is_empty() {
            return Err(Error::Config("[targets] must name at least one target".to_string()));
        }
        for (name, concurrency) in &self.targets {
            validate_target(name, *concurrency)?;
        }
        if self.launcher.command.trim().is_empty() {
            return Err(Error::Config("launcher command must not be empty".to_string()));
        }
        if self.launcher.max_output_buffer == 0 {
            return Err(Error::Config("max_output_buffer must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn auth(&self) -> AuthPolicy {
        AuthPolicy {
            password: self.password.clone(),
            allow_localhost: self.always_allow_localhost,
        }
    }
}

impl MasterConfig {
    /// Load and validate a master configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("cannot parse {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".to_string()));
        }
        if self.poke_throttle_interval <= 0.0 {
            return Err(Error::Config("poke_throttle_interval must be positive".to_string()));
        }
        if self.ping_interval == 0 {
            return Err(Error::Config("ping_interval must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn auth(&self) -> AuthPolicy {
        AuthPolicy {
            password: self.password.clone(),
            allow_localhost: self.always_allow_localhost,
        }
    }
}

/// Shared rule for configured and runtime-added targets.
pub fn validate_target(name: &str, concurrency: u32) -> Result<()> {
    if name == RESERVED_TARGET {
        return Err(Error::Validation(format!("target name '{RESERVED_TARGET}' is reserved")));
    }
    if name.is_empty() {
        return Err(Error::Validation("target name must not be empty".to_string()));
    }
    if concurrency == 0 {
        return Err(Error::Validation(format!(
            "target '{name}': concurrency must be a positive integer"
        )));
    }
    Ok(())
}
