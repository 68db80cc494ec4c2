//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The admin token is loaded from the ADMIN_TOKEN env var only, never stored
//! in the TOML, to avoid leaking secrets through config files.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub pool: PoolConfig,
    #[serde(default)]
    pub breaker: BreakerSettings,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Work-traffic listener (select/outcome/health/metrics)
    pub listen_addr: SocketAddr,
    /// Admin listener (account management) — separate port, not exposed
    /// alongside work traffic
    pub admin_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bearer token required on admin endpoints; from ADMIN_TOKEN env var
    #[serde(skip)]
    pub admin_token: Option<Secret<String>>,
}

/// Pool state locations and window sizing
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    /// Account registry JSON file
    pub accounts_file: PathBuf,
    /// Circuit transition audit log (JSONL)
    pub audit_file: PathBuf,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

/// Circuit breaker thresholds
#[derive(Debug, Deserialize)]
pub struct BreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            success_threshold: default_success_threshold(),
        }
    }
}

impl BreakerSettings {
    pub fn to_breaker_config(&self) -> account_pool::BreakerConfig {
        account_pool::BreakerConfig {
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            success_threshold: self.success_threshold,
        }
    }
}

fn default_max_connections() -> usize {
    1000
}

fn default_window_secs() -> u64 {
    60
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_success_threshold() -> u32 {
    3
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if config.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if config.pool.window_secs == 0 {
            return Err(common::Error::Config(
                "window_secs must be greater than 0".into(),
            ));
        }
        if config.breaker.failure_threshold == 0 {
            return Err(common::Error::Config(
                "failure_threshold must be greater than 0".into(),
            ));
        }
        if config.breaker.success_threshold == 0 {
            return Err(common::Error::Config(
                "success_threshold must be greater than 0".into(),
            ));
        }
        if config.breaker.cooldown_secs == 0 {
            return Err(common::Error::Config(
                "cooldown_secs must be greater than 0".into(),
            ));
        }
        if config.server.listen_addr == config.server.admin_addr {
            return Err(common::Error::Config(
                "listen_addr and admin_addr must differ — the admin surface gets its own port"
                    .into(),
            ));
        }

        if let Ok(token) = std::env::var("ADMIN_TOKEN") {
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.server.admin_token = Some(Secret::new(token));
            }
        }

        Ok(config)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("upstream-pool.toml")
    }
}
