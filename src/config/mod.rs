//! Configuration Management
//!
//! Loads Stagehand configuration from TOML files.
//! Configuration includes:
//! - Plugin search roots and requirements added to every resolution
//! - Network settings for the scheduling service
//! - Scheduling policy (default scheduler, liveness deadline)
//! - Logging filter and format

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::errors::StagehandError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub scheduling: SchedulingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where plugins are discovered and what every query implicitly requires.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Search roots scanned recursively for plugin declarations
    #[serde(default)]
    pub repos: Vec<PathBuf>,
    /// Constraint queries appended to every resolution query
    #[serde(default)]
    pub default_require: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on a single unary RPC round trip
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,
    /// How long a started processor has to register before giving up
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            rpc_timeout_secs: default_rpc_timeout(),
            registration_timeout_secs: default_registration_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Scheduler used by commands that don't name one
    #[serde(default = "default_scheduler")]
    pub default_scheduler: String,
    /// Processors silent for longer than this are marked not responding
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// Commands of one action graph running at the same time
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            default_scheduler: default_scheduler(),
            liveness_timeout_secs: default_liveness_timeout(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8588
}
fn default_rpc_timeout() -> u64 {
    30
}
fn default_registration_timeout() -> u64 {
    60
}
fn default_scheduler() -> String {
    "local".to_string()
}
fn default_liveness_timeout() -> u64 {
    120
}
fn default_max_concurrency() -> usize {
    8
}
fn default_log_filter() -> String {
    "stagehand=info".to_string()
}

impl Config {
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config: Config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config from {}", p))?;
                toml::from_str(&content).context("Failed to parse config")?
            }
            None => {
                let mut default_paths = vec![PathBuf::from("stagehand.toml")];
                if let Some(home) = dirs::home_dir() {
                    default_paths.push(home.join(".config/stagehand/config.toml"));
                }

                let mut loaded = None;
                for p in &default_paths {
                    if let Ok(content) = std::fs::read_to_string(p) {
                        loaded = Some(toml::from_str(&content).with_context(|| {
                            format!("Failed to parse config {}", p.display())
                        })?);
                        break;
                    }
                }
                loaded.unwrap_or_default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Override file values with `STAGEHAND_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        if let Some(paths) = std::env::var_os("STAGEHAND_PLUGIN_PATHS") {
            self.plugins.repos = std::env::split_paths(&paths)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
        }
        if let Ok(host) = std::env::var("STAGEHAND_HOST") {
            self.network.host = host;
        }
        if let Ok(port) = std::env::var("STAGEHAND_PORT") {
            if let Ok(p) = port.parse::<u16>() {
                self.network.port = p;
            }
        }
        if let Ok(filter) = std::env::var("STAGEHAND_LOG") {
            self.logging.filter = filter;
        }
    }

    /// Reject values that would make the service unusable.
    pub fn validate(&self) -> crate::errors::Result<()> {
        if self.network.host.trim().is_empty() {
            return Err(StagehandError::Config("network.host is empty".into()));
        }
        if self.network.rpc_timeout_secs == 0 {
            return Err(StagehandError::Config(
                "network.rpc_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.network.registration_timeout_secs == 0 {
            return Err(StagehandError::Config(
                "network.registration_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.scheduling.liveness_timeout_secs == 0 {
            return Err(StagehandError::Config(
                "scheduling.liveness_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.scheduling.max_concurrency == 0 {
            return Err(StagehandError::Config(
                "scheduling.max_concurrency must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// `host:port` of the scheduling service.
    pub fn core_address(&self) -> String {
        format!("{}:{}", self.network.host, self.network.port)
    }
}
