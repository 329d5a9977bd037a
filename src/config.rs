//! Configuration management for fwctl

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::error::{FirewallError, FirewallResult};
use crate::firewall::PolicyParams;
use crate::logger::{FileSink, Logger};

/// Environment variable overriding `paths.log_dir`
pub const LOG_DIR_ENV: &str = "FWCTL_LOG_DIR";

/// Main fwctl configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallConfig {
    /// Directories
    #[serde(default)]
    pub paths: ConfigPaths,
    /// Diagnostic log file
    #[serde(default)]
    pub logging: LogSettings,
    /// Filtering engine access
    #[serde(default)]
    pub engine: EngineSettings,
    /// Defaults merged into every transition request
    #[serde(default)]
    pub policy: PolicyDefaults,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigPaths {
    /// Log directory
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    /// File name of the diagnostic log inside `log_dir`
    #[serde(default = "default_log_file")]
    pub file_name: String,
    /// Append to an existing log instead of truncating it
    #[serde(default = "default_true")]
    pub append: bool,
    /// Flush after every line
    #[serde(default = "default_true")]
    pub flush: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Upper bound for a single engine call (milliseconds)
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDefaults {
    /// Permit traffic to and from private networks
    #[serde(default = "default_true")]
    pub allow_lan: bool,
    /// Resolvers reachable outside the tunnel while connecting
    #[serde(default)]
    pub dns_servers: Vec<IpAddr>,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/fwctl")
}

fn default_log_file() -> String {
    "firewall.log".to_string()
}

fn default_true() -> bool {
    true
}

fn default_call_timeout_ms() -> u64 {
    5000
}

impl Default for ConfigPaths {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            file_name: default_log_file(),
            append: true,
            flush: true,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl Default for PolicyDefaults {
    fn default() -> Self {
        Self {
            allow_lan: true,
            dns_servers: Vec::new(),
        }
    }
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            paths: ConfigPaths::default(),
            logging: LogSettings::default(),
            engine: EngineSettings::default(),
            policy: PolicyDefaults::default(),
        }
    }
}

impl FirewallConfig {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> FirewallResult<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| FirewallError::Config(format!("Failed to read config: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| FirewallError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> FirewallResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| FirewallError::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path.as_ref(), content)
            .map_err(|e| FirewallError::Config(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Reject values no controller can work with
    pub fn validate(&self) -> FirewallResult<()> {
        if self.engine.call_timeout_ms == 0 {
            return Err(FirewallError::Config(
                "engine.call_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.logging.file_name.is_empty() || self.logging.file_name.contains('/') {
            return Err(FirewallError::Config(format!(
                "logging.file_name must be a plain file name, got {:?}",
                self.logging.file_name
            )));
        }
        crate::validation::validate_dns_servers(&self.policy.dns_servers)
            .map_err(|e| FirewallError::Config(format!("policy.dns_servers: {}", e)))
    }

    /// Apply overrides from the environment
    pub fn with_env_overrides(mut self) -> Self {
        if let Some(dir) = std::env::var_os(LOG_DIR_ENV).filter(|d| !d.is_empty()) {
            self.paths.log_dir = PathBuf::from(dir);
        }
        self
    }

    /// Ensure the log directory exists
    pub fn ensure_directories(&self) -> FirewallResult<()> {
        let dir = &self.paths.log_dir;
        std::fs::create_dir_all(dir).map_err(|e| {
            FirewallError::Config(format!("Failed to create directory {:?}: {}", dir, e))
        })
    }

    pub fn log_path(&self) -> PathBuf {
        self.paths.log_dir.join(&self.logging.file_name)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.engine.call_timeout_ms)
    }

    /// Open the diagnostic log described by `logging`, creating `log_dir`
    pub fn open_logger(&self) -> FirewallResult<Logger> {
        self.ensure_directories()?;
        let sink = FileSink::open(&self.log_path(), self.logging.append, self.logging.flush)?;
        Ok(Logger::new(sink))
    }

    /// Transition parameters seeded from the policy defaults
    pub fn default_params(&self) -> PolicyParams {
        PolicyParams::new()
            .with_allow_lan(self.policy.allow_lan)
            .with_dns_servers(self.policy.dns_servers.clone())
    }
}
