use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment switch that keeps backends off the wildcard interface.
pub const DISABLE_BINDALL_ENV: &str = "BOARDGATE_DISABLE_BINDALL";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Front-end listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How backend instances are launched and stopped
    #[serde(default)]
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Listen port for the control API and proxy path (default: 6006)
    #[serde(default = "default_listen_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
        }
    }
}

/// Launch settings shared by every backend instance
///
/// # Security Warning
///
/// `command`, `extra_args` and `env` are passed to the spawned process as-is.
/// Protect the configuration file accordingly.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// Backend executable (default: tensorboard)
    #[serde(default = "default_command")]
    pub command: String,

    /// Installed backend version; detected via `<command> --version` when unset
    pub version: Option<String>,

    /// Base directory for relative log directories (default: working directory)
    pub base_dir: Option<PathBuf>,

    /// Bind backends to all interfaces (default: true)
    #[serde(default = "default_true")]
    pub bind_all: bool,

    /// Pass `--purge_orphaned_data true` to backends (default: true)
    #[serde(default = "default_true")]
    pub purge_orphaned_data: bool,

    /// Reload interval used when a create request omits one (default: 30)
    #[serde(default = "default_reload_interval")]
    pub default_reload_interval_secs: u64,

    /// Readiness probes before giving up waiting (default: 60)
    #[serde(default = "default_startup_attempts")]
    pub startup_attempts: u32,

    /// Delay before each readiness probe in milliseconds (default: 1000)
    #[serde(default = "default_startup_interval")]
    pub startup_interval_ms: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL (default: 5)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Arguments appended after the generated ones
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Environment variables to set on the backend process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            version: None,
            base_dir: None,
            bind_all: true,
            purge_orphaned_data: true,
            default_reload_interval_secs: default_reload_interval(),
            startup_attempts: default_startup_attempts(),
            startup_interval_ms: default_startup_interval(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            extra_args: Vec::new(),
            env: HashMap::new(),
        }
    }
}

impl BackendConfig {
    /// Create a config for the given executable with defaults
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            ..Self::default()
        }
    }

    pub fn startup_interval(&self) -> Duration {
        Duration::from_millis(self.startup_interval_ms)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Whether backends should listen on every interface.
    ///
    /// Any non-empty value of `BOARDGATE_DISABLE_BINDALL` wins over the file.
    pub fn effective_bind_all(&self) -> bool {
        resolve_bind_all(self.bind_all, std::env::var_os(DISABLE_BINDALL_ENV).as_deref())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err("backend: 'command' must not be empty".to_string());
        }
        if self.startup_attempts == 0 {
            return Err("backend: 'startup_attempts' must be greater than 0".to_string());
        }
        if self.default_reload_interval_secs == 0 {
            return Err(
                "backend: 'default_reload_interval_secs' must be greater than 0".to_string(),
            );
        }
        if let Some(ref base_dir) = self.base_dir {
            if !base_dir.is_absolute() {
                return Err(format!(
                    "backend: 'base_dir' must be absolute, got {}",
                    base_dir.display()
                ));
            }
        }
        Ok(())
    }
}

fn resolve_bind_all(configured: bool, disable_switch: Option<&OsStr>) -> bool {
    let disabled = disable_switch.map(|v| !v.is_empty()).unwrap_or(false);
    configured && !disabled
}

// Default value functions
fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    6006
}

fn default_command() -> String {
    "tensorboard".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reload_interval() -> u64 {
    30
}

fn default_startup_attempts() -> u32 {
    60
}

fn default_startup_interval() -> u64 {
    1000 // one probe per second
}

fn default_shutdown_grace_period() -> u64 {
    5
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server: 'port' must be greater than 0".to_string());
        }
        if let Err(e) = self.backend.validate() {
            errors.push(e);
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
