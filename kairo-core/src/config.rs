use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{KairoError, KairoResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct KairoConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json_format: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Async task records older than this are swept whether or not they finished.
    #[serde(default = "default_task_retention")]
    pub task_retention_secs: u64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_ms: u64,

    #[serde(default = "default_service_stop_timeout")]
    pub service_stop_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_ms: u64,

    #[serde(default = "default_allowed_modules")]
    pub allowed_modules: Vec<String>,

    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    #[serde(default)]
    pub limits: ResourceLimits,
}

/// OS resource limits applied to every guest process on Linux. `None`
/// leaves the limit inherited from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Virtual address space (`RLIMIT_AS`).
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: Option<u64>,

    /// CPU time in seconds (`RLIMIT_CPU`).
    #[serde(default = "default_max_cpu_secs")]
    pub max_cpu_secs: Option<u64>,

    /// Open file descriptors (`RLIMIT_NOFILE`).
    #[serde(default = "default_max_open_files")]
    pub max_open_files: Option<u64>,

    /// Processes for the guest's user (`RLIMIT_NPROC`). The kernel counts
    /// this per UID, so it is off unless configured.
    #[serde(default)]
    pub max_processes: Option<u64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_task_retention() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_health_check_timeout() -> u64 {
    5_000
}

fn default_service_stop_timeout() -> u64 {
    5_000
}

fn default_sandbox_timeout() -> u64 {
    5_000
}

fn default_allowed_modules() -> Vec<String> {
    vec!["logger".to_string(), "json".to_string(), "time".to_string()]
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

fn default_max_memory_bytes() -> Option<u64> {
    Some(4 * 1024 * 1024 * 1024)
}

fn default_max_cpu_secs() -> Option<u64> {
    Some(30)
}

fn default_max_open_files() -> Option<u64> {
    Some(256)
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json_format: false,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            task_retention_secs: default_task_retention(),
            sweep_interval_secs: default_sweep_interval(),
            health_check_timeout_ms: default_health_check_timeout(),
            service_stop_timeout_ms: default_service_stop_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn task_retention(&self) -> Duration {
        Duration::from_secs(self.task_retention_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    pub fn service_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.service_stop_timeout_ms)
    }
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_sandbox_timeout(),
            allowed_modules: default_allowed_modules(),
            max_line_bytes: default_max_line_bytes(),
            limits: ResourceLimits::default(),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory_bytes(),
            max_cpu_secs: default_max_cpu_secs(),
            max_open_files: default_max_open_files(),
            max_processes: None,
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            max_memory_bytes: None,
            max_cpu_secs: None,
            max_open_files: None,
            max_processes: None,
        }
    }
}

impl SandboxSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl KairoConfig {
    pub fn load() -> KairoResult<Self> {
        Self::load_from_paths(get_config_paths())
    }

    pub fn load_from_paths(paths: Vec<PathBuf>) -> KairoResult<Self> {
        load_dotenv_files();

        let mut builder = ConfigBuilder::builder();

        for path in paths {
            if path.exists() {
                builder = builder.add_source(File::from(path).required(false));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("KAIRO")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("sandbox.allowed_modules")
                .try_parsing(true),
        );

        let kairo_config: KairoConfig = builder.build()?.try_deserialize()?;

        let mut kairo_config = kairo_config;
        if let Ok(level) = std::env::var("KAIRO_LOG_LEVEL") {
            kairo_config.logging.level = level;
        }

        kairo_config.validate()?;

        Ok(kairo_config)
    }

    pub fn validate(&self) -> KairoResult<()> {
        if self.runtime.task_retention_secs == 0 {
            return Err(invalid("runtime.task_retention_secs", "Must be greater than 0"));
        }

        if self.runtime.sweep_interval_secs == 0 {
            return Err(invalid("runtime.sweep_interval_secs", "Must be greater than 0"));
        }

        if self.runtime.health_check_timeout_ms == 0 {
            return Err(invalid(
                "runtime.health_check_timeout_ms",
                "Must be greater than 0",
            ));
        }

        if self.runtime.service_stop_timeout_ms == 0 {
            return Err(invalid(
                "runtime.service_stop_timeout_ms",
                "Must be greater than 0",
            ));
        }

        if self.sandbox.timeout_ms == 0 {
            return Err(invalid("sandbox.timeout_ms", "Must be greater than 0"));
        }

        if self.sandbox.max_line_bytes == 0 {
            return Err(invalid("sandbox.max_line_bytes", "Must be greater than 0"));
        }

        let limits = [
            ("sandbox.limits.max_memory_bytes", self.sandbox.limits.max_memory_bytes),
            ("sandbox.limits.max_cpu_secs", self.sandbox.limits.max_cpu_secs),
            ("sandbox.limits.max_open_files", self.sandbox.limits.max_open_files),
            ("sandbox.limits.max_processes", self.sandbox.limits.max_processes),
        ];
        if let Some((key, _)) = limits.iter().find(|(_, limit)| *limit == Some(0)) {
            return Err(invalid(key, "Must be greater than 0 when set"));
        }

        if let Some(bad) = self
            .sandbox
            .allowed_modules
            .iter()
            .find(|m| m.trim().is_empty())
        {
            return Err(invalid(
                "sandbox.allowed_modules",
                format!("Empty module name in allow-list: {:?}", bad),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        let level_lower = self.logging.level.to_lowercase();
        if !valid_levels.contains(&level_lower.as_str()) && !level_lower.contains('=') {
            return Err(invalid(
                "logging.level",
                format!(
                    "Invalid log level '{}'. Must be one of: {:?}",
                    self.logging.level, valid_levels
                ),
            ));
        }

        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> KairoError {
    KairoError::InvalidConfigValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn get_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join("config").join("default.toml"));
        paths.push(cwd.join("config").join("local.toml"));
        paths.push(cwd.join("kairo.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("kairo").join("config.toml"));
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".kairo").join("config.toml"));
    }

    paths
}

fn load_dotenv_files() {
    let mut env_paths = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        env_paths.push(cwd.join(".env"));
        env_paths.push(cwd.join(".env.local"));
    }

    if let Some(home) = dirs::home_dir() {
        env_paths.push(home.join(".kairo").join(".env"));
    }

    for path in env_paths {
        if path.exists() {
            let _ = dotenvy::from_path(&path);
        }
    }
}

pub fn get_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("kairo"))
}
