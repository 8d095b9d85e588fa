//! Error types for the Kairo core library.
//!
//! Every fallible operation in the runtime returns [`KairoResult`]. Errors carry
//! a stable code so operators can grep logs and CLI output for them.
//!
//! # Error Codes Reference
//!
//! | Code Range | Category | Description |
//! |------------|----------|-------------|
//! | E1001-E1099 | Plugin | Manifest validation, dependencies, lifecycle transitions |
//! | E2001-E2099 | Task | Asynchronous task lookup, cancellation and failure |
//! | E3001-E3099 | Sandbox | Capability grants, deadlines and guest protocol errors |
//! | E4001-E4099 | Config | Configuration loading and validation errors |
//! | E9001-E9099 | General | Internal, IO and serialization errors |

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, warn};
use uuid::Uuid;

/// The main error type for the Kairo core library.
#[derive(Debug, Error)]
pub enum KairoError {
    // ========================================================================
    // Plugin Errors (E1001-E1099)
    // ========================================================================
    /// Manifest is malformed, missing required fields or has a bad id
    #[error("[E1001] Invalid manifest for '{plugin}': {reason}")]
    ManifestInvalid { plugin: String, reason: String },

    /// One or more declared dependencies are not active
    #[error("[E1002] Plugin '{plugin}' is missing dependencies: {}", .missing.join(", "))]
    DependencyMissing { plugin: String, missing: Vec<String> },

    /// Dependencies form a cycle inside a load batch
    #[error("[E1003] Dependency cycle detected involving: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    /// Plugin not present in the registry
    #[error("[E1004] Plugin not found: {0}")]
    PluginNotFound(String),

    /// Activation hook (or service start) failed
    #[error("[E1005] Activation failed for '{plugin}': {message}")]
    ActivationFailed { plugin: String, message: String },

    /// Requested lifecycle transition is not allowed from the current state
    #[error("[E1006] Plugin '{plugin}' cannot move from {from} to {to}")]
    InvalidTransition {
        plugin: String,
        from: String,
        to: String,
    },

    /// Factory could not construct the plugin instance
    #[error("[E1007] Failed to load plugin '{plugin}': {message}")]
    PluginLoadFailed { plugin: String, message: String },

    /// A plugin capability returned an error while executing
    #[error("[E1008] Plugin '{plugin}' failed: {message}")]
    PluginExecutionFailed { plugin: String, message: String },

    // ========================================================================
    // Task Errors (E2001-E2099)
    // ========================================================================
    /// Unknown or already consumed task id
    #[error("[E2001] Task not found: {0}")]
    TaskNotFound(Uuid),

    /// Task was cancelled before it produced a result
    #[error("[E2002] Task {0} was cancelled")]
    TaskCancelled(Uuid),

    /// Task body panicked
    #[error("[E2003] Task {task_id} panicked: {message}")]
    TaskPanicked { task_id: Uuid, message: String },

    // ========================================================================
    // Sandbox Errors (E3001-E3099)
    // ========================================================================
    /// Guest asked for a capability outside the allow-list
    #[error("[E3001] Sandbox {sandbox_id} denied capability '{capability}'")]
    CapabilityDenied {
        sandbox_id: Uuid,
        capability: String,
    },

    /// Guest exceeded its wall-clock budget and was terminated
    #[error("[E3002] Sandbox {sandbox_id} timed out after {timeout_ms} ms")]
    SandboxTimeout { sandbox_id: Uuid, timeout_ms: u64 },

    /// Guest broke the host/guest message protocol
    #[error("[E3003] Sandbox protocol error: {0}")]
    SandboxProtocol(String),

    /// Guest process could not be started
    #[error("[E3004] Failed to start sandboxed process '{program}': {message}")]
    SandboxSpawn { program: String, message: String },

    // ========================================================================
    // Configuration Errors (E4001-E4099)
    // ========================================================================
    /// Configuration sources could not be parsed
    #[error("[E4001] Failed to parse configuration: {0}")]
    ConfigParseError(String),

    /// Invalid configuration value
    #[error("[E4002] Invalid configuration value for '{key}': {message}")]
    InvalidConfigValue { key: String, message: String },

    // ========================================================================
    // General Errors (E9001-E9099)
    // ========================================================================
    /// Internal error (catch-all for unexpected conditions)
    #[error("[E9001] Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("[E9002] IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("[E9003] Serialization error: {0}")]
    SerializationError(String),
}

/// Result type alias for Kairo operations.
pub type KairoResult<T> = Result<T, KairoError>;

impl From<serde_json::Error> for KairoError {
    fn from(err: serde_json::Error) -> Self {
        KairoError::SerializationError(err.to_string())
    }
}

impl From<config::ConfigError> for KairoError {
    fn from(err: config::ConfigError) -> Self {
        KairoError::ConfigParseError(err.to_string())
    }
}

impl KairoError {
    pub fn manifest(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        KairoError::ManifestInvalid {
            plugin: plugin.into(),
            reason: reason.into(),
        }
    }

    pub fn activation(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        KairoError::ActivationFailed {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn execution(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        KairoError::PluginExecutionFailed {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    pub fn is_plugin_error(&self) -> bool {
        matches!(
            self,
            KairoError::ManifestInvalid { .. }
                | KairoError::DependencyMissing { .. }
                | KairoError::DependencyCycle(_)
                | KairoError::PluginNotFound(_)
                | KairoError::ActivationFailed { .. }
                | KairoError::InvalidTransition { .. }
                | KairoError::PluginLoadFailed { .. }
                | KairoError::PluginExecutionFailed { .. }
        )
    }

    pub fn is_task_error(&self) -> bool {
        matches!(
            self,
            KairoError::TaskNotFound(_)
                | KairoError::TaskCancelled(_)
                | KairoError::TaskPanicked { .. }
        )
    }

    pub fn is_sandbox_error(&self) -> bool {
        matches!(
            self,
            KairoError::CapabilityDenied { .. }
                | KairoError::SandboxTimeout { .. }
                | KairoError::SandboxProtocol(_)
                | KairoError::SandboxSpawn { .. }
        )
    }

    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            KairoError::ConfigParseError(_) | KairoError::InvalidConfigValue { .. }
        )
    }

    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            KairoError::ManifestInvalid { .. } => "E1001",
            KairoError::DependencyMissing { .. } => "E1002",
            KairoError::DependencyCycle(_) => "E1003",
            KairoError::PluginNotFound(_) => "E1004",
            KairoError::ActivationFailed { .. } => "E1005",
            KairoError::InvalidTransition { .. } => "E1006",
            KairoError::PluginLoadFailed { .. } => "E1007",
            KairoError::PluginExecutionFailed { .. } => "E1008",
            KairoError::TaskNotFound(_) => "E2001",
            KairoError::TaskCancelled(_) => "E2002",
            KairoError::TaskPanicked { .. } => "E2003",
            KairoError::CapabilityDenied { .. } => "E3001",
            KairoError::SandboxTimeout { .. } => "E3002",
            KairoError::SandboxProtocol(_) => "E3003",
            KairoError::SandboxSpawn { .. } => "E3004",
            KairoError::ConfigParseError(_) => "E4001",
            KairoError::InvalidConfigValue { .. } => "E4002",
            KairoError::Internal(_) => "E9001",
            KairoError::Io(_) => "E9002",
            KairoError::SerializationError(_) => "E9003",
        }
    }

    /// Short operator-facing hint, when there is a useful one.
    pub fn user_suggestion(&self) -> Option<&'static str> {
        match self {
            KairoError::ManifestInvalid { .. } => Some(
                "Plugin ids must be lowercase alphanumerics and hyphens, and name/version are required",
            ),
            KairoError::DependencyMissing { .. } => {
                Some("Load and activate the listed dependencies first")
            }
            KairoError::DependencyCycle(_) => {
                Some("Break the cycle by removing one of the dependency declarations")
            }
            KairoError::TaskNotFound(_) => {
                Some("Task results can be retrieved once; expired tasks are swept after the retention window")
            }
            KairoError::CapabilityDenied { .. } => {
                Some("Add the capability to sandbox.allowed_modules if it should be granted")
            }
            KairoError::SandboxTimeout { .. } => {
                Some("Raise sandbox.timeout_ms or make the plugin's activation cheaper")
            }
            KairoError::InvalidConfigValue { .. } | KairoError::ConfigParseError(_) => {
                Some("Check kairo.toml and KAIRO_* environment variables")
            }
            _ => None,
        }
    }

    /// Log this error with appropriate severity level.
    pub fn log(&self) {
        let code = self.error_code();
        let suggestion = self.user_suggestion();

        if self.is_task_error() {
            warn!(error_code = %code, suggestion = suggestion, "{}", self);
        } else {
            error!(error_code = %code, suggestion = suggestion, "{}", self);
        }
    }
}

/// Which teardown step a non-fatal cleanup failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupStage {
    StopService,
    Deactivate,
}

impl fmt::Display for CleanupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CleanupStage::StopService => write!(f, "stop_service"),
            CleanupStage::Deactivate => write!(f, "deactivate"),
        }
    }
}

/// A teardown failure that was logged and swallowed so cleanup could finish.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupError {
    pub plugin_id: String,
    pub stage: CleanupStage,
    pub message: String,
}

impl CleanupError {
    pub fn new(plugin_id: impl Into<String>, stage: CleanupStage, message: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            stage,
            message: message.into(),
        }
    }
}

impl fmt::Display for CleanupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} failed: {}", self.plugin_id, self.stage, self.message)
    }
}

// ============================================================================
// User-friendly error formatting for CLI
// ============================================================================

/// Format an error for CLI display with its suggestion.
pub struct CliErrorDisplay<'a> {
    error: &'a KairoError,
    show_suggestion: bool,
}

impl<'a> CliErrorDisplay<'a> {
    pub fn new(error: &'a KairoError) -> Self {
        Self {
            error,
            show_suggestion: true,
        }
    }

    pub fn without_suggestion(mut self) -> Self {
        self.show_suggestion = false;
        self
    }
}

impl<'a> fmt::Display for CliErrorDisplay<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.error)?;

        if self.show_suggestion {
            if let Some(suggestion) = self.error.user_suggestion() {
                writeln!(f)?;
                writeln!(f, "  Suggestion: {}", suggestion)?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = KairoError::DependencyMissing {
            plugin: "cache".to_string(),
            missing: vec!["store".to_string(), "metrics".to_string()],
        };
        let text = err.to_string();
        assert!(text.contains("E1002"));
        assert!(text.contains("store, metrics"));

        let err = KairoError::manifest("Bad Id", "id must match pattern");
        assert!(err.to_string().contains("E1001"));
        assert!(err.to_string().contains("Bad Id"));
    }

    #[test]
    fn test_error_categorization() {
        assert!(KairoError::PluginNotFound("x".to_string()).is_plugin_error());
        assert!(KairoError::TaskNotFound(Uuid::new_v4()).is_task_error());
        assert!(KairoError::SandboxProtocol("eof".to_string()).is_sandbox_error());
        assert!(KairoError::ConfigParseError("bad".to_string()).is_config_error());
        assert!(!KairoError::Internal("x".to_string()).is_plugin_error());
    }

    #[test]
    fn test_error_codes() {
        let id = Uuid::new_v4();
        assert_eq!(
            KairoError::SandboxTimeout {
                sandbox_id: id,
                timeout_ms: 10
            }
            .error_code(),
            "E3002"
        );
        assert_eq!(
            KairoError::CapabilityDenied {
                sandbox_id: id,
                capability: "fs".to_string()
            }
            .error_code(),
            "E3001"
        );
        assert_eq!(KairoError::TaskNotFound(id).error_code(), "E2001");
        assert_eq!(
            KairoError::Internal("x".to_string()).error_code(),
            "E9001"
        );
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: KairoError = json_err.into();
        assert!(matches!(err, KairoError::SerializationError(_)));
    }

    #[test]
    fn test_cleanup_error_display() {
        let err = CleanupError::new("cache", CleanupStage::Deactivate, "boom");
        assert_eq!(err.to_string(), "cache deactivate failed: boom");
    }

    #[test]
    fn test_cli_error_display() {
        let err = KairoError::CapabilityDenied {
            sandbox_id: Uuid::new_v4(),
            capability: "fs".to_string(),
        };
        let shown = CliErrorDisplay::new(&err).to_string();
        assert!(shown.contains("Suggestion"));

        let bare = CliErrorDisplay::new(&err).without_suggestion().to_string();
        assert!(!bare.contains("Suggestion"));
    }
}
