use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// The six execution contracts a plugin can implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PluginArchetype {
    Static,
    MessagePreprocessor,
    Synchronous,
    Asynchronous,
    Service,
    HybridService,
}

impl PluginArchetype {
    pub const ALL: [PluginArchetype; 6] = [
        PluginArchetype::Static,
        PluginArchetype::MessagePreprocessor,
        PluginArchetype::Synchronous,
        PluginArchetype::Asynchronous,
        PluginArchetype::Service,
        PluginArchetype::HybridService,
    ];

    pub fn runs_service(&self) -> bool {
        matches!(self, PluginArchetype::Service | PluginArchetype::HybridService)
    }

    pub fn runs_sync(&self) -> bool {
        matches!(
            self,
            PluginArchetype::Synchronous | PluginArchetype::HybridService
        )
    }

    pub fn runs_async(&self) -> bool {
        matches!(
            self,
            PluginArchetype::Asynchronous | PluginArchetype::HybridService
        )
    }
}

impl std::fmt::Display for PluginArchetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginArchetype::Static => write!(f, "Static"),
            PluginArchetype::MessagePreprocessor => write!(f, "MessagePreprocessor"),
            PluginArchetype::Synchronous => write!(f, "Synchronous"),
            PluginArchetype::Asynchronous => write!(f, "Asynchronous"),
            PluginArchetype::Service => write!(f, "Service"),
            PluginArchetype::HybridService => write!(f, "HybridService"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[derive(Default)]
pub enum PluginStatus {
    Disabled,
    #[default]
    Loading,
    Active,
    Error,
    Unloading,
}

impl PluginStatus {
    /// Whether `activate` may be attempted from this status.
    pub fn can_activate(&self) -> bool {
        matches!(
            self,
            PluginStatus::Loading | PluginStatus::Disabled | PluginStatus::Error
        )
    }
}

impl std::fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginStatus::Disabled => write!(f, "Disabled"),
            PluginStatus::Loading => write!(f, "Loading"),
            PluginStatus::Active => write!(f, "Active"),
            PluginStatus::Error => write!(f, "Error"),
            PluginStatus::Unloading => write!(f, "Unloading"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    pub enabled: bool,
    pub settings: Value,
    #[serde(default)]
    pub priority: i32,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            settings: Value::Object(Map::new()),
            priority: 0,
        }
    }
}

impl PluginConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_setting<V: Serialize>(mut self, key: &str, value: V) -> Self {
        if let Value::Object(ref mut map) = self.settings {
            if let Ok(v) = serde_json::to_value(value) {
                map.insert(key.to_string(), v);
            }
        }
        self
    }

    pub fn get_setting<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        if let Value::Object(ref map) = self.settings {
            map.get(key)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
        } else {
            None
        }
    }

    /// Applies a patch in place. Settings are merged key by key; a `null`
    /// value removes the key.
    pub fn apply(&mut self, patch: &PluginConfigPatch) {
        if let Some(enabled) = patch.enabled {
            self.enabled = enabled;
        }
        if let Some(priority) = patch.priority {
            self.priority = priority;
        }
        if let Some(settings) = &patch.settings {
            if !self.settings.is_object() {
                self.settings = Value::Object(Map::new());
            }
            if let Value::Object(ref mut map) = self.settings {
                for (key, value) in settings {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfigPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<Map<String, Value>>,
}

impl PluginConfigPatch {
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            ..Default::default()
        }
    }

    pub fn priority(priority: i32) -> Self {
        Self {
            priority: Some(priority),
            ..Default::default()
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: Value) -> Self {
        self.settings
            .get_or_insert_with(Map::new)
            .insert(key.into(), value);
        self
    }
}

/// Emits tracing events tagged with the owning plugin's id.
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: Arc<str>,
}

impl PluginLogger {
    pub fn new(plugin_id: &str) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id),
        }
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(plugin_id = %self.plugin_id, "{}", message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!(plugin_id = %self.plugin_id, "{}", message);
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(plugin_id = %self.plugin_id, "{}", message);
    }

    pub fn error(&self, message: &str) {
        tracing::error!(plugin_id = %self.plugin_id, "{}", message);
    }

    /// Logs at a level named by a string, falling back to info.
    pub fn log(&self, level: &str, message: &str) {
        match level.to_ascii_lowercase().as_str() {
            "trace" | "debug" => self.debug(message),
            "warn" | "warning" => self.warn(message),
            "error" => self.error(message),
            _ => self.info(message),
        }
    }
}

/// Per-plugin handle created at registration and shared with the plugin for
/// its whole lifetime. Only the registry writes the config.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub plugin_id: String,
    pub logger: PluginLogger,
    config: Arc<RwLock<PluginConfig>>,
}

impl PluginContext {
    pub fn new(plugin_id: impl Into<String>, config: PluginConfig) -> Self {
        let plugin_id = plugin_id.into();
        Self {
            logger: PluginLogger::new(&plugin_id),
            plugin_id,
            config: Arc::new(RwLock::new(config)),
        }
    }

    pub async fn config(&self) -> PluginConfig {
        self.config.read().await.clone()
    }

    pub async fn setting<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Option<T> {
        self.config.read().await.get_setting(key)
    }

    pub(crate) async fn replace_config(&self, config: PluginConfig) {
        *self.config.write().await = config;
    }
}

/// What a plugin sees when invoked inside an execution chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub request_id: String,
    pub plugin_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub input: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionContext {
    pub fn new(request_id: impl Into<String>, plugin_id: impl Into<String>, input: Value) -> Self {
        Self {
            request_id: request_id.into(),
            plugin_id: plugin_id.into(),
            user_id: None,
            session_id: None,
            input,
            metadata: Map::new(),
        }
    }
}

/// Returned by a message preprocessor. `input` replaces the chain input when
/// present; `metadata` is merged into the chain metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreprocessOutput {
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PreprocessOutput {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn replace(input: Value) -> Self {
        Self {
            input: Some(input),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthStatus {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
        }
    }
}

/// Health report for one service, as exposed by `health_check`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealth {
    pub plugin_id: String,
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub execution_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionResult {
    pub fn ok(output: Option<Value>, execution_time_ms: u64) -> Self {
        Self {
            success: true,
            execution_time_ms,
            output,
            error: None,
            metadata: Map::new(),
        }
    }

    pub fn failed(error: impl Into<String>, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            execution_time_ms,
            output: None,
            error: Some(error.into()),
            metadata: Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Task ids started by the async phase, if any.
    pub fn task_ids(&self) -> Vec<uuid::Uuid> {
        self.metadata
            .get("taskIds")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(Value::as_str)
                    .filter_map(|s| uuid::Uuid::parse_str(s).ok())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Read-only view of a registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub archetype: PluginArchetype,
    pub status: PluginStatus,
    pub priority: i32,
    pub registered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub total: usize,
    pub by_archetype: BTreeMap<PluginArchetype, usize>,
    pub by_status: BTreeMap<PluginStatus, usize>,
    pub pending_async_tasks: usize,
}
