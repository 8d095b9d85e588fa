use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use crate::error::{KairoError, KairoResult};

use super::types::PluginArchetype;

static PLUGIN_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*[a-z0-9]$").expect("invalid regex"));

/// Activation event that means "activate as soon as registered".
pub const WILDCARD_EVENT: &str = "*";

/// Contribution point holding tool descriptors.
pub const TOOLS_POINT: &str = "tools";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub contributions: BTreeMap<String, Vec<ContributionDescriptor>>,
    #[serde(default)]
    pub activation_events: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype: Option<PluginArchetype>,
}

/// One entry under a contribution point. Fields other than `id`, `handle`
/// and `name` are kept verbatim in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContributionDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub handle: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContributionDescriptor {
    pub fn new(id: impl Into<String>, handle: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            handle: handle.into(),
            name: None,
            extra: Map::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

impl PluginManifest {
    pub const JSON_FILENAME: &'static str = "kairo-plugin.json";
    pub const TOML_FILENAME: &'static str = "kairo-plugin.toml";

    pub fn new(id: impl Into<String>, name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            description: String::new(),
            author: String::new(),
            contributions: BTreeMap::new(),
            activation_events: Vec::new(),
            dependencies: Vec::new(),
            priority: 0,
            archetype: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_archetype(mut self, archetype: PluginArchetype) -> Self {
        self.archetype = Some(archetype);
        self
    }

    pub fn with_dependency(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(id.into());
        self
    }

    pub fn with_activation_event(mut self, event: impl Into<String>) -> Self {
        self.activation_events.push(event.into());
        self
    }

    pub fn with_contribution(
        mut self,
        point: impl Into<String>,
        descriptor: ContributionDescriptor,
    ) -> Self {
        self.contributions
            .entry(point.into())
            .or_default()
            .push(descriptor);
        self
    }

    pub async fn load_from_file(path: &Path) -> KairoResult<Self> {
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            KairoError::manifest(
                path.display().to_string(),
                format!("Failed to read manifest file: {}", e),
            )
        })?;

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::parse_toml(&content),
            _ => Self::parse_json(&content),
        }
    }

    pub fn parse_json(content: &str) -> KairoResult<Self> {
        serde_json::from_str(content).map_err(|e| {
            KairoError::manifest("<unparsed>", format!("Failed to parse manifest: {}", e))
        })
    }

    pub fn parse_toml(content: &str) -> KairoResult<Self> {
        toml::from_str(content).map_err(|e| {
            KairoError::manifest("<unparsed>", format!("Failed to parse manifest: {}", e))
        })
    }

    pub fn to_json(&self) -> KairoResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> KairoResult<()> {
        let label = if self.id.is_empty() {
            "<missing id>"
        } else {
            self.id.as_str()
        };

        if self.id.is_empty() {
            return Err(KairoError::manifest(label, "Plugin id cannot be empty"));
        }

        if !is_valid_plugin_id(&self.id) {
            return Err(KairoError::manifest(
                label,
                format!(
                    "Invalid plugin id: {}. Ids must be lowercase alphanumerics and hyphens, \
                     starting and ending with an alphanumeric",
                    self.id
                ),
            ));
        }

        if self.name.trim().is_empty() {
            return Err(KairoError::manifest(label, "Plugin name cannot be empty"));
        }

        if self.version.trim().is_empty() {
            return Err(KairoError::manifest(label, "Plugin version cannot be empty"));
        }

        for dependency in &self.dependencies {
            if dependency == &self.id {
                return Err(KairoError::manifest(label, "Plugin cannot depend on itself"));
            }
            if !is_valid_plugin_id(dependency) {
                return Err(KairoError::manifest(
                    label,
                    format!("Invalid dependency id: {}", dependency),
                ));
            }
        }

        for (point, descriptors) in &self.contributions {
            for (index, descriptor) in descriptors.iter().enumerate() {
                if descriptor.id.trim().is_empty() {
                    return Err(KairoError::manifest(
                        label,
                        format!("Contribution {}[{}] is missing an id", point, index),
                    ));
                }
                if descriptor.handle.trim().is_empty() {
                    return Err(KairoError::manifest(
                        label,
                        format!(
                            "Contribution {}[{}] ('{}') is missing a handle",
                            point, index, descriptor.id
                        ),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Stricter rules applied to manifests produced inside a sandbox: every
    /// tool must also carry a display name.
    pub fn validate_for_sandbox(&self) -> KairoResult<()> {
        self.validate()?;

        for descriptor in self.tools() {
            let missing_name = descriptor
                .name
                .as_deref()
                .map(|n| n.trim().is_empty())
                .unwrap_or(true);
            if missing_name {
                return Err(KairoError::manifest(
                    &self.id,
                    format!("Tool '{}' is missing a name", descriptor.id),
                ));
            }
        }

        Ok(())
    }

    pub fn contributions_for(&self, point: &str) -> &[ContributionDescriptor] {
        self.contributions
            .get(point)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn tools(&self) -> &[ContributionDescriptor] {
        self.contributions_for(TOOLS_POINT)
    }

    pub fn activates_eagerly(&self) -> bool {
        self.activation_events.is_empty()
            || self.activation_events.iter().any(|e| e == WILDCARD_EVENT)
    }

    pub fn activates_on(&self, event: &str) -> bool {
        self.activates_eagerly() || self.activation_events.iter().any(|e| e == event)
    }
}

pub fn is_valid_plugin_id(id: &str) -> bool {
    PLUGIN_ID_PATTERN.is_match(id)
}
