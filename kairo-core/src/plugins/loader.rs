use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{KairoError, KairoResult};

use super::manifest::PluginManifest;
use super::registry::PluginRegistry;
use super::traits::{PluginFactory, PluginInstance};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "events", rename_all = "camelCase")]
pub enum Activation {
    Immediate,
    Deferred(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadOutcome {
    pub plugin_id: String,
    pub activation: Activation,
}

#[derive(Debug, Default)]
pub struct BatchLoad {
    pub loaded: Vec<LoadOutcome>,
    pub failed: Vec<(String, KairoError)>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub activated: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Turns manifests into registered plugins and tracks the ones waiting on
/// an activation event.
pub struct PluginLoader {
    registry: Arc<PluginRegistry>,
    pending: RwLock<HashMap<String, Vec<String>>>,
}

impl PluginLoader {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Validates, checks dependencies, builds and registers one plugin. Nothing
    /// is registered if any step before registration fails.
    pub async fn load(
        &self,
        manifest: PluginManifest,
        factory: &dyn PluginFactory,
    ) -> KairoResult<LoadOutcome> {
        manifest.validate()?;
        let plugin_id = manifest.id.clone();

        let mut missing = Vec::new();
        for dependency in &manifest.dependencies {
            if !self.registry.is_active(dependency).await {
                missing.push(dependency.clone());
            }
        }
        if !missing.is_empty() {
            return Err(KairoError::DependencyMissing {
                plugin: plugin_id,
                missing,
            });
        }

        let instance = build_instance(&manifest, factory)?;

        if let Some(declared) = manifest.archetype {
            let actual = instance.archetype();
            if declared != actual {
                return Err(KairoError::PluginLoadFailed {
                    plugin: plugin_id,
                    message: format!(
                        "manifest declares archetype {} but factory produced {}",
                        declared, actual
                    ),
                });
            }
        }

        let eager = manifest.activates_eagerly();
        let events = manifest.activation_events.clone();

        self.registry.register(manifest, instance).await?;

        if eager {
            self.pending.write().await.remove(&plugin_id);
            self.registry.activate(&plugin_id).await?;
            Ok(LoadOutcome {
                plugin_id,
                activation: Activation::Immediate,
            })
        } else {
            debug!(plugin_id = %plugin_id, events = ?events, "Deferring activation");
            self.pending
                .write()
                .await
                .insert(plugin_id.clone(), events.clone());
            Ok(LoadOutcome {
                plugin_id,
                activation: Activation::Deferred(events),
            })
        }
    }

    /// Activates every deferred plugin listening for `event`.
    pub async fn dispatch_event(&self, event: &str) -> DispatchReport {
        let matching: Vec<String> = {
            let mut pending = self.pending.write().await;
            let ids: Vec<String> = pending
                .iter()
                .filter(|(_, events)| events.iter().any(|e| e == event))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                pending.remove(id);
            }
            ids
        };

        let mut report = DispatchReport::default();
        let mut ordered = Vec::with_capacity(matching.len());
        for id in matching {
            if let Some(info) = self.registry.get_plugin(&id).await {
                ordered.push((info.registered_at, id));
            }
        }
        ordered.sort();

        for (_, id) in ordered {
            match self.registry.activate(&id).await {
                Ok(()) => report.activated.push(id),
                Err(e) => {
                    warn!(plugin_id = %id, event = %event, "Deferred activation failed: {}", e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.activated.is_empty() {
            info!(event = %event, count = report.activated.len(), "Activated plugins on event");
        }
        report
    }

    /// Loads a batch after ordering it so dependencies come first. A cycle
    /// inside the batch fails the whole call before anything is loaded.
    pub async fn load_all(
        &self,
        batch: Vec<PluginManifest>,
        factory: &dyn PluginFactory,
    ) -> KairoResult<BatchLoad> {
        let order = load_order(&batch)?;
        let mut by_id: HashMap<String, PluginManifest> =
            batch.into_iter().map(|m| (m.id.clone(), m)).collect();

        let mut result = BatchLoad::default();
        for id in order {
            let Some(manifest) = by_id.remove(&id) else {
                continue;
            };
            match self.load(manifest, factory).await {
                Ok(outcome) => result.loaded.push(outcome),
                Err(e) => {
                    e.log();
                    result.failed.push((id, e));
                }
            }
        }
        Ok(result)
    }

    /// Drops deferred-activation bookkeeping for a plugin.
    pub async fn forget(&self, plugin_id: &str) -> bool {
        self.pending.write().await.remove(plugin_id).is_some()
    }

    pub async fn pending_events(&self, plugin_id: &str) -> Option<Vec<String>> {
        self.pending.read().await.get(plugin_id).cloned()
    }

    pub async fn pending_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn build_instance(
    manifest: &PluginManifest,
    factory: &dyn PluginFactory,
) -> KairoResult<PluginInstance> {
    match std::panic::catch_unwind(AssertUnwindSafe(|| factory.create(manifest))) {
        Ok(Ok(instance)) => Ok(instance),
        Ok(Err(e)) => Err(KairoError::PluginLoadFailed {
            plugin: manifest.id.clone(),
            message: e.to_string(),
        }),
        Err(_) => Err(KairoError::PluginLoadFailed {
            plugin: manifest.id.clone(),
            message: "factory panicked".to_string(),
        }),
    }
}

/// Orders manifests so each comes after the batch members it depends on.
/// Dependencies outside the batch are left for `load` to check. When an id
/// appears more than once the last manifest for it wins.
pub fn load_order(batch: &[PluginManifest]) -> KairoResult<Vec<String>> {
    let last: HashMap<&str, usize> = batch
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.as_str(), i))
        .collect();
    let batch: Vec<&PluginManifest> = batch
        .iter()
        .enumerate()
        .filter(|(i, m)| last.get(m.id.as_str()) == Some(i))
        .map(|(_, m)| m)
        .collect();

    let ids: HashSet<&str> = batch.iter().map(|m| m.id.as_str()).collect();
    let mut graph: HashMap<&str, Vec<&str>> = HashMap::new();
    let mut in_degree: HashMap<&str, usize> = HashMap::new();

    for manifest in &batch {
        in_degree.entry(manifest.id.as_str()).or_insert(0);
        for dependency in &manifest.dependencies {
            if ids.contains(dependency.as_str()) {
                graph
                    .entry(dependency.as_str())
                    .or_default()
                    .push(manifest.id.as_str());
                *in_degree.entry(manifest.id.as_str()).or_insert(0) += 1;
            }
        }
    }

    let mut queue: VecDeque<&str> = batch
        .iter()
        .map(|m| m.id.as_str())
        .filter(|id| in_degree.get(id) == Some(&0))
        .collect();
    let mut seen = HashSet::new();
    let mut result = Vec::new();

    while let Some(plugin_id) = queue.pop_front() {
        if !seen.insert(plugin_id) {
            continue;
        }
        result.push(plugin_id.to_string());

        if let Some(dependents) = graph.get(plugin_id) {
            for dependent in dependents {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }
    }

    if result.len() != ids.len() {
        let mut stuck: Vec<String> = ids
            .into_iter()
            .filter(|id| !seen.contains(id))
            .map(str::to_string)
            .collect();
        stuck.sort();
        return Err(KairoError::DependencyCycle(stuck));
    }

    Ok(result)
}

/// Finds manifest files in the immediate subdirectories of `dir`.
pub async fn discover_manifests(dir: &Path) -> KairoResult<Vec<PathBuf>> {
    let mut discovered = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }

        let json = path.join(PluginManifest::JSON_FILENAME);
        let toml = path.join(PluginManifest::TOML_FILENAME);
        if json.exists() {
            discovered.push(json);
        } else if toml.exists() {
            discovered.push(toml);
        } else {
            debug!("Skipping directory without manifest: {:?}", path);
        }
    }

    discovered.sort();
    info!("Discovered {} plugin manifests in {:?}", discovered.len(), dir);
    Ok(discovered)
}

/// Discovers and parses manifests; unreadable ones are logged and skipped.
pub async fn read_manifests(dir: &Path) -> KairoResult<Vec<PluginManifest>> {
    let mut manifests = Vec::new();
    for path in discover_manifests(dir).await? {
        match PluginManifest::load_from_file(&path).await {
            Ok(manifest) => manifests.push(manifest),
            Err(e) => warn!("Skipping manifest {:?}: {}", path, e),
        }
    }
    Ok(manifests)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::services::ServiceManager;
    use crate::plugins::tasks::AsyncTaskManager;
    use crate::plugins::traits::Plugin;
    use crate::plugins::types::{PluginArchetype, PluginStatus};
    use async_trait::async_trait;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Inert;

    #[async_trait]
    impl Plugin for Inert {}

    fn inert_factory(_: &PluginManifest) -> KairoResult<PluginInstance> {
        Ok(PluginInstance::Static(Arc::new(Inert)))
    }

    fn loader() -> PluginLoader {
        let registry = PluginRegistry::new(
            Arc::new(AsyncTaskManager::new()),
            Arc::new(ServiceManager::new(
                Duration::from_secs(1),
                Duration::from_secs(1),
            )),
        );
        PluginLoader::new(Arc::new(registry))
    }

    fn manifest(id: &str) -> PluginManifest {
        PluginManifest::new(id, id, "0.1.0")
    }

    #[tokio::test]
    async fn test_eager_load_activates() {
        let loader = loader();
        let outcome = loader.load(manifest("core"), &inert_factory).await.unwrap();
        assert_eq!(outcome.activation, Activation::Immediate);
        assert!(loader.registry().is_active("core").await);
    }

    #[tokio::test]
    async fn test_missing_dependencies_listed() {
        let loader = loader();
        let err = loader
            .load(
                manifest("app").with_dependency("db").with_dependency("cache"),
                &inert_factory,
            )
            .await
            .unwrap_err();

        match err {
            KairoError::DependencyMissing { plugin, missing } => {
                assert_eq!(plugin, "app");
                assert_eq!(missing, vec!["db", "cache"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!loader.registry().contains("app").await);
    }

    #[tokio::test]
    async fn test_deferred_activation_on_event() {
        let loader = loader();
        let outcome = loader
            .load(
                manifest("lazy").with_activation_event("onCommand:run"),
                &inert_factory,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome.activation,
            Activation::Deferred(vec!["onCommand:run".to_string()])
        );
        assert_eq!(
            loader.registry().status("lazy").await,
            Some(PluginStatus::Loading)
        );

        assert!(loader.dispatch_event("onStartup").await.activated.is_empty());
        let report = loader.dispatch_event("onCommand:run").await;
        assert_eq!(report.activated, vec!["lazy"]);
        assert!(loader.registry().is_active("lazy").await);
        assert!(loader.pending_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_archetype_mismatch_rejected() {
        let loader = loader();
        let err = loader
            .load(
                manifest("odd").with_archetype(PluginArchetype::Synchronous),
                &inert_factory,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, KairoError::PluginLoadFailed { .. }));
        assert!(!loader.registry().contains("odd").await);
    }

    #[tokio::test]
    async fn test_factory_failure_leaves_registry_untouched() {
        let loader = loader();
        let failing = |m: &PluginManifest| -> KairoResult<PluginInstance> {
            Err(KairoError::Internal(format!("cannot build {}", m.id)))
        };
        let err = loader.load(manifest("nope"), &failing).await.unwrap_err();
        assert!(matches!(err, KairoError::PluginLoadFailed { .. }));
        assert!(loader.registry().is_empty().await);
    }

    #[test]
    fn test_load_order() {
        let batch = vec![
            manifest("app").with_dependency("db"),
            manifest("db").with_dependency("config"),
            manifest("config"),
            manifest("metrics"),
        ];
        let order = load_order(&batch).unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("config") < pos("db"));
        assert!(pos("db") < pos("app"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn test_load_order_cycle() {
        let batch = vec![
            manifest("aa").with_dependency("bb"),
            manifest("bb").with_dependency("aa"),
            manifest("cc"),
        ];
        match load_order(&batch) {
            Err(KairoError::DependencyCycle(ids)) => assert_eq!(ids, vec!["aa", "bb"]),
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_load_order_last_duplicate_wins() {
        let batch = vec![
            manifest("cache").with_dependency("store"),
            manifest("store"),
            manifest("cache"),
            manifest("store").with_dependency("cache"),
        ];
        let order = load_order(&batch).unwrap();
        assert_eq!(order, vec!["cache", "store"]);
    }

    #[tokio::test]
    async fn test_load_all_in_dependency_order() {
        let loader = loader();
        let result = loader
            .load_all(
                vec![manifest("app").with_dependency("db"), manifest("db")],
                &inert_factory,
            )
            .await
            .unwrap();
        assert_eq!(result.loaded.len(), 2);
        assert!(result.failed.is_empty());
        assert!(loader.registry().is_active("app").await);
    }

    #[tokio::test]
    async fn test_discover_manifests() {
        let dir = TempDir::new().unwrap();
        let json_dir = dir.path().join("alpha");
        let toml_dir = dir.path().join("beta");
        let empty_dir = dir.path().join("gamma");
        for d in [&json_dir, &toml_dir, &empty_dir] {
            tokio::fs::create_dir_all(d).await.unwrap();
        }

        tokio::fs::write(
            json_dir.join(PluginManifest::JSON_FILENAME),
            manifest("alpha").to_json().unwrap(),
        )
        .await
        .unwrap();
        tokio::fs::write(
            toml_dir.join(PluginManifest::TOML_FILENAME),
            "id = \"beta\"\nname = \"Beta\"\nversion = \"1.0.0\"\n",
        )
        .await
        .unwrap();

        let found = discover_manifests(dir.path()).await.unwrap();
        assert_eq!(found.len(), 2);

        let manifests = read_manifests(dir.path()).await.unwrap();
        let ids: Vec<&str> = manifests.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["alpha", "beta"]);
    }
}
