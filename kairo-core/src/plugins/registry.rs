use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::{CleanupError, CleanupStage, KairoError, KairoResult};

use super::guard::contain_panic;
use super::manifest::{ContributionDescriptor, PluginManifest};
use super::services::ServiceManager;
use super::tasks::AsyncTaskManager;
use super::traits::{PluginInstance, ServicePlugin};
use super::types::{
    PluginArchetype, PluginConfig, PluginConfigPatch, PluginContext, PluginInfo, PluginStatus,
    RegistryStats,
};

struct RegistryEntry {
    instance: PluginInstance,
    manifest: Arc<PluginManifest>,
    status: PluginStatus,
    context: PluginContext,
    config: PluginConfig,
    seq: u64,
    registered_at: DateTime<Utc>,
    last_error: Option<String>,
    activating: Option<watch::Receiver<()>>,
}

impl RegistryEntry {
    /// A handle on the activation currently running for this entry, if any.
    /// It resolves when the activating caller finishes.
    fn activation_in_flight(&self) -> Option<watch::Receiver<()>> {
        self.activating
            .as_ref()
            .filter(|rx| rx.has_changed().is_ok())
            .cloned()
    }

    fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            archetype: self.instance.archetype(),
            status: self.status,
            priority: self.config.priority,
            registered_at: self.registered_at,
            last_error: self.last_error.clone(),
        }
    }

    fn snapshot(&self) -> RegisteredPlugin {
        RegisteredPlugin {
            id: self.manifest.id.clone(),
            instance: self.instance.clone(),
            manifest: self.manifest.clone(),
            context: self.context.clone(),
            status: self.status,
            priority: self.config.priority,
            seq: self.seq,
        }
    }
}

/// A point-in-time copy of an entry, safe to use after the registry lock is
/// released.
#[derive(Debug, Clone)]
pub struct RegisteredPlugin {
    pub id: String,
    pub instance: PluginInstance,
    pub manifest: Arc<PluginManifest>,
    pub context: PluginContext,
    pub status: PluginStatus,
    pub priority: i32,
    pub seq: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnregisterReport {
    pub plugin_id: String,
    pub removed: bool,
    pub purged_tasks: usize,
    pub cleanup_errors: Vec<CleanupError>,
}

impl UnregisterReport {
    fn not_found(plugin_id: &str) -> Self {
        Self {
            plugin_id: plugin_id.to_string(),
            removed: false,
            purged_tasks: 0,
            cleanup_errors: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.cleanup_errors.is_empty()
    }
}

/// Owns every registered plugin. The table sits behind one lock that is
/// never held across a plugin hook.
pub struct PluginRegistry {
    entries: RwLock<HashMap<String, RegistryEntry>>,
    next_seq: AtomicU64,
    tasks: Arc<AsyncTaskManager>,
    services: Arc<ServiceManager>,
}

impl PluginRegistry {
    pub fn new(tasks: Arc<AsyncTaskManager>, services: Arc<ServiceManager>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            tasks,
            services,
        }
    }

    pub fn tasks(&self) -> &Arc<AsyncTaskManager> {
        &self.tasks
    }

    pub fn services(&self) -> &Arc<ServiceManager> {
        &self.services
    }

    /// Adds a plugin at `Loading`. An existing entry with the same id is
    /// replaced and its instance torn down.
    pub async fn register(
        &self,
        manifest: PluginManifest,
        instance: PluginInstance,
    ) -> KairoResult<()> {
        manifest.validate()?;

        let plugin_id = manifest.id.clone();
        let config = PluginConfig::new().with_priority(manifest.priority);
        let entry = RegistryEntry {
            context: PluginContext::new(&plugin_id, config.clone()),
            instance,
            manifest: Arc::new(manifest),
            status: PluginStatus::Loading,
            config,
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            registered_at: Utc::now(),
            last_error: None,
            activating: None,
        };

        let replaced = self.entries.write().await.insert(plugin_id.clone(), entry);

        match replaced {
            Some(old) => {
                warn!(plugin_id = %plugin_id, "Plugin already registered, replacing existing entry");
                let errors = self
                    .teardown(&plugin_id, &old.instance, old.status == PluginStatus::Active)
                    .await;
                for e in &errors {
                    warn!(plugin_id = %plugin_id, "Cleanup of replaced instance: {}", e);
                }
                self.tasks.purge_plugin(&plugin_id).await;
            }
            None => info!(plugin_id = %plugin_id, "Registered plugin"),
        }

        Ok(())
    }

    /// Runs the activation hook and, for services, starts them. A plugin that
    /// is already active is left as is. Only one activation per id runs at a
    /// time; overlapping callers wait for it and share its outcome.
    pub async fn activate(&self, plugin_id: &str) -> KairoResult<()> {
        let mut waited = false;
        let (snapshot, _done) = loop {
            let mut in_flight = {
                let mut entries = self.entries.write().await;
                let entry = entries
                    .get_mut(plugin_id)
                    .ok_or_else(|| KairoError::PluginNotFound(plugin_id.to_string()))?;

                match entry.activation_in_flight() {
                    Some(rx) => rx,
                    None => {
                        if entry.status == PluginStatus::Active {
                            return Ok(());
                        }
                        // After waiting, only a fresh registration is worth
                        // another attempt.
                        if waited && entry.status == PluginStatus::Error {
                            let message = entry.last_error.clone().unwrap_or_default();
                            return Err(KairoError::activation(plugin_id, message));
                        }
                        if !entry.status.can_activate()
                            || (waited && entry.status != PluginStatus::Loading)
                        {
                            return Err(KairoError::InvalidTransition {
                                plugin: plugin_id.to_string(),
                                from: entry.status.to_string(),
                                to: PluginStatus::Active.to_string(),
                            });
                        }

                        let (tx, rx) = watch::channel(());
                        entry.status = PluginStatus::Loading;
                        entry.activating = Some(rx);
                        break (entry.snapshot(), tx);
                    }
                }
            };

            debug!(plugin_id = %plugin_id, "Waiting for in-flight activation");
            let _ = in_flight.changed().await;
            waited = true;
        };

        let mut cleanup = Vec::new();
        let mut outcome = contain_panic(plugin_id, snapshot.instance.activate(&snapshot.context)).await;

        if outcome.is_ok() {
            if let Some(service) = snapshot.instance.as_service() {
                outcome = contain_panic(
                    plugin_id,
                    self.services.start(plugin_id, service, &snapshot.context),
                )
                .await;
                if outcome.is_err() {
                    if let Err(e) = contain_panic(plugin_id, snapshot.instance.deactivate()).await {
                        cleanup.push(CleanupError::new(
                            plugin_id,
                            CleanupStage::Deactivate,
                            e.to_string(),
                        ));
                    }
                }
            }
        }

        let mut entries = self.entries.write().await;
        let current = entries
            .get_mut(plugin_id)
            .filter(|e| e.seq == snapshot.seq);
        let Some(entry) = current else {
            drop(entries);
            warn!(plugin_id = %plugin_id, "Plugin was replaced or removed during activation");
            if outcome.is_ok() {
                cleanup.extend(self.teardown(plugin_id, &snapshot.instance, true).await);
            }
            log_cleanup(plugin_id, &cleanup);
            return Err(KairoError::PluginNotFound(plugin_id.to_string()));
        };
        entry.activating = None;

        if entry.status != PluginStatus::Loading {
            // Disabled or unregistered while the hook ran.
            let from = entry.status.to_string();
            drop(entries);
            if outcome.is_ok() {
                cleanup.extend(self.teardown(plugin_id, &snapshot.instance, true).await);
            }
            log_cleanup(plugin_id, &cleanup);
            return Err(KairoError::InvalidTransition {
                plugin: plugin_id.to_string(),
                from,
                to: PluginStatus::Active.to_string(),
            });
        }

        log_cleanup(plugin_id, &cleanup);
        match outcome {
            Ok(()) => {
                entry.status = PluginStatus::Active;
                entry.last_error = None;
                if !entry.config.enabled {
                    entry.config.enabled = true;
                    entry.context.replace_config(entry.config.clone()).await;
                }
                info!(plugin_id = %plugin_id, archetype = %snapshot.instance.archetype(), "Activated plugin");
                Ok(())
            }
            Err(e) => {
                let mut message = e.to_string();
                for c in &cleanup {
                    message.push_str(&format!("; {}", c));
                }
                entry.status = PluginStatus::Error;
                entry.last_error = Some(message.clone());
                error!(plugin_id = %plugin_id, "Activation failed: {}", message);
                Err(KairoError::activation(plugin_id, message))
            }
        }
    }

    /// Moves a plugin to `Disabled`, stopping and deactivating it if it was active.
    pub async fn disable(&self, plugin_id: &str) -> KairoResult<()> {
        let (instance, was_active) = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(plugin_id)
                .ok_or_else(|| KairoError::PluginNotFound(plugin_id.to_string()))?;

            match entry.status {
                PluginStatus::Disabled => return Ok(()),
                PluginStatus::Unloading => {
                    return Err(KairoError::InvalidTransition {
                        plugin: plugin_id.to_string(),
                        from: entry.status.to_string(),
                        to: PluginStatus::Disabled.to_string(),
                    });
                }
                PluginStatus::Active | PluginStatus::Loading | PluginStatus::Error => {}
            }

            let was_active = entry.status == PluginStatus::Active;
            entry.status = PluginStatus::Disabled;
            entry.config.enabled = false;
            entry.context.replace_config(entry.config.clone()).await;
            (entry.instance.clone(), was_active)
        };

        if was_active {
            for e in self.teardown(plugin_id, &instance, true).await {
                warn!(plugin_id = %plugin_id, "{}", e);
            }
        }

        info!(plugin_id = %plugin_id, "Disabled plugin");
        Ok(())
    }

    /// Stops, deactivates and removes a plugin, then purges its async tasks.
    /// Cleanup failures are collected in the report, never returned as errors.
    pub async fn unregister(&self, plugin_id: &str) -> UnregisterReport {
        let (instance, seq, was_active) = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(plugin_id) else {
                warn!(plugin_id = %plugin_id, "Unregister requested for unknown plugin");
                return UnregisterReport::not_found(plugin_id);
            };

            let was_active = entry.status == PluginStatus::Active;
            entry.status = PluginStatus::Unloading;
            (entry.instance.clone(), entry.seq, was_active)
        };

        let cleanup_errors = self.teardown(plugin_id, &instance, was_active).await;

        {
            let mut entries = self.entries.write().await;
            if entries.get(plugin_id).map(|e| e.seq) == Some(seq) {
                entries.remove(plugin_id);
            }
        }

        let purged_tasks = self.tasks.purge_plugin(plugin_id).await;

        log_cleanup(plugin_id, &cleanup_errors);
        info!(plugin_id = %plugin_id, purged_tasks, "Unregistered plugin");

        UnregisterReport {
            plugin_id: plugin_id.to_string(),
            removed: true,
            purged_tasks,
            cleanup_errors,
        }
    }

    /// Merges a config patch, notifies the plugin and applies any
    /// enable/disable the patch asks for.
    pub async fn reload_config(
        &self,
        plugin_id: &str,
        patch: PluginConfigPatch,
    ) -> KairoResult<PluginConfig> {
        let (instance, config, status) = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(plugin_id)
                .ok_or_else(|| KairoError::PluginNotFound(plugin_id.to_string()))?;

            entry.config.apply(&patch);
            entry.context.replace_config(entry.config.clone()).await;
            (entry.instance.clone(), entry.config.clone(), entry.status)
        };

        if let Err(e) = contain_panic(plugin_id, instance.on_config_change(&config)).await {
            warn!(plugin_id = %plugin_id, "Config change hook failed: {}", e);
        }

        match patch.enabled {
            Some(false) if status != PluginStatus::Disabled => self.disable(plugin_id).await?,
            Some(true) if status == PluginStatus::Disabled => self.activate(plugin_id).await?,
            _ => {}
        }

        debug!(plugin_id = %plugin_id, "Reloaded plugin config");
        Ok(config)
    }

    pub async fn get_plugin(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.entries.read().await.get(plugin_id).map(RegistryEntry::info)
    }

    pub async fn get_registered(&self, plugin_id: &str) -> Option<RegisteredPlugin> {
        self.entries
            .read()
            .await
            .get(plugin_id)
            .map(RegistryEntry::snapshot)
    }

    pub async fn status(&self, plugin_id: &str) -> Option<PluginStatus> {
        self.entries.read().await.get(plugin_id).map(|e| e.status)
    }

    pub async fn config(&self, plugin_id: &str) -> Option<PluginConfig> {
        self.entries
            .read()
            .await
            .get(plugin_id)
            .map(|e| e.config.clone())
    }

    pub async fn is_active(&self, plugin_id: &str) -> bool {
        self.status(plugin_id).await == Some(PluginStatus::Active)
    }

    pub async fn contains(&self, plugin_id: &str) -> bool {
        self.entries.read().await.contains_key(plugin_id)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// All plugins in registration order.
    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        let entries = self.entries.read().await;
        let mut listed: Vec<&RegistryEntry> = entries.values().collect();
        listed.sort_by_key(|e| e.seq);
        listed.into_iter().map(RegistryEntry::info).collect()
    }

    pub async fn list_by_archetype(&self, archetype: PluginArchetype) -> Vec<PluginInfo> {
        self.list_plugins()
            .await
            .into_iter()
            .filter(|p| p.archetype == archetype)
            .collect()
    }

    /// Every descriptor registered under `point`, paired with its plugin id,
    /// in registration order.
    pub async fn list_by_contribution(&self, point: &str) -> Vec<(String, ContributionDescriptor)> {
        let entries = self.entries.read().await;
        let mut listed: Vec<&RegistryEntry> = entries.values().collect();
        listed.sort_by_key(|e| e.seq);

        listed
            .into_iter()
            .flat_map(|e| {
                e.manifest
                    .contributions_for(point)
                    .iter()
                    .map(move |d| (e.manifest.id.clone(), d.clone()))
            })
            .collect()
    }

    /// Active plugins ordered for execution: higher priority first, ties by
    /// registration order.
    pub async fn active_in_priority_order(&self) -> Vec<RegisteredPlugin> {
        let entries = self.entries.read().await;
        let mut active: Vec<RegisteredPlugin> = entries
            .values()
            .filter(|e| e.status == PluginStatus::Active)
            .map(RegistryEntry::snapshot)
            .collect();
        active.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        active
    }

    pub async fn active_services(&self) -> Vec<(String, Arc<dyn ServicePlugin>)> {
        let entries = self.entries.read().await;
        let mut active: Vec<&RegistryEntry> = entries
            .values()
            .filter(|e| e.status == PluginStatus::Active)
            .collect();
        active.sort_by_key(|e| e.seq);
        active
            .into_iter()
            .filter_map(|e| {
                e.instance
                    .as_service()
                    .map(|service| (e.manifest.id.clone(), service))
            })
            .collect()
    }

    /// Ids in registration order.
    pub async fn plugin_ids(&self) -> Vec<String> {
        self.list_plugins().await.into_iter().map(|p| p.id).collect()
    }

    pub async fn stats(&self) -> RegistryStats {
        let mut stats = RegistryStats::default();
        {
            let entries = self.entries.read().await;
            stats.total = entries.len();
            for entry in entries.values() {
                *stats
                    .by_archetype
                    .entry(entry.instance.archetype())
                    .or_insert(0) += 1;
                *stats.by_status.entry(entry.status).or_insert(0) += 1;
            }
        }
        stats.pending_async_tasks = self.tasks.pending_count().await;
        stats
    }

    async fn teardown(
        &self,
        plugin_id: &str,
        instance: &PluginInstance,
        stop_service: bool,
    ) -> Vec<CleanupError> {
        let mut errors = Vec::new();

        if stop_service {
            if let Some(service) = instance.as_service() {
                if let Err(e) =
                    contain_panic(plugin_id, self.services.stop(plugin_id, service)).await
                {
                    errors.push(CleanupError::new(
                        plugin_id,
                        CleanupStage::StopService,
                        e.to_string(),
                    ));
                }
            }
        }

        if let Err(e) = contain_panic(plugin_id, instance.deactivate()).await {
            errors.push(CleanupError::new(
                plugin_id,
                CleanupStage::Deactivate,
                e.to_string(),
            ));
        }

        errors
    }
}

fn log_cleanup(plugin_id: &str, errors: &[CleanupError]) {
    for e in errors {
        warn!(plugin_id = %plugin_id, stage = %e.stage, "Cleanup failed: {}", e.message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::traits::{Plugin, SynchronousPlugin};
    use crate::plugins::types::ExecutionContext;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        activations: AtomicUsize,
        deactivations: AtomicUsize,
        fail_activation: bool,
        fail_deactivation: bool,
    }

    #[async_trait]
    impl Plugin for Counter {
        async fn activate(&self, _ctx: &PluginContext) -> KairoResult<()> {
            self.activations.fetch_add(1, Ordering::SeqCst);
            if self.fail_activation {
                return Err(KairoError::Internal("no credentials".to_string()));
            }
            Ok(())
        }

        async fn deactivate(&self) -> KairoResult<()> {
            self.deactivations.fetch_add(1, Ordering::SeqCst);
            if self.fail_deactivation {
                return Err(KairoError::Internal("socket stuck".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SynchronousPlugin for Counter {
        async fn execute(&self, _ctx: &ExecutionContext) -> KairoResult<Value> {
            Ok(json!(null))
        }
    }

    #[derive(Default)]
    struct SlowService {
        starts: AtomicUsize,
        stops: AtomicUsize,
        fail_start: bool,
        fail_deactivation: bool,
    }

    #[async_trait]
    impl Plugin for SlowService {
        async fn activate(&self, _ctx: &PluginContext) -> KairoResult<()> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        }

        async fn deactivate(&self) -> KairoResult<()> {
            if self.fail_deactivation {
                return Err(KairoError::Internal("pool still draining".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl ServicePlugin for SlowService {
        async fn start_service(&self, _ctx: &PluginContext) -> KairoResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                return Err(KairoError::Internal("port in use".to_string()));
            }
            Ok(())
        }

        async fn stop_service(&self) -> KairoResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn registry() -> PluginRegistry {
        PluginRegistry::new(
            Arc::new(AsyncTaskManager::new()),
            Arc::new(ServiceManager::new(
                Duration::from_secs(1),
                Duration::from_secs(1),
            )),
        )
    }

    fn manifest(id: &str) -> PluginManifest {
        PluginManifest::new(id, id, "1.0.0")
    }

    #[tokio::test]
    async fn test_register_and_activate() {
        let registry = registry();
        let plugin = Arc::new(Counter::default());
        registry
            .register(manifest("counter"), PluginInstance::Synchronous(plugin.clone()))
            .await
            .unwrap();
        assert_eq!(registry.status("counter").await, Some(PluginStatus::Loading));

        registry.activate("counter").await.unwrap();
        registry.activate("counter").await.unwrap();
        assert_eq!(registry.status("counter").await, Some(PluginStatus::Active));
        assert_eq!(plugin.activations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_activation_marks_error() {
        let registry = registry();
        let plugin = Arc::new(Counter {
            fail_activation: true,
            ..Default::default()
        });
        registry
            .register(manifest("broken"), PluginInstance::Synchronous(plugin))
            .await
            .unwrap();

        let err = registry.activate("broken").await.unwrap_err();
        assert!(matches!(err, KairoError::ActivationFailed { .. }));

        let info = registry.get_plugin("broken").await.unwrap();
        assert_eq!(info.status, PluginStatus::Error);
        assert!(info.last_error.unwrap().contains("no credentials"));
    }

    #[tokio::test]
    async fn test_duplicate_registration_replaces_entry() {
        let registry = registry();
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());

        registry
            .register(manifest("dup"), PluginInstance::Synchronous(first.clone()))
            .await
            .unwrap();
        registry.activate("dup").await.unwrap();
        registry
            .register(manifest("dup"), PluginInstance::Synchronous(second))
            .await
            .unwrap();

        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.status("dup").await, Some(PluginStatus::Loading));
        assert_eq!(first.deactivations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unregister_collects_cleanup_errors() {
        let registry = registry();
        let plugin = Arc::new(Counter {
            fail_deactivation: true,
            ..Default::default()
        });
        registry
            .register(manifest("sticky"), PluginInstance::Synchronous(plugin))
            .await
            .unwrap();
        registry.activate("sticky").await.unwrap();

        let report = registry.unregister("sticky").await;
        assert!(report.removed);
        assert_eq!(report.cleanup_errors.len(), 1);
        assert_eq!(report.cleanup_errors[0].stage, CleanupStage::Deactivate);
        assert!(!registry.contains("sticky").await);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let registry = registry();
        let report = registry.unregister("ghost").await;
        assert!(!report.removed);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_reload_config_disables_and_reenables() {
        let registry = registry();
        let plugin = Arc::new(Counter::default());
        registry
            .register(manifest("toggle"), PluginInstance::Synchronous(plugin.clone()))
            .await
            .unwrap();
        registry.activate("toggle").await.unwrap();

        let config = registry
            .reload_config(
                "toggle",
                PluginConfigPatch::enabled(false).with_setting("mode", json!("fast")),
            )
            .await
            .unwrap();
        assert!(!config.enabled);
        assert_eq!(registry.status("toggle").await, Some(PluginStatus::Disabled));
        assert_eq!(plugin.deactivations.load(Ordering::SeqCst), 1);

        let ctx = registry.get_registered("toggle").await.unwrap().context;
        assert_eq!(ctx.setting::<String>("mode").await, Some("fast".to_string()));

        registry
            .reload_config("toggle", PluginConfigPatch::enabled(true))
            .await
            .unwrap();
        assert_eq!(registry.status("toggle").await, Some(PluginStatus::Active));
        assert_eq!(plugin.activations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_priority_order_and_queries() {
        let registry = registry();
        for (id, priority) in [("low", 1), ("high", 10), ("mid-a", 5), ("mid-b", 5)] {
            let manifest = manifest(id).with_priority(priority).with_contribution(
                "tools",
                ContributionDescriptor::new(format!("{}-tool", id), "h"),
            );
            registry
                .register(manifest, PluginInstance::Synchronous(Arc::new(Counter::default())))
                .await
                .unwrap();
            registry.activate(id).await.unwrap();
        }

        let order: Vec<String> = registry
            .active_in_priority_order()
            .await
            .into_iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(order, vec!["high", "mid-a", "mid-b", "low"]);

        let tools = registry.list_by_contribution("tools").await;
        assert_eq!(tools.len(), 4);
        assert_eq!(tools[0].0, "low");

        let stats = registry.stats().await;
        assert_eq!(stats.total, 4);
        assert_eq!(stats.by_archetype[&PluginArchetype::Synchronous], 4);
        assert_eq!(stats.by_status[&PluginStatus::Active], 4);
        assert_eq!(
            registry.list_by_archetype(PluginArchetype::Static).await.len(),
            0
        );
    }

    #[tokio::test]
    async fn test_overlapping_activations_start_service_once() {
        let registry = registry();
        let service = Arc::new(SlowService::default());
        registry
            .register(manifest("svc"), PluginInstance::Service(service.clone()))
            .await
            .unwrap();

        let (a, b, c) = tokio::join!(
            registry.activate("svc"),
            registry.activate("svc"),
            registry.activate("svc"),
        );
        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
        assert_eq!(registry.status("svc").await, Some(PluginStatus::Active));

        registry.unregister("svc").await;
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waiters_share_failed_activation() {
        let registry = registry();
        let service = Arc::new(SlowService {
            fail_start: true,
            ..Default::default()
        });
        registry
            .register(manifest("svc"), PluginInstance::Service(service.clone()))
            .await
            .unwrap();

        let (a, b) = tokio::join!(registry.activate("svc"), registry.activate("svc"));
        assert!(matches!(a, Err(KairoError::ActivationFailed { .. })));
        assert!(matches!(b, Err(KairoError::ActivationFailed { .. })));
        assert_eq!(service.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_start_records_cleanup_failure() {
        let registry = registry();
        let service = Arc::new(SlowService {
            fail_start: true,
            fail_deactivation: true,
            ..Default::default()
        });
        registry
            .register(manifest("svc"), PluginInstance::Service(service))
            .await
            .unwrap();

        let err = registry.activate("svc").await.unwrap_err();
        assert!(err.to_string().contains("port in use"));

        let last_error = registry.get_plugin("svc").await.unwrap().last_error.unwrap();
        assert!(last_error.contains("port in use"));
        assert!(last_error.contains("svc deactivate failed"));
        assert!(last_error.contains("pool still draining"));
    }

    #[tokio::test]
    async fn test_disable_during_activation_wins() {
        let registry = registry();
        let service = Arc::new(SlowService::default());
        registry
            .register(manifest("svc"), PluginInstance::Service(service.clone()))
            .await
            .unwrap();

        let (activated, disabled) = tokio::join!(registry.activate("svc"), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            registry.disable("svc").await
        });

        assert!(disabled.is_ok());
        assert!(matches!(activated, Err(KairoError::InvalidTransition { .. })));
        assert_eq!(registry.status("svc").await, Some(PluginStatus::Disabled));
        assert_eq!(service.stops.load(Ordering::SeqCst), 1);
    }
}
