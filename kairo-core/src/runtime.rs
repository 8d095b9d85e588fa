use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::KairoConfig;
use crate::error::KairoResult;
use crate::plugins::{
    AsyncTaskManager, BatchLoad, ChainRequest, ContributionDescriptor, DispatchReport,
    ExecutionChain, ExecutionResult, LoadOutcome, PluginConfig, PluginConfigPatch, PluginFactory,
    PluginInfo, PluginLoader, PluginManifest, PluginRegistry, RegistryStats, SandboxHarness,
    ServiceHealth, ServiceManager, UnregisterReport,
};

struct Sweeper {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

/// Owns one registry and everything wired around it.
pub struct PluginRuntime {
    config: KairoConfig,
    tasks: Arc<AsyncTaskManager>,
    services: Arc<ServiceManager>,
    registry: Arc<PluginRegistry>,
    loader: PluginLoader,
    chain: ExecutionChain,
    sandbox: SandboxHarness,
    sweeper: Mutex<Option<Sweeper>>,
}

impl PluginRuntime {
    pub fn new(config: &KairoConfig) -> Self {
        let tasks = Arc::new(AsyncTaskManager::new());
        let services = Arc::new(ServiceManager::new(
            config.runtime.health_check_timeout(),
            config.runtime.service_stop_timeout(),
        ));
        let registry = Arc::new(PluginRegistry::new(tasks.clone(), services.clone()));

        Self {
            config: config.clone(),
            tasks,
            services,
            loader: PluginLoader::new(registry.clone()),
            chain: ExecutionChain::new(registry.clone()),
            sandbox: SandboxHarness::new(&config.sandbox),
            registry,
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &KairoConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    pub fn tasks(&self) -> &Arc<AsyncTaskManager> {
        &self.tasks
    }

    pub fn sandbox(&self) -> &SandboxHarness {
        &self.sandbox
    }

    /// Starts the expired-task sweeper. Calling it again is a no-op.
    pub async fn start_background(&self) {
        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_some() {
            return;
        }

        let shutdown = CancellationToken::new();
        let handle = self.tasks.clone().spawn_sweeper(
            self.config.runtime.sweep_interval(),
            self.config.runtime.task_retention(),
            shutdown.clone(),
        );
        *sweeper = Some(Sweeper { shutdown, handle });
        debug!("Started async task sweeper");
    }

    pub async fn load_plugin(
        &self,
        manifest: PluginManifest,
        factory: &dyn PluginFactory,
    ) -> KairoResult<LoadOutcome> {
        self.loader.load(manifest, factory).await
    }

    pub async fn load_all(
        &self,
        batch: Vec<PluginManifest>,
        factory: &dyn PluginFactory,
    ) -> KairoResult<BatchLoad> {
        self.loader.load_all(batch, factory).await
    }

    pub async fn dispatch_event(&self, event: &str) -> DispatchReport {
        self.loader.dispatch_event(event).await
    }

    pub async fn unload_plugin(&self, plugin_id: &str) -> UnregisterReport {
        self.loader.forget(plugin_id).await;
        self.registry.unregister(plugin_id).await
    }

    pub async fn execute_chain(&self, request: ChainRequest) -> ExecutionResult {
        self.chain.execute(request).await
    }

    pub async fn get_async_result(&self, task_id: Uuid) -> KairoResult<ExecutionResult> {
        self.tasks.get_result(task_id).await
    }

    pub async fn cancel_async_task(&self, task_id: Uuid) -> bool {
        self.tasks.cancel(task_id).await
    }

    pub async fn health_check(&self) -> Vec<ServiceHealth> {
        let services = self.registry.active_services().await;
        self.services.check_all(services).await
    }

    pub async fn get_stats(&self) -> RegistryStats {
        self.registry.stats().await
    }

    pub async fn reload_config(
        &self,
        plugin_id: &str,
        patch: PluginConfigPatch,
    ) -> KairoResult<PluginConfig> {
        self.registry.reload_config(plugin_id, patch).await
    }

    pub async fn get_plugin(&self, plugin_id: &str) -> Option<PluginInfo> {
        self.registry.get_plugin(plugin_id).await
    }

    pub async fn list_plugins(&self) -> Vec<PluginInfo> {
        self.registry.list_plugins().await
    }

    pub async fn list_by_contribution(&self, point: &str) -> Vec<(String, ContributionDescriptor)> {
        self.registry.list_by_contribution(point).await
    }

    /// Contributions as plain JSON, for collaborators that only speak JSON.
    pub async fn contributions_json(&self, point: &str) -> Value {
        let entries: Vec<Value> = self
            .list_by_contribution(point)
            .await
            .into_iter()
            .map(|(plugin_id, descriptor)| {
                serde_json::json!({ "pluginId": plugin_id, "descriptor": descriptor })
            })
            .collect();
        Value::Array(entries)
    }

    /// Unregisters every plugin, newest first, then stops background work.
    pub async fn shutdown(&self) -> Vec<UnregisterReport> {
        let mut plugins = self.registry.list_plugins().await;
        plugins.reverse();

        let mut reports = Vec::with_capacity(plugins.len());
        for plugin in plugins {
            let report = self.unload_plugin(&plugin.id).await;
            if !report.is_clean() {
                warn!(
                    plugin_id = %report.plugin_id,
                    errors = report.cleanup_errors.len(),
                    "Plugin did not shut down cleanly"
                );
            }
            reports.push(report);
        }

        if let Some(sweeper) = self.sweeper.lock().await.take() {
            sweeper.shutdown.cancel();
            if let Err(e) = sweeper.handle.await {
                warn!("Async task sweeper ended abnormally: {}", e);
            }
        }

        self.services.shutdown().await;
        info!(unloaded = reports.len(), "Plugin runtime shut down");
        reports
    }
}
