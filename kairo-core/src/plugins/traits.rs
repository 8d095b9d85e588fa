use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::KairoResult;

use super::manifest::PluginManifest;
use super::types::{
    ExecutionContext, HealthStatus, PluginArchetype, PluginConfig, PluginContext,
    PreprocessOutput,
};

/// Lifecycle hooks shared by every archetype.
#[async_trait]
pub trait Plugin: Send + Sync {
    async fn activate(&self, _ctx: &PluginContext) -> KairoResult<()> {
        Ok(())
    }

    async fn deactivate(&self) -> KairoResult<()> {
        Ok(())
    }

    async fn on_config_change(&self, _config: &PluginConfig) -> KairoResult<()> {
        Ok(())
    }
}

#[async_trait]
pub trait MessagePreprocessor: Plugin {
    async fn preprocess(&self, ctx: &ExecutionContext) -> KairoResult<PreprocessOutput>;
}

#[async_trait]
pub trait SynchronousPlugin: Plugin {
    async fn execute(&self, ctx: &ExecutionContext) -> KairoResult<Value>;
}

#[async_trait]
pub trait AsynchronousPlugin: Plugin {
    /// Runs on its own task. Implementations should watch `cancel` at their
    /// await points; the task is aborted after a granted cancellation anyway.
    async fn execute_async(
        &self,
        ctx: ExecutionContext,
        cancel: CancellationToken,
    ) -> KairoResult<Value>;

    /// Asked before a pending task is cancelled. Returning false keeps it running.
    async fn accept_cancel(&self, _task_id: Uuid) -> bool {
        true
    }
}

#[async_trait]
pub trait ServicePlugin: Plugin {
    async fn start_service(&self, ctx: &PluginContext) -> KairoResult<()>;

    /// One unit of periodic background work.
    async fn run_cycle(&self) -> KairoResult<()> {
        Ok(())
    }

    /// `None` means the service does all of its work in `start_service`.
    fn cycle_interval(&self) -> Option<Duration> {
        None
    }

    async fn stop_service(&self) -> KairoResult<()>;

    async fn health_check(&self) -> KairoResult<HealthStatus> {
        Ok(HealthStatus::healthy())
    }
}

/// The three capability views of one object implementing every contract a
/// hybrid service needs.
#[derive(Clone)]
pub struct HybridService {
    pub sync: Arc<dyn SynchronousPlugin>,
    pub asynchronous: Arc<dyn AsynchronousPlugin>,
    pub service: Arc<dyn ServicePlugin>,
}

/// A constructed plugin, tagged by archetype. Every dispatch site matches on
/// this exhaustively.
#[derive(Clone)]
pub enum PluginInstance {
    Static(Arc<dyn Plugin>),
    MessagePreprocessor(Arc<dyn MessagePreprocessor>),
    Synchronous(Arc<dyn SynchronousPlugin>),
    Asynchronous(Arc<dyn AsynchronousPlugin>),
    Service(Arc<dyn ServicePlugin>),
    HybridService(HybridService),
}

impl std::fmt::Debug for PluginInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PluginInstance")
            .field(&self.archetype())
            .finish()
    }
}

impl PluginInstance {
    pub fn hybrid<T>(plugin: Arc<T>) -> Self
    where
        T: SynchronousPlugin + AsynchronousPlugin + ServicePlugin + 'static,
    {
        PluginInstance::HybridService(HybridService {
            sync: plugin.clone(),
            asynchronous: plugin.clone(),
            service: plugin,
        })
    }

    pub fn archetype(&self) -> PluginArchetype {
        match self {
            PluginInstance::Static(_) => PluginArchetype::Static,
            PluginInstance::MessagePreprocessor(_) => PluginArchetype::MessagePreprocessor,
            PluginInstance::Synchronous(_) => PluginArchetype::Synchronous,
            PluginInstance::Asynchronous(_) => PluginArchetype::Asynchronous,
            PluginInstance::Service(_) => PluginArchetype::Service,
            PluginInstance::HybridService(_) => PluginArchetype::HybridService,
        }
    }

    pub async fn activate(&self, ctx: &PluginContext) -> KairoResult<()> {
        match self {
            PluginInstance::Static(p) => p.activate(ctx).await,
            PluginInstance::MessagePreprocessor(p) => p.activate(ctx).await,
            PluginInstance::Synchronous(p) => p.activate(ctx).await,
            PluginInstance::Asynchronous(p) => p.activate(ctx).await,
            PluginInstance::Service(p) => p.activate(ctx).await,
            PluginInstance::HybridService(h) => h.service.activate(ctx).await,
        }
    }

    pub async fn deactivate(&self) -> KairoResult<()> {
        match self {
            PluginInstance::Static(p) => p.deactivate().await,
            PluginInstance::MessagePreprocessor(p) => p.deactivate().await,
            PluginInstance::Synchronous(p) => p.deactivate().await,
            PluginInstance::Asynchronous(p) => p.deactivate().await,
            PluginInstance::Service(p) => p.deactivate().await,
            PluginInstance::HybridService(h) => h.service.deactivate().await,
        }
    }

    pub async fn on_config_change(&self, config: &PluginConfig) -> KairoResult<()> {
        match self {
            PluginInstance::Static(p) => p.on_config_change(config).await,
            PluginInstance::MessagePreprocessor(p) => p.on_config_change(config).await,
            PluginInstance::Synchronous(p) => p.on_config_change(config).await,
            PluginInstance::Asynchronous(p) => p.on_config_change(config).await,
            PluginInstance::Service(p) => p.on_config_change(config).await,
            PluginInstance::HybridService(h) => h.service.on_config_change(config).await,
        }
    }

    pub fn as_preprocessor(&self) -> Option<Arc<dyn MessagePreprocessor>> {
        match self {
            PluginInstance::MessagePreprocessor(p) => Some(p.clone()),
            PluginInstance::Static(_)
            | PluginInstance::Synchronous(_)
            | PluginInstance::Asynchronous(_)
            | PluginInstance::Service(_)
            | PluginInstance::HybridService(_) => None,
        }
    }

    pub fn as_synchronous(&self) -> Option<Arc<dyn SynchronousPlugin>> {
        match self {
            PluginInstance::Synchronous(p) => Some(p.clone()),
            PluginInstance::HybridService(h) => Some(h.sync.clone()),
            PluginInstance::Static(_)
            | PluginInstance::MessagePreprocessor(_)
            | PluginInstance::Asynchronous(_)
            | PluginInstance::Service(_) => None,
        }
    }

    pub fn as_asynchronous(&self) -> Option<Arc<dyn AsynchronousPlugin>> {
        match self {
            PluginInstance::Asynchronous(p) => Some(p.clone()),
            PluginInstance::HybridService(h) => Some(h.asynchronous.clone()),
            PluginInstance::Static(_)
            | PluginInstance::MessagePreprocessor(_)
            | PluginInstance::Synchronous(_)
            | PluginInstance::Service(_) => None,
        }
    }

    pub fn as_service(&self) -> Option<Arc<dyn ServicePlugin>> {
        match self {
            PluginInstance::Service(p) => Some(p.clone()),
            PluginInstance::HybridService(h) => Some(h.service.clone()),
            PluginInstance::Static(_)
            | PluginInstance::MessagePreprocessor(_)
            | PluginInstance::Synchronous(_)
            | PluginInstance::Asynchronous(_) => None,
        }
    }
}

/// Builds plugin instances from manifests at load time.
pub trait PluginFactory: Send + Sync {
    fn create(&self, manifest: &PluginManifest) -> KairoResult<PluginInstance>;
}

impl<F> PluginFactory for F
where
    F: Fn(&PluginManifest) -> KairoResult<PluginInstance> + Send + Sync,
{
    fn create(&self, manifest: &PluginManifest) -> KairoResult<PluginInstance> {
        self(manifest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Plugin for Echo {}

    #[async_trait]
    impl SynchronousPlugin for Echo {
        async fn execute(&self, ctx: &ExecutionContext) -> KairoResult<Value> {
            Ok(ctx.input.clone())
        }
    }

    #[async_trait]
    impl AsynchronousPlugin for Echo {
        async fn execute_async(
            &self,
            ctx: ExecutionContext,
            _cancel: CancellationToken,
        ) -> KairoResult<Value> {
            Ok(ctx.input)
        }
    }

    #[async_trait]
    impl ServicePlugin for Echo {
        async fn start_service(&self, _ctx: &PluginContext) -> KairoResult<()> {
            Ok(())
        }

        async fn stop_service(&self) -> KairoResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_hybrid_exposes_all_capabilities() {
        let instance = PluginInstance::hybrid(Arc::new(Echo));
        assert_eq!(instance.archetype(), PluginArchetype::HybridService);
        assert!(instance.as_synchronous().is_some());
        assert!(instance.as_asynchronous().is_some());
        assert!(instance.as_service().is_some());
        assert!(instance.as_preprocessor().is_none());

        let ctx = ExecutionContext::new("req-1", "echo", json!({"q": 1}));
        let out = instance.as_synchronous().unwrap().execute(&ctx).await.unwrap();
        assert_eq!(out, json!({"q": 1}));
    }

    #[tokio::test]
    async fn test_closure_factory() {
        let factory = |_: &PluginManifest| -> KairoResult<PluginInstance> {
            Ok(PluginInstance::Synchronous(Arc::new(Echo)))
        };
        let manifest = PluginManifest::new("echo", "Echo", "1.0.0");
        let instance = factory.create(&manifest).unwrap();
        assert_eq!(instance.archetype(), PluginArchetype::Synchronous);
        assert!(instance.activate(&PluginContext::new("echo", PluginConfig::new())).await.is_ok());
    }
}
