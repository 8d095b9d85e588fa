//! Per-request execution chain.
//!
//! A chain runs three phases over the active plugins, each phase in strict
//! priority order (higher first, ties by registration order):
//!
//! 1. message preprocessors, which may rewrite the input and add metadata
//! 2. synchronous plugins, awaited one after another
//! 3. asynchronous plugins, started on the task manager and not awaited
//!
//! Plugin failures and panics are recorded under `metadata[pluginId]` and
//! never fail the chain. The chain output is the result of the
//! highest-priority synchronous plugin that succeeded.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::guard::contain_panic;
use super::registry::{PluginRegistry, RegisteredPlugin};
use super::types::{ExecutionContext, ExecutionResult, PluginArchetype};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainRequest {
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype_filter: Option<Vec<PluginArchetype>>,
    #[serde(default)]
    pub include_async: bool,
}

impl ChainRequest {
    pub fn new(request_id: impl Into<String>, input: Value) -> Self {
        Self {
            request_id: request_id.into(),
            user_id: None,
            session_id: None,
            input,
            metadata: Map::new(),
            archetype_filter: None,
            include_async: false,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Restricts the chain to the given archetypes.
    pub fn only(mut self, archetypes: &[PluginArchetype]) -> Self {
        self.archetype_filter = Some(archetypes.to_vec());
        self
    }

    pub fn with_async(mut self) -> Self {
        self.include_async = true;
        self
    }

    fn allows(&self, plugin: PluginArchetype, phase: PluginArchetype) -> bool {
        match &self.archetype_filter {
            None => true,
            Some(filter) => {
                filter.contains(&plugin)
                    || (plugin == PluginArchetype::HybridService && filter.contains(&phase))
            }
        }
    }

    fn wants_async(&self) -> bool {
        self.include_async
            || self.archetype_filter.as_ref().is_some_and(|f| {
                f.contains(&PluginArchetype::Asynchronous)
                    || f.contains(&PluginArchetype::HybridService)
            })
    }
}

pub struct ExecutionChain {
    registry: Arc<PluginRegistry>,
}

impl ExecutionChain {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, request: ChainRequest) -> ExecutionResult {
        let started = Instant::now();

        if request.request_id.trim().is_empty() {
            return ExecutionResult::failed("Request id cannot be empty", elapsed_ms(started));
        }

        let plugins = self.registry.active_in_priority_order().await;
        debug!(request_id = %request.request_id, plugins = plugins.len(), "Executing chain");

        let mut input = request.input.clone();
        let mut metadata = request.metadata.clone();

        for plugin in &plugins {
            if !request.allows(plugin.instance.archetype(), PluginArchetype::MessagePreprocessor) {
                continue;
            }
            let Some(preprocessor) = plugin.instance.as_preprocessor() else {
                continue;
            };

            let ctx = context_for(&request, plugin, &input, &metadata);
            let step = Instant::now();
            match contain_panic(&plugin.id, preprocessor.preprocess(&ctx)).await {
                Ok(out) => {
                    if let Some(replacement) = out.input {
                        input = replacement;
                    }
                    for (key, value) in out.metadata {
                        metadata.insert(key, value);
                    }
                    metadata.insert(plugin.id.clone(), success_entry(elapsed_ms(step), None));
                }
                Err(e) => {
                    warn!(request_id = %request.request_id, plugin_id = %plugin.id, "Preprocessor failed: {}", e);
                    metadata.insert(plugin.id.clone(), failure_entry(elapsed_ms(step), &e));
                }
            }
        }

        let mut output: Option<Value> = None;

        for plugin in &plugins {
            if !request.allows(plugin.instance.archetype(), PluginArchetype::Synchronous) {
                continue;
            }
            let Some(sync) = plugin.instance.as_synchronous() else {
                continue;
            };

            let ctx = context_for(&request, plugin, &input, &metadata);
            let step = Instant::now();
            match contain_panic(&plugin.id, sync.execute(&ctx)).await {
                Ok(value) => {
                    metadata.insert(
                        plugin.id.clone(),
                        success_entry(elapsed_ms(step), Some(value.clone())),
                    );
                    if output.is_none() {
                        output = Some(value);
                    }
                }
                Err(e) => {
                    warn!(request_id = %request.request_id, plugin_id = %plugin.id, "Synchronous plugin failed: {}", e);
                    metadata.insert(plugin.id.clone(), failure_entry(elapsed_ms(step), &e));
                }
            }
        }

        if request.wants_async() {
            let mut task_ids = Vec::new();
            let mut by_plugin = Map::new();

            for plugin in &plugins {
                if !request.allows(plugin.instance.archetype(), PluginArchetype::Asynchronous) {
                    continue;
                }
                let Some(runner) = plugin.instance.as_asynchronous() else {
                    continue;
                };

                let ctx = context_for(&request, plugin, &input, &metadata);
                let task_id = self.registry.tasks().start(&plugin.id, runner, ctx).await;
                task_ids.push(json!(task_id.to_string()));
                by_plugin.insert(plugin.id.clone(), json!(task_id.to_string()));
            }

            metadata.insert("taskIds".to_string(), Value::Array(task_ids));
            metadata.insert("asyncTasks".to_string(), Value::Object(by_plugin));
            metadata.insert("asyncExecution".to_string(), Value::Bool(true));
        }

        let mut result = ExecutionResult::ok(output, elapsed_ms(started));
        result.metadata = metadata;
        result
    }
}

fn context_for(
    request: &ChainRequest,
    plugin: &RegisteredPlugin,
    input: &Value,
    metadata: &Map<String, Value>,
) -> ExecutionContext {
    ExecutionContext {
        request_id: request.request_id.clone(),
        plugin_id: plugin.id.clone(),
        user_id: request.user_id.clone(),
        session_id: request.session_id.clone(),
        input: input.clone(),
        metadata: metadata.clone(),
    }
}

fn success_entry(execution_time_ms: u64, output: Option<Value>) -> Value {
    let mut entry = json!({
        "success": true,
        "executionTimeMs": execution_time_ms,
    });
    if let (Some(output), Some(map)) = (output, entry.as_object_mut()) {
        map.insert("output".to_string(), output);
    }
    entry
}

fn failure_entry(execution_time_ms: u64, error: &crate::error::KairoError) -> Value {
    json!({
        "success": false,
        "executionTimeMs": execution_time_ms,
        "error": error.to_string(),
    })
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KairoError, KairoResult};
    use crate::plugins::manifest::PluginManifest;
    use crate::plugins::services::ServiceManager;
    use crate::plugins::tasks::AsyncTaskManager;
    use crate::plugins::traits::{MessagePreprocessor, Plugin, PluginInstance, SynchronousPlugin};
    use crate::plugins::types::PreprocessOutput;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Upper;

    #[async_trait]
    impl Plugin for Upper {}

    #[async_trait]
    impl MessagePreprocessor for Upper {
        async fn preprocess(&self, ctx: &ExecutionContext) -> KairoResult<PreprocessOutput> {
            let text = ctx.input.as_str().unwrap_or_default().to_uppercase();
            Ok(PreprocessOutput::replace(json!(text)).with_metadata("normalized", json!(true)))
        }
    }

    enum Behaviour {
        Tag(&'static str),
        Fail,
        Panic,
    }

    struct Step(Behaviour);

    #[async_trait]
    impl Plugin for Step {}

    #[async_trait]
    impl SynchronousPlugin for Step {
        async fn execute(&self, ctx: &ExecutionContext) -> KairoResult<Value> {
            match self.0 {
                Behaviour::Tag(tag) => Ok(json!(format!("{}:{}", tag, ctx.input.as_str().unwrap_or_default()))),
                Behaviour::Fail => Err(KairoError::execution(&ctx.plugin_id, "upstream 503")),
                Behaviour::Panic => panic!("index out of bounds"),
            }
        }
    }

    /// Appends its tag to the input and records the input it saw.
    struct Rewrite(Behaviour);

    #[async_trait]
    impl Plugin for Rewrite {}

    #[async_trait]
    impl MessagePreprocessor for Rewrite {
        async fn preprocess(&self, ctx: &ExecutionContext) -> KairoResult<PreprocessOutput> {
            let seen = ctx.input.as_str().unwrap_or_default().to_string();
            match self.0 {
                Behaviour::Tag(tag) => Ok(PreprocessOutput::replace(json!(format!("{}{}", seen, tag)))
                    .with_metadata(format!("seen{}", tag), json!(seen))),
                Behaviour::Fail => Err(KairoError::execution(&ctx.plugin_id, "tokenizer offline")),
                Behaviour::Panic => panic!("slice index starts at 9"),
            }
        }
    }

    async fn registry_with(plugins: Vec<(&str, i32, PluginInstance)>) -> Arc<PluginRegistry> {
        let registry = Arc::new(PluginRegistry::new(
            Arc::new(AsyncTaskManager::new()),
            Arc::new(ServiceManager::new(
                Duration::from_secs(1),
                Duration::from_secs(1),
            )),
        ));
        for (id, priority, instance) in plugins {
            registry
                .register(PluginManifest::new(id, id, "1.0.0").with_priority(priority), instance)
                .await
                .unwrap();
            registry.activate(id).await.unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_preprocessor_feeds_sync_phase() {
        let registry = registry_with(vec![
            ("upper", 0, PluginInstance::MessagePreprocessor(Arc::new(Upper))),
            ("tagger", 0, PluginInstance::Synchronous(Arc::new(Step(Behaviour::Tag("t"))))),
        ])
        .await;

        let result = ExecutionChain::new(registry)
            .execute(ChainRequest::new("req-1", json!("hello")))
            .await;

        assert!(result.success);
        assert_eq!(result.output, Some(json!("t:HELLO")));
        assert_eq!(result.metadata["normalized"], json!(true));
        assert_eq!(result.metadata["upper"]["success"], json!(true));
    }

    #[tokio::test]
    async fn test_preprocessors_run_in_priority_order() {
        let registry = registry_with(vec![
            ("suffix", 1, PluginInstance::MessagePreprocessor(Arc::new(Rewrite(Behaviour::Tag("!"))))),
            ("broken", 5, PluginInstance::MessagePreprocessor(Arc::new(Rewrite(Behaviour::Fail)))),
            ("prefix", 10, PluginInstance::MessagePreprocessor(Arc::new(Rewrite(Behaviour::Tag("+"))))),
            ("boom", 3, PluginInstance::MessagePreprocessor(Arc::new(Rewrite(Behaviour::Panic)))),
            ("tagger", 0, PluginInstance::Synchronous(Arc::new(Step(Behaviour::Tag("t"))))),
        ])
        .await;

        let result = ExecutionChain::new(registry)
            .execute(ChainRequest::new("req-5", json!("hi")))
            .await;

        assert!(result.success);
        assert_eq!(result.metadata["seen+"], json!("hi"));
        assert_eq!(result.metadata["seen!"], json!("hi+"));
        assert_eq!(result.output, Some(json!("t:hi+!")));

        assert_eq!(result.metadata["prefix"]["success"], json!(true));
        assert_eq!(result.metadata["suffix"]["success"], json!(true));
        assert_eq!(result.metadata["broken"]["success"], json!(false));
        assert!(result.metadata["broken"]["error"]
            .as_str()
            .unwrap()
            .contains("tokenizer offline"));
        assert_eq!(result.metadata["boom"]["success"], json!(false));
    }

    #[tokio::test]
    async fn test_failures_and_panics_are_contained() {
        let registry = registry_with(vec![
            ("failing", 10, PluginInstance::Synchronous(Arc::new(Step(Behaviour::Fail)))),
            ("panicky", 5, PluginInstance::Synchronous(Arc::new(Step(Behaviour::Panic)))),
            ("steady", 1, PluginInstance::Synchronous(Arc::new(Step(Behaviour::Tag("ok"))))),
        ])
        .await;

        let result = ExecutionChain::new(registry)
            .execute(ChainRequest::new("req-2", json!("x")))
            .await;

        assert!(result.success);
        assert_eq!(result.output, Some(json!("ok:x")));
        assert_eq!(result.metadata["failing"]["success"], json!(false));
        assert!(result.metadata["failing"]["error"]
            .as_str()
            .unwrap()
            .contains("upstream 503"));
        assert_eq!(result.metadata["panicky"]["success"], json!(false));
    }

    #[tokio::test]
    async fn test_filter_skips_other_phases() {
        let registry = registry_with(vec![
            ("upper", 0, PluginInstance::MessagePreprocessor(Arc::new(Upper))),
            ("tagger", 0, PluginInstance::Synchronous(Arc::new(Step(Behaviour::Tag("t"))))),
        ])
        .await;

        let result = ExecutionChain::new(registry)
            .execute(ChainRequest::new("req-3", json!("hi")).only(&[PluginArchetype::Synchronous]))
            .await;

        assert_eq!(result.output, Some(json!("t:hi")));
        assert!(result.metadata.get("upper").is_none());
        assert!(result.metadata.get("asyncExecution").is_none());
    }

    #[tokio::test]
    async fn test_empty_request_id_fails() {
        let registry = registry_with(vec![]).await;
        let result = ExecutionChain::new(registry)
            .execute(ChainRequest::new("  ", json!(null)))
            .await;
        assert!(!result.success);
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn test_inactive_plugins_are_skipped() {
        let registry = registry_with(vec![(
            "tagger",
            0,
            PluginInstance::Synchronous(Arc::new(Step(Behaviour::Tag("t")))),
        )])
        .await;
        registry.disable("tagger").await.unwrap();

        let result = ExecutionChain::new(registry)
            .execute(ChainRequest::new("req-4", json!("hi")))
            .await;
        assert!(result.success);
        assert!(result.output.is_none());
        assert!(result.metadata.get("tagger").is_none());
    }
}
