mod chain;
mod guard;
mod loader;
mod manifest;
mod registry;
mod sandbox;
mod services;
mod tasks;
mod traits;
mod types;

pub use chain::{ChainRequest, ExecutionChain};

pub use loader::{
    discover_manifests, load_order, read_manifests, Activation, BatchLoad, DispatchReport,
    LoadOutcome, PluginLoader,
};

pub use manifest::{
    is_valid_plugin_id, ContributionDescriptor, PluginManifest, TOOLS_POINT, WILDCARD_EVENT,
};

pub use registry::{PluginRegistry, RegisteredPlugin, UnregisterReport};

pub use sandbox::{
    CapabilityAllowList, GuestLog, PluginArtifact, SandboxAction, SandboxHarness, SandboxReport,
    ToolInvocation, GRANT_ALL, SAFE_PATH,
};

pub use services::ServiceManager;

pub use tasks::{AsyncTaskManager, TaskSummary};

pub use traits::{
    AsynchronousPlugin, HybridService, MessagePreprocessor, Plugin, PluginFactory,
    PluginInstance, ServicePlugin, SynchronousPlugin,
};

pub use types::{
    ExecutionContext, ExecutionResult, HealthStatus, PluginArchetype, PluginConfig,
    PluginConfigPatch, PluginContext, PluginInfo, PluginLogger, PluginStatus, PreprocessOutput,
    RegistryStats, ServiceHealth,
};
