pub mod config;
pub mod error;
pub mod logging;
pub mod plugins;
pub mod runtime;

pub use config::{
    get_config_dir, KairoConfig, LoggingConfig, ResourceLimits, RuntimeConfig, SandboxSettings,
};
pub use error::{CleanupError, CleanupStage, CliErrorDisplay, KairoError, KairoResult};
pub use logging::init_tracing;
pub use plugins::{
    AsynchronousPlugin, CapabilityAllowList, ChainRequest, ContributionDescriptor,
    ExecutionContext, ExecutionResult, HealthStatus, HybridService, MessagePreprocessor, Plugin,
    PluginArchetype, PluginArtifact, PluginConfig, PluginConfigPatch, PluginContext,
    PluginFactory, PluginInfo, PluginInstance, PluginManifest, PluginStatus, PreprocessOutput,
    RegistryStats, SandboxAction, SandboxHarness, ServiceHealth, ServicePlugin,
    SynchronousPlugin, UnregisterReport,
};
pub use runtime::PluginRuntime;
