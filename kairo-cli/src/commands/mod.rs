pub mod config;
pub mod manifest;
pub mod sandbox;

pub use config::{handle_config_command, ConfigCommand};
pub use manifest::{handle_manifest_command, ManifestCommand};
pub use sandbox::{handle_sandbox_command, SandboxCommand};
