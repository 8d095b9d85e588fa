use clap::{Parser, Subcommand};
use colored::Colorize;
use kairo_core::{init_tracing, CliErrorDisplay, KairoConfig, KairoError, LoggingConfig};
use std::process::ExitCode;

mod commands;

use commands::{
    handle_config_command, handle_manifest_command, handle_sandbox_command, ConfigCommand,
    ManifestCommand, SandboxCommand,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "kairo")]
#[command(version = VERSION)]
#[command(about = "Kairo - plugin runtime and sandboxed plugin validation")]
#[command(long_about = r#"
Kairo hosts pluggable units of behaviour and validates untrusted plugins in a
sandboxed child process before they are trusted into a live registry.

Use 'kairo manifest validate <file>' to check a manifest, and
'kairo sandbox activate <program>' to run a plugin's activation in a sandbox.
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Validate and inspect plugin manifests")]
    Manifest {
        #[command(subcommand)]
        action: ManifestCommand,
    },

    #[command(about = "Run plugin activations and tools in a sandbox")]
    Sandbox {
        #[command(subcommand)]
        action: SandboxCommand,
    },

    #[command(about = "Inspect the effective configuration")]
    Config {
        #[command(subcommand)]
        action: Option<ConfigCommand>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match KairoConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprint!("{}: {}", "Error".red().bold(), CliErrorDisplay::new(&e));
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    match run(cli, config).await {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<KairoError>() {
                Some(kairo) => eprint!("{}: {}", "Error".red().bold(), CliErrorDisplay::new(kairo)),
                None => eprintln!("{}: {}", "Error".red().bold(), e),
            }
            ExitCode::FAILURE
        }
    }
}

/// The configured logging settings, with `--verbose` forcing debug output.
fn logging_for(config: &KairoConfig, verbose: bool) -> LoggingConfig {
    let mut logging = config.logging.clone();
    if verbose {
        logging.level = "debug".to_string();
    }
    logging
}

fn init_logging(config: &KairoConfig, verbose: bool) {
    if let Err(e) = init_tracing(&logging_for(config, verbose)) {
        eprintln!("{}: {}", "Warning".yellow().bold(), e);
    }
}

async fn run(cli: Cli, config: KairoConfig) -> anyhow::Result<()> {
    match cli.command {
        Commands::Manifest { action } => handle_manifest_command(action).await,
        Commands::Sandbox { action } => handle_sandbox_command(action, &config).await,
        Commands::Config { action } => handle_config_command(action, &config),
    }
}
