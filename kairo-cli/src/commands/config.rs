use clap::Subcommand;
use colored::Colorize;
use kairo_core::{get_config_dir, KairoConfig};

#[derive(Subcommand)]
pub enum ConfigCommand {
    #[command(about = "Print the effective configuration as JSON")]
    Show,

    #[command(about = "Print the user configuration directory")]
    Path,
}

pub fn handle_config_command(cmd: Option<ConfigCommand>, config: &KairoConfig) -> anyhow::Result<()> {
    match cmd.unwrap_or(ConfigCommand::Show) {
        ConfigCommand::Show => {
            println!("{}", serde_json::to_string_pretty(config)?);
            Ok(())
        }
        ConfigCommand::Path => {
            match get_config_dir() {
                Some(dir) => println!("{}", dir.join("config.toml").display()),
                None => println!("{}", "No configuration directory on this platform.".yellow()),
            }
            Ok(())
        }
    }
}
