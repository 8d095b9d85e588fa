use clap::Subcommand;
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use kairo_core::plugins::{load_order, read_manifests, PluginManifest};
use std::path::{Path, PathBuf};

#[derive(Subcommand)]
pub enum ManifestCommand {
    #[command(about = "Parse and validate a manifest (JSON or TOML)")]
    Validate {
        #[arg(help = "Path to kairo-plugin.json or kairo-plugin.toml")]
        file: PathBuf,

        #[arg(
            short,
            long,
            default_value = "text",
            help = "Output format (text, json)"
        )]
        format: String,
    },

    #[command(about = "Discover manifests one level below a directory and print their load order")]
    Scan {
        #[arg(help = "Directory containing one subdirectory per plugin")]
        dir: PathBuf,
    },
}

pub async fn handle_manifest_command(cmd: ManifestCommand) -> anyhow::Result<()> {
    match cmd {
        ManifestCommand::Validate { file, format } => cmd_manifest_validate(&file, &format).await,
        ManifestCommand::Scan { dir } => cmd_manifest_scan(&dir).await,
    }
}

async fn cmd_manifest_validate(file: &Path, format: &str) -> anyhow::Result<()> {
    let outcome = match PluginManifest::load_from_file(file).await {
        Ok(manifest) => manifest.validate().map(|_| manifest),
        Err(e) => Err(e),
    };

    if format == "json" {
        let output = match &outcome {
            Ok(manifest) => serde_json::json!({ "valid": true, "manifest": manifest }),
            Err(e) => serde_json::json!({
                "valid": false,
                "code": e.error_code(),
                "error": e.to_string(),
            }),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return outcome.map(|_| ()).map_err(Into::into);
    }

    let manifest = outcome?;

    println!(
        "{} {} {}",
        "✓".green().bold(),
        manifest.id.bold(),
        format!("v{}", manifest.version).dimmed()
    );
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Field").fg(Color::White),
            Cell::new("Value").fg(Color::White),
        ]);

    let activation = if manifest.activates_eagerly() {
        "immediate".to_string()
    } else {
        manifest.activation_events.join(", ")
    };

    table.add_row(vec![Cell::new("Name"), Cell::new(&manifest.name)]);
    if !manifest.description.is_empty() {
        table.add_row(vec![Cell::new("Description"), Cell::new(&manifest.description)]);
    }
    if !manifest.author.is_empty() {
        table.add_row(vec![Cell::new("Author"), Cell::new(&manifest.author)]);
    }
    table.add_row(vec![Cell::new("Priority"), Cell::new(manifest.priority)]);
    table.add_row(vec![
        Cell::new("Archetype"),
        Cell::new(
            manifest
                .archetype
                .map(|a| a.to_string())
                .unwrap_or_else(|| "-".to_string()),
        ),
    ]);
    table.add_row(vec![Cell::new("Activation"), Cell::new(activation)]);
    table.add_row(vec![
        Cell::new("Dependencies"),
        Cell::new(if manifest.dependencies.is_empty() {
            "-".to_string()
        } else {
            manifest.dependencies.join(", ")
        }),
    ]);
    println!("{table}");

    if manifest.contributions.is_empty() {
        return Ok(());
    }

    println!();
    println!("{}", "Contributions".cyan().bold());

    let mut contributions = Table::new();
    contributions
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Point").fg(Color::White),
            Cell::new("ID").fg(Color::White),
            Cell::new("Name").fg(Color::White),
            Cell::new("Handle").fg(Color::White),
        ]);

    for (point, descriptors) in &manifest.contributions {
        for descriptor in descriptors {
            contributions.add_row(vec![
                Cell::new(point).fg(Color::Cyan),
                Cell::new(&descriptor.id),
                Cell::new(descriptor.name.as_deref().unwrap_or("-")),
                Cell::new(&descriptor.handle).fg(Color::DarkGrey),
            ]);
        }
    }
    println!("{contributions}");

    Ok(())
}

async fn cmd_manifest_scan(dir: &Path) -> anyhow::Result<()> {
    let manifests = read_manifests(dir).await?;

    if manifests.is_empty() {
        println!("{}", "No plugin manifests found.".yellow());
        return Ok(());
    }

    let order = load_order(&manifests)?;

    println!("{}", "Load order".cyan().bold());
    println!();

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("#").fg(Color::White),
            Cell::new("Plugin").fg(Color::White),
            Cell::new("Depends on").fg(Color::White),
            Cell::new("Status").fg(Color::White),
        ]);

    for (position, id) in order.iter().enumerate() {
        let Some(manifest) = manifests.iter().find(|m| &m.id == id) else {
            continue;
        };
        let status = match manifest.validate() {
            Ok(()) => Cell::new("valid").fg(Color::Green),
            Err(e) => Cell::new(e.to_string()).fg(Color::Red),
        };
        table.add_row(vec![
            Cell::new(position + 1),
            Cell::new(id),
            Cell::new(manifest.dependencies.join(", ")),
            status,
        ]);
    }
    println!("{table}");

    Ok(())
}
