use clap::{Args, Subcommand};
use colored::Colorize;
use comfy_table::{modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Cell, Color, Table};
use kairo_core::plugins::{CapabilityAllowList, GuestLog, PluginArtifact, SandboxHarness};
use kairo_core::KairoConfig;
use std::time::Duration;

#[derive(Args)]
pub struct SessionArgs {
    #[arg(long, help = "Wall-clock budget for the session in milliseconds")]
    timeout_ms: Option<u64>,

    #[arg(long = "allow", help = "Grant an extra capability (repeatable)")]
    allow: Vec<String>,

    #[arg(
        short,
        long,
        default_value = "text",
        help = "Output format (text, json)"
    )]
    format: String,

    #[arg(help = "Program that hosts the plugin")]
    program: String,

    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        help = "Arguments passed to the program"
    )]
    args: Vec<String>,
}

#[derive(Subcommand)]
pub enum SandboxCommand {
    #[command(about = "Run a plugin's activation in a sandbox and validate its manifest")]
    Activate {
        #[command(flatten)]
        session: SessionArgs,
    },

    #[command(about = "Invoke one tool of a plugin in a sandbox")]
    Invoke {
        #[arg(long, help = "Tool id to invoke")]
        tool: String,

        #[arg(long, default_value = "{}", help = "Tool input as JSON")]
        input: String,

        #[command(flatten)]
        session: SessionArgs,
    },
}

pub async fn handle_sandbox_command(
    cmd: SandboxCommand,
    config: &KairoConfig,
) -> anyhow::Result<()> {
    match cmd {
        SandboxCommand::Activate { session } => cmd_sandbox_activate(&session, config).await,
        SandboxCommand::Invoke {
            tool,
            input,
            session,
        } => cmd_sandbox_invoke(&session, &tool, &input, config).await,
    }
}

fn build_harness(session: &SessionArgs, config: &KairoConfig) -> SandboxHarness {
    let mut harness = SandboxHarness::new(&config.sandbox);

    if let Some(timeout_ms) = session.timeout_ms {
        harness = harness.with_timeout(Duration::from_millis(timeout_ms));
    }

    if !session.allow.is_empty() {
        let mut allow_list = CapabilityAllowList::new(config.sandbox.allowed_modules.clone());
        for capability in &session.allow {
            allow_list.grant(capability.clone());
        }
        harness = harness.with_allow_list(allow_list);
    }

    harness
}

fn artifact(session: &SessionArgs) -> PluginArtifact {
    PluginArtifact::new(&session.program).args(session.args.iter().cloned())
}

async fn cmd_sandbox_activate(session: &SessionArgs, config: &KairoConfig) -> anyhow::Result<()> {
    let harness = build_harness(session, config);
    let report = harness.validate_activation(&artifact(session)).await?;

    if session.format == "json" {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} Activation of {} validated in {} ms",
        "✓".green().bold(),
        report.manifest.id.bold(),
        report.execution_time_ms
    );
    println!("  {} {}", "Sandbox:".dimmed(), report.sandbox_id);
    println!(
        "  {} {}",
        "Granted:".dimmed(),
        if report.granted.is_empty() {
            "-".to_string()
        } else {
            report.granted.join(", ")
        }
    );

    let tools = report.manifest.tools();
    if !tools.is_empty() {
        println!();
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![
                Cell::new("Tool").fg(Color::White),
                Cell::new("Name").fg(Color::White),
                Cell::new("Handle").fg(Color::White),
            ]);
        for tool in tools {
            table.add_row(vec![
                Cell::new(&tool.id).fg(Color::Cyan),
                Cell::new(tool.name.as_deref().unwrap_or("-")),
                Cell::new(&tool.handle).fg(Color::DarkGrey),
            ]);
        }
        println!("{table}");
    }

    print_logs(&report.logs);
    Ok(())
}

async fn cmd_sandbox_invoke(
    session: &SessionArgs,
    tool: &str,
    input: &str,
    config: &KairoConfig,
) -> anyhow::Result<()> {
    let input: serde_json::Value = serde_json::from_str(input)
        .map_err(|e| anyhow::anyhow!("--input is not valid JSON: {}", e))?;

    let harness = build_harness(session, config);
    let invocation = harness.invoke_tool(&artifact(session), tool, input).await?;

    if session.format == "json" {
        println!("{}", serde_json::to_string_pretty(&invocation)?);
        return Ok(());
    }

    println!(
        "{} {} returned in {} ms",
        "✓".green().bold(),
        invocation.tool.bold(),
        invocation.execution_time_ms
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&invocation.output)?);

    print_logs(&invocation.logs);
    Ok(())
}

fn print_logs(logs: &[GuestLog]) {
    if logs.is_empty() {
        return;
    }

    println!();
    println!("{}", "Guest log".cyan().bold());
    for log in logs {
        let level = match log.level.as_str() {
            "error" => log.level.red(),
            "warn" => log.level.yellow(),
            "debug" | "trace" => log.level.dimmed(),
            _ => log.level.normal(),
        };
        println!("  [{}] {}", level, log.message);
    }
}
