use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use signcast_node::config::Config;
use signcast_node::context::NodeState;
use signcast_node::models::Program;
use signcast_node::program_store::ProgramStore;
use signcast_node::repetition::UNLIMITED;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Parser)]
#[command(version, author = "SIGNCAST AUTHORS", about = "Signcast Node\nLicensed under AGPLv3\nCreated by SIGNCAST AUTHORS", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Generate a default configuration template to stdout
    #[arg(long)]
    generate_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the playback scheduler (default)
    Run,
    /// Print a condensed status of stored programs and statistics
    Status,
    /// Print repetition and reproduction statistics as JSON
    Stats,
    /// Set the daily play limit of a content item
    SetLimit {
        content_id: String,
        limit: i64,
        /// Keep the limit on record but do not enforce it
        #[arg(long)]
        unlimited: bool,
    },
    /// Remove the repetition record of a content item
    ClearLimit { content_id: String },
    /// Write reproduction statistics to a JSON file
    ExportStats { file: String },
    /// Replace reproduction statistics from a JSON file
    ImportStats { file: String },
    /// Clear repetition and reproduction statistics
    ClearStats,
    /// Write all programs to a JSON backup file
    ExportPrograms { file: String },
    /// Replace all programs from a JSON backup file
    ImportPrograms { file: String },
}

fn run_onboarding(path: &str) -> Result<()> {
    use dialoguer::{theme::ColorfulTheme, Confirm, Input};

    println!("Welcome to Signcast Node!");
    println!("It looks like you don't have a configuration file yet.");
    println!("Let's get you set up.\n");

    let node_name: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Node name")
        .default("Local".to_string())
        .interact_text()?;

    let data_dir: String = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Data directory")
        .default("data".to_string())
        .interact_text()?;

    let playback_secs: u64 = Input::with_theme(&ColorfulTheme::default())
        .with_prompt("Seconds per content item")
        .default(8)
        .validate_with(|secs: &u64| {
            if *secs > 0 {
                Ok(())
            } else {
                Err("must be at least 1 second")
            }
        })
        .interact_text()?;

    let diagnostics = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt("Enable diagnostics monitor?")
        .default(false)
        .interact()?;

    let config = Config {
        node_name,
        data_dir,
        playback_interval_ms: playback_secs * 1000,
        diagnostics,
        ..Config::default()
    };

    println!("\nGenerating configuration file: {}", path);
    std::fs::write(path, toml::to_string(&config)?)?;
    println!("Configuration saved successfully!");
    println!("----------------------------------------\n");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.generate_config {
        println!("{}", Config::default_template());
        return Ok(());
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    if std::fs::metadata(&config_path).is_err() {
        if cli.config.is_none() && console::user_attended() {
            if let Err(e) = run_onboarding(&config_path) {
                eprintln!("Onboarding failed: {}", e);
                std::process::exit(1);
            }
        } else {
            eprintln!("Error: Configuration file '{}' not found.", config_path);
            eprintln!("Run with --generate-config to see a template.");
            std::process::exit(1);
        }
    }

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load {}", config_path))?;

    // Initialize tracing
    let fallback_filter = format!("signcast_node={}", config.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| fallback_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Loaded configuration for node: {}", config.node_name);

    let state = NodeState::from_config(config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(state).await?,
        Command::Status => print_status(&state)?,
        Command::Stats => {
            let stats = serde_json::json!({
                "repetitions": state.ledger.all_stats(),
                "reproductions": state.telemetry.get_stats(),
                "global": state.telemetry.get_global_stats(),
            });
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::SetLimit {
            content_id,
            limit,
            unlimited,
        } => {
            state
                .ledger
                .set_daily_limit(&content_id, limit, unlimited || limit == UNLIMITED);
        }
        Command::ClearLimit { content_id } => state.ledger.clear_content_data(&content_id),
        Command::ExportStats { file } => {
            std::fs::write(&file, state.telemetry.export_stats()?)?;
            println!("Statistics exported to {}", file);
        }
        Command::ImportStats { file } => {
            let data = std::fs::read_to_string(&file)?;
            if !state.telemetry.import_stats(&data) {
                anyhow::bail!("{} is not a valid statistics export", file);
            }
            println!("Statistics imported from {}", file);
        }
        Command::ClearStats => {
            state.ledger.clear_all_data();
            state.telemetry.reset_stats();
            println!("Statistics cleared");
        }
        Command::ExportPrograms { file } => {
            std::fs::write(&file, state.program_store.export_data()?)?;
            println!("Programs exported to {}", file);
        }
        Command::ImportPrograms { file } => {
            let data = std::fs::read_to_string(&file)?;
            if !state.program_store.import_data(&data).await {
                anyhow::bail!("{} is not a valid program backup", file);
            }
            println!("Programs imported from {}", file);
        }
    }

    Ok(())
}

async fn run(state: NodeState) -> Result<()> {
    let programs = load_programs(&state).await;
    state.controller.initialize_with_programs(programs.clone());

    let cancel = CancellationToken::new();
    let autosave = state
        .telemetry
        .spawn_autosave(state.config.telemetry_autosave(), cancel.clone());
    let poller = tokio::spawn(poll_programs(state.clone(), programs, cancel.clone()));

    if let Some(diagnostics) = &state.diagnostics {
        diagnostics.start_monitoring(state.config.monitor_interval());
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    if let Some(diagnostics) = &state.diagnostics {
        diagnostics.stop_monitoring();
        tracing::info!("Final statistics:\n{}", diagnostics.full_report());
    }
    state.controller.stop_global_playback();
    cancel.cancel();

    if let Err(e) = poller.await {
        tracing::error!("Program poller failed: {}", e);
    }
    if let Err(e) = autosave.await {
        tracing::error!("Autosave task failed: {}", e);
    }
    Ok(())
}

async fn load_programs(state: &NodeState) -> Vec<Program> {
    match state.program_store.get_programs().await {
        Ok(programs) => programs,
        Err(e) => {
            tracing::error!("Failed to load programs: {}", e);
            Vec::new()
        }
    }
}

/// Rebuilds playback whenever the stored program set changes.
async fn poll_programs(state: NodeState, mut current: Vec<Program>, cancel: CancellationToken) {
    let mut tick = interval(state.config.program_poll_interval());
    tick.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                let latest = match state.program_store.get_programs().await {
                    Ok(programs) => programs,
                    Err(e) => {
                        tracing::error!("Failed to poll programs: {}", e);
                        continue;
                    }
                };

                if latest != current {
                    tracing::info!("Programs changed ({} stored)", latest.len());
                    state.controller.update_programs(latest.clone());
                    current = latest;
                }
            }
        }
    }
}

fn print_status(state: &NodeState) -> Result<()> {
    let info = state.program_store.storage_info()?;
    let summary = state.ledger.summary();
    let global = state.telemetry.get_global_stats();

    println!("Node: {}", state.config.node_name);
    println!(
        "Programs: {} ({}), last modified {}",
        info.total_programs,
        info.size_kb(),
        info.last_modified
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".to_string())
    );
    println!(
        "Repetition records: {} ({} active today, {} at limit)",
        summary.total_contents, summary.active_today, summary.completed_today
    );
    println!(
        "Reproductions: {} across {} content item(s) in {} program(s)",
        global.total_reproductions, global.total_content, global.total_programs
    );
    for top in &global.top_content {
        println!("  {} ({}): {}", top.name, top.content_type, top.reproductions);
    }
    println!("Playback speed: {:?}", state.config.playback_interval());
    Ok(())
}
