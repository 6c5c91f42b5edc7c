use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod sync;

use commands::{
    ConfigCommand, ConflictsCommand, ConflictsSubcommand, EditCommand, QueueCommand,
    QueueSubcommand, ShowCommand, SyncCommand,
};
use config::Config;
use sync::{open_coordinator, try_auto_sync};

#[derive(Parser)]
#[command(name = "fit-sync")]
#[command(version)]
#[command(about = "Offline-first edits for Todu Fit, synced when the server is reachable", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, update, toggle or delete a record
    Edit(EditCommand),

    /// Show records and their sync status
    Show(ShowCommand),

    /// Inspect the queue of pending edits
    Queue(QueueCommand),

    /// Review and resolve conflicts
    Conflicts(ConflictsCommand),

    /// Sync with the server now
    Sync(SyncCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "todu_sync=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let cli_config_path = cli.config.clone();
    let config = Config::load(cli.config)?;

    if is_read_command(&cli.command) {
        try_auto_sync(&config);
    }

    let result = execute_command(&cli.command, &config, cli_config_path);

    if result.is_ok() && is_write_command(&cli.command) {
        try_auto_sync(&config);
    }

    result
}

fn execute_command(
    command: &Option<Commands>,
    config: &Config,
    cli_config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Some(Commands::Edit(cmd)) => {
            let coordinator = open_coordinator(config)?;
            cmd.run(&coordinator)?;
        }
        Some(Commands::Show(cmd)) => {
            let coordinator = open_coordinator(config)?;
            cmd.run(&coordinator, config)?;
        }
        Some(Commands::Queue(cmd)) => {
            let coordinator = open_coordinator(config)?;
            cmd.run(&coordinator)?;
        }
        Some(Commands::Conflicts(cmd)) => {
            let coordinator = open_coordinator(config)?;
            cmd.run(&coordinator)?;
        }
        Some(Commands::Sync(cmd)) => {
            let coordinator = open_coordinator(config)?;
            cmd.run(&coordinator, config)?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(config, cli_config_path)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}

/// Commands that read local state and sync before running.
fn is_read_command(cmd: &Option<Commands>) -> bool {
    matches!(cmd, Some(Commands::Show(s)) if !s.refresh)
        || matches!(
            cmd,
            Some(Commands::Queue(q)) if matches!(q.command, QueueSubcommand::List { .. })
        )
        || matches!(
            cmd,
            Some(Commands::Conflicts(c)) if matches!(c.command, ConflictsSubcommand::List { .. })
        )
}

/// Commands that change the queue and sync after succeeding.
fn is_write_command(cmd: &Option<Commands>) -> bool {
    matches!(cmd, Some(Commands::Edit(_)))
        || matches!(
            cmd,
            Some(Commands::Queue(q)) if matches!(q.command,
                QueueSubcommand::Discard { .. } | QueueSubcommand::Retry { .. })
        )
        || matches!(
            cmd,
            Some(Commands::Conflicts(c)) if matches!(c.command, ConflictsSubcommand::Resolve { .. })
        )
}
