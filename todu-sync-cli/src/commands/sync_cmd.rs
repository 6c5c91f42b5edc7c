//! Sync CLI commands: drain the queue now, or report sync health.

use clap::{Args, Subcommand};
use todu_sync_core::{check_server, SyncCoordinator, SyncError};

use crate::config::Config;
use crate::sync::{http_backend, pull, push, report, SyncOutcome, SYNC_TIMEOUT};

/// Sync with the server
#[derive(Debug, Args)]
pub struct SyncCommand {
    #[command(subcommand)]
    pub command: Option<SyncSubcommand>,
}

#[derive(Debug, Subcommand)]
pub enum SyncSubcommand {
    /// Show sync configuration, server status and queue health
    Status,
}

impl SyncCommand {
    pub fn run(&self, coordinator: &SyncCoordinator, config: &Config) -> Result<(), SyncCommandError> {
        let rt = tokio::runtime::Runtime::new()
            .map_err(|e| SyncCommandError::RuntimeError(e.to_string()))?;

        match &self.command {
            None => rt.block_on(self.sync(coordinator, config)),
            Some(SyncSubcommand::Status) => rt.block_on(self.status(coordinator, config)),
        }
    }

    async fn sync(&self, coordinator: &SyncCoordinator, config: &Config) -> Result<(), SyncCommandError> {
        let (Some(url), Some(backend)) = (config.sync.server_url.as_ref(), http_backend(&config.sync))
        else {
            return Err(SyncCommandError::NotConfigured);
        };

        let mut events = coordinator.subscribe_events();
        println!("Syncing with {}...", url);

        let outcome = push(coordinator, url, SYNC_TIMEOUT).await?;
        let pulled = match outcome {
            SyncOutcome::Unreachable => 0,
            _ => pull(coordinator, &backend).await?,
        };

        let events = report::collect(&mut events);
        if !events.is_empty() {
            println!();
            report::print_events(&events);
        }
        println!();

        let pending = coordinator.queue().len();
        let conflicts = coordinator.conflicts().len();
        match outcome {
            SyncOutcome::Unreachable => {
                println!("Server unreachable. {} change(s) saved locally.", pending);
            }
            SyncOutcome::TimedOut => {
                println!(
                    "Server kept failing; {} change(s) will be retried on the next sync.",
                    pending
                );
            }
            SyncOutcome::Settled(session) => {
                if pulled > 0 {
                    println!("Pulled {} updated record(s).", pulled);
                }
                if pending == 0 && conflicts == 0 {
                    println!("Sync complete.");
                } else {
                    println!(
                        "{} change(s) pending, {} conflict(s) need attention.",
                        pending, conflicts
                    );
                    if let Some(error) = session.last_error {
                        println!("Last error: {}", error);
                    }
                }
            }
        }
        Ok(())
    }

    async fn status(&self, coordinator: &SyncCoordinator, config: &Config) -> Result<(), SyncCommandError> {
        println!("Sync Configuration");
        println!("==================");
        println!();

        let pending = coordinator.queue().len();
        let stalled = coordinator
            .queue()
            .stalled(coordinator.options().retry.max_attempts)
            .len();
        let conflicts = coordinator.conflicts().len();

        match &config.sync.server_url {
            Some(url) if config.sync.is_configured() => {
                println!("Server:    {}", url);
                println!(
                    "Auto-sync: {}",
                    if config.sync.auto_sync {
                        "enabled"
                    } else {
                        "disabled"
                    }
                );
                print!("Status:    ");
                if check_server(url).await {
                    println!("✓ connected");
                } else {
                    println!("✗ unreachable");
                }
            }
            _ => {
                println!("Status: Not configured");
                println!();
                println!("To enable sync, add to your config file:");
                println!();
                println!("  sync:");
                println!("    server_url: \"http://localhost:8080\"");
                println!("    api_key: \"<key>\"");
                println!();
                println!("Or set environment variables:");
                println!("  FIT_SYNC_URL, FIT_SYNC_API_KEY");
            }
        }

        println!();
        println!("Pending edits: {}", pending);
        if stalled > 0 {
            println!("Stalled:       {} (run 'fit-sync queue retry <edit-id>')", stalled);
        }
        println!("Conflicts:     {}", conflicts);
        Ok(())
    }
}

/// Errors from sync commands
#[derive(Debug)]
pub enum SyncCommandError {
    NotConfigured,
    Core(SyncError),
    RuntimeError(String),
}

impl std::fmt::Display for SyncCommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncCommandError::NotConfigured => write!(
                f,
                "Sync is not configured. Set sync.server_url and sync.api_key in the config file."
            ),
            SyncCommandError::Core(e) => write!(f, "{}", e),
            SyncCommandError::RuntimeError(e) => write!(f, "Runtime error: {}", e),
        }
    }
}

impl std::error::Error for SyncCommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SyncCommandError::Core(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SyncError> for SyncCommandError {
    fn from(e: SyncError) -> Self {
        SyncCommandError::Core(e)
    }
}
