mod config_cmd;
mod conflicts;
mod edit;
mod queue_cmd;
mod show;
mod sync_cmd;

use clap::ValueEnum;

pub use config_cmd::ConfigCommand;
pub use conflicts::{ConflictsCommand, ConflictsSubcommand};
pub use edit::{EditCommand, EditSubcommand};
pub use queue_cmd::{QueueCommand, QueueSubcommand};
pub use show::ShowCommand;
pub use sync_cmd::{SyncCommand, SyncSubcommand};

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}
