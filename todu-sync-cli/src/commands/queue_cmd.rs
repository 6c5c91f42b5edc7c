use clap::{Args, Subcommand};
use todu_sync_core::{Edit, SyncCoordinator};
use uuid::Uuid;

use super::OutputFormat;

/// Inspect and manage pending edits
#[derive(Args)]
pub struct QueueCommand {
    #[command(subcommand)]
    pub command: QueueSubcommand,
}

#[derive(Subcommand)]
pub enum QueueSubcommand {
    /// List edits waiting to sync, oldest first
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Cancel a pending edit
    Discard {
        /// Edit ID (UUID)
        edit_id: String,
    },

    /// Retry an edit that ran out of attempts
    Retry {
        /// Edit ID (UUID)
        edit_id: String,
    },
}

impl QueueCommand {
    pub fn run(&self, coordinator: &SyncCoordinator) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            QueueSubcommand::List { format } => {
                let edits = coordinator.queue().snapshot();
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&edits)?);
                    }
                    OutputFormat::Text => {
                        if edits.is_empty() {
                            println!("Nothing waiting to sync.");
                            return Ok(());
                        }
                        let max_attempts = coordinator.options().retry.max_attempts;
                        for edit in &edits {
                            println!("{}", queue_line(edit, max_attempts));
                        }
                        println!("\n{} edit(s) pending", edits.len());
                    }
                }
                Ok(())
            }

            QueueSubcommand::Discard { edit_id } => {
                let edit = coordinator.discard(parse_edit_id(edit_id)?)?;
                println!("Discarded {} of {}", edit.op, edit.record_id);
                Ok(())
            }

            QueueSubcommand::Retry { edit_id } => {
                let edit = coordinator.force_retry(parse_edit_id(edit_id)?)?;
                println!("Queued {} of {} for retry", edit.op, edit.record_id);
                Ok(())
            }
        }
    }
}

pub fn parse_edit_id(s: &str) -> Result<Uuid, String> {
    Uuid::parse_str(s.trim()).map_err(|_| format!("Invalid edit id '{}'", s))
}

fn queue_line(edit: &Edit, max_attempts: u32) -> String {
    let mut line = format!(
        "{}  {:<8} {:<24} base v{}",
        edit.edit_id,
        edit.op.to_string(),
        edit.record_id.as_str(),
        edit.base_version
    );
    if edit.attempt_count > 0 {
        line.push_str(&format!("  attempts {}", edit.attempt_count));
    }
    if edit.attempt_count >= max_attempts {
        line.push_str("  (stalled)");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use todu_sync_core::{
        EntityKind, Fields, KeyValueStore, ManualClock, MemoryBackend, MemoryStore, SyncOptions,
    };

    fn coordinator() -> SyncCoordinator {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let options = SyncOptions {
            start_online: false,
            ..SyncOptions::default()
        };
        SyncCoordinator::open(
            store,
            Arc::new(MemoryBackend::new()),
            Arc::new(ManualClock::default()),
            options,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_edit_id() {
        let id = Uuid::new_v4();
        assert_eq!(parse_edit_id(&id.to_string()).unwrap(), id);
        assert!(parse_edit_id("not-a-uuid").is_err());
    }

    #[test]
    fn test_queue_line_marks_stalled_edits() {
        let mut edit = Edit::delete("gi-milk", EntityKind::GroceryItem, 2);
        assert!(!queue_line(&edit, 5).contains("attempts"));

        edit.attempt_count = 5;
        let line = queue_line(&edit, 5);
        assert!(line.contains("delete"));
        assert!(line.contains("base v2"));
        assert!(line.ends_with("attempts 5  (stalled)"));
    }

    #[test]
    fn test_discard_rolls_back_local_state() {
        let coordinator = coordinator();
        let edit = coordinator
            .create("gi-milk", EntityKind::GroceryItem, Fields::new())
            .unwrap();

        QueueCommand {
            command: QueueSubcommand::Discard {
                edit_id: edit.edit_id.to_string(),
            },
        }
        .run(&coordinator)
        .unwrap();

        assert!(coordinator.queue().is_empty());
        assert!(coordinator
            .state()
            .get_visible_state(&"gi-milk".into())
            .is_none());
    }

    #[test]
    fn test_retry_unknown_edit_fails() {
        let coordinator = coordinator();
        let result = QueueCommand {
            command: QueueSubcommand::Retry {
                edit_id: Uuid::new_v4().to_string(),
            },
        }
        .run(&coordinator);
        assert!(result.unwrap_err().to_string().contains("no pending edit"));
    }
}
