use clap::{Args, Subcommand};
use todu_sync_core::{ConflictChoice, ConflictRecord, SyncCoordinator};
use uuid::Uuid;

use super::OutputFormat;
use crate::sync::report::choice_label;

/// Review and resolve sync conflicts
#[derive(Args)]
pub struct ConflictsCommand {
    #[command(subcommand)]
    pub command: ConflictsSubcommand,
}

#[derive(Subcommand)]
pub enum ConflictsSubcommand {
    /// List conflicts waiting for a decision
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Keep the local change or the server version
    Resolve {
        /// Conflict ID (UUID)
        conflict_id: String,

        /// Which side wins: mine or theirs
        #[arg(long, value_name = "SIDE")]
        keep: String,
    },
}

impl ConflictsCommand {
    pub fn run(&self, coordinator: &SyncCoordinator) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConflictsSubcommand::List { format } => {
                let conflicts = coordinator.conflicts();
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(&conflicts)?);
                    }
                    OutputFormat::Text => {
                        if conflicts.is_empty() {
                            println!("No conflicts.");
                        }
                        for conflict in &conflicts {
                            print_conflict(conflict);
                        }
                    }
                }
                Ok(())
            }

            ConflictsSubcommand::Resolve { conflict_id, keep } => {
                let conflict_id = Uuid::parse_str(conflict_id.trim())
                    .map_err(|_| format!("Invalid conflict id '{}'", conflict_id))?;
                let choice: ConflictChoice = keep.parse().map_err(|e: String| e)?;

                coordinator.resolve(conflict_id, choice)?;
                println!("Resolved {}: {}", conflict_id, choice_label(choice));
                Ok(())
            }
        }
    }
}

fn print_conflict(conflict: &ConflictRecord) {
    let edit = &conflict.local_edit;
    println!("{}", conflict.conflict_id);
    println!("  record:   {} ({})", conflict.record_id, edit.kind);
    println!("  reason:   {}", conflict.reason);
    println!("  mine:     {} {}", edit.op, edit.payload);
    match &conflict.server_record {
        Some(record) if record.deleted => {
            println!("  theirs:   deleted at v{}", record.version)
        }
        Some(record) => println!(
            "  theirs:   v{} {}",
            record.version,
            serde_json::Value::Object(record.fields.clone())
        ),
        None => println!("  theirs:   (missing)"),
    }
    println!(
        "  detected: {}",
        conflict.detected_at.format("%Y-%m-%d %H:%M:%S")
    );
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use todu_sync_core::{
        EntityKind, Fields, KeyValueStore, ManualClock, MemoryBackend, MemoryStore, MergePolicy,
        Record, SyncOptions,
    };

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap()
    }

    /// A meal plan renamed locally while another device renamed it too.
    async fn conflicted() -> SyncCoordinator {
        let backend = Arc::new(MemoryBackend::new());
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let options = SyncOptions {
            merge_policy: MergePolicy::manual_only(),
            ..SyncOptions::default()
        };
        let coordinator = SyncCoordinator::open(
            store,
            backend.clone(),
            Arc::new(ManualClock::default()),
            options,
        )
        .unwrap();

        let base = Record::new("pm-003", EntityKind::MealPlan, fields(json!({"title": "Tacos"})))
            .with_version(1);
        coordinator.refresh(base).unwrap();
        backend.insert(
            Record::new("pm-003", EntityKind::MealPlan, fields(json!({"title": "Burritos"})))
                .with_version(2),
        );

        coordinator
            .update("pm-003", fields(json!({"title": "Fish Tacos"})))
            .unwrap();
        coordinator.drain_once().await.unwrap();
        assert_eq!(coordinator.conflicts().len(), 1);
        coordinator
    }

    fn resolve(coordinator: &SyncCoordinator, conflict_id: String, keep: &str) -> Result<(), String> {
        ConflictsCommand {
            command: ConflictsSubcommand::Resolve {
                conflict_id,
                keep: keep.to_string(),
            },
        }
        .run(coordinator)
        .map_err(|e| e.to_string())
    }

    #[tokio::test]
    async fn test_list_prints_open_conflicts() {
        let coordinator = conflicted().await;
        let command = ConflictsCommand {
            command: ConflictsSubcommand::List {
                format: OutputFormat::Text,
            },
        };
        assert!(command.run(&coordinator).is_ok());
    }

    #[tokio::test]
    async fn test_keep_theirs_drops_local_change() {
        let coordinator = conflicted().await;
        let conflict_id = coordinator.conflicts()[0].conflict_id.to_string();

        resolve(&coordinator, conflict_id, "theirs").unwrap();

        assert!(coordinator.conflicts().is_empty());
        assert!(coordinator.queue().is_empty());
        let record = coordinator.state().get_visible_state(&"pm-003".into()).unwrap();
        assert_eq!(record.str_field("title"), Some("Burritos"));
    }

    #[tokio::test]
    async fn test_keep_mine_requeues_on_top_of_server() {
        let coordinator = conflicted().await;
        let conflict_id = coordinator.conflicts()[0].conflict_id.to_string();

        resolve(&coordinator, conflict_id, "mine").unwrap();

        let pending = coordinator.queue().snapshot();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].base_version, 2);
        let record = coordinator.state().get_visible_state(&"pm-003".into()).unwrap();
        assert_eq!(record.str_field("title"), Some("Fish Tacos"));
    }

    #[tokio::test]
    async fn test_resolve_rejects_bad_input() {
        let coordinator = conflicted().await;
        let conflict_id = coordinator.conflicts()[0].conflict_id.to_string();

        assert!(resolve(&coordinator, "nope".to_string(), "mine")
            .unwrap_err()
            .contains("Invalid conflict id"));
        assert!(resolve(&coordinator, conflict_id, "both")
            .unwrap_err()
            .contains("unknown choice"));
        assert!(resolve(&coordinator, Uuid::new_v4().to_string(), "mine")
            .unwrap_err()
            .contains("no open conflict"));
        assert_eq!(coordinator.conflicts().len(), 1);
    }
}
