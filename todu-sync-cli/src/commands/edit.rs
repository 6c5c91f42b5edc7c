use clap::{Args, Subcommand};
use serde_json::Value;
use todu_sync_core::{Edit, EntityKind, Fields, SyncCoordinator};

#[derive(Args)]
pub struct EditCommand {
    #[command(subcommand)]
    pub command: EditSubcommand,
}

#[derive(Subcommand)]
pub enum EditSubcommand {
    /// Create a record
    Create {
        /// Record ID (e.g. gi-milk)
        id: String,

        /// Entity kind (grocery_item, grocery_list, meal_plan, notification)
        #[arg(long, short)]
        kind: String,

        /// Field to set; values are parsed as JSON, falling back to a string
        #[arg(long = "field", short = 'f', value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },

    /// Overwrite fields of a record
    Update {
        /// Record ID
        id: String,

        /// Field to set; `null` removes the field
        #[arg(long = "field", short = 'f', value_name = "KEY=VALUE", required = true)]
        fields: Vec<String>,
    },

    /// Flip a boolean field
    Toggle {
        /// Record ID
        id: String,

        /// Field name (e.g. checked)
        field: String,
    },

    /// Delete a record
    Delete {
        /// Record ID
        id: String,
    },
}

impl EditCommand {
    pub fn run(&self, coordinator: &SyncCoordinator) -> Result<(), Box<dyn std::error::Error>> {
        let edit = match &self.command {
            EditSubcommand::Create { id, kind, fields } => {
                let kind: EntityKind = kind.parse().map_err(|e: String| e)?;
                coordinator.create(id.as_str(), kind, parse_fields(fields)?)?
            }
            EditSubcommand::Update { id, fields } => {
                coordinator.update(id.as_str(), parse_fields(fields)?)?
            }
            EditSubcommand::Toggle { id, field } => coordinator.toggle(id.as_str(), field)?,
            EditSubcommand::Delete { id } => coordinator.delete(id.as_str())?,
        };

        print_saved(coordinator, &edit);
        Ok(())
    }
}

fn print_saved(coordinator: &SyncCoordinator, edit: &Edit) {
    println!("Saved {} of {} ({})", edit.op, edit.record_id, edit.edit_id);
    println!("  status: {}", coordinator.record_status(&edit.record_id));
}

/// Parses repeated `KEY=VALUE` arguments into a field map.
pub fn parse_fields(args: &[String]) -> Result<Fields, String> {
    let mut fields = Fields::new();
    for arg in args {
        let (key, value) = parse_field(arg)?;
        fields.insert(key, value);
    }
    Ok(fields)
}

fn parse_field(arg: &str) -> Result<(String, Value), String> {
    let (key, raw) = arg
        .split_once('=')
        .ok_or_else(|| format!("Invalid field '{}'. Use KEY=VALUE.", arg))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("Invalid field '{}'. Field name is empty.", arg));
    }
    let value =
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((key.to_string(), value))
}
