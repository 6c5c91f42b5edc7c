use clap::Args;
use todu_sync_core::{Record, RecordId, SyncCoordinator};

use super::OutputFormat;
use crate::config::Config;
use crate::sync::http_backend;

/// Show records as this device sees them
#[derive(Args)]
pub struct ShowCommand {
    /// Record ID; lists every record when omitted
    pub id: Option<String>,

    /// Fetch the server copy first
    #[arg(long)]
    pub refresh: bool,

    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

impl ShowCommand {
    pub fn run(
        &self,
        coordinator: &SyncCoordinator,
        config: &Config,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let Some(id) = &self.id else {
            return self.list(coordinator);
        };
        let record_id = RecordId::new(id.as_str());

        if self.refresh {
            refresh(coordinator, config, &record_id)?;
        }

        let record = coordinator
            .state()
            .get_visible_state(&record_id)
            .ok_or_else(|| format!("Record not found: {}", record_id))?;
        let status = coordinator.record_status(&record_id);
        let pending = coordinator.queue().pending_for(&record_id).len();

        match self.format {
            OutputFormat::Json => {
                let body = serde_json::json!({
                    "record": record,
                    "status": status,
                    "pending": pending,
                });
                println!("{}", serde_json::to_string_pretty(&body)?);
            }
            OutputFormat::Text => {
                println!("{} ({})", record.record_id, record.kind);
                println!("  version: {}", record.version);
                println!("  status:  {}", status);
                if pending > 0 {
                    println!("  pending: {} edit(s)", pending);
                }
                println!("  fields:");
                for (name, value) in &record.fields {
                    println!("    {}: {}", name, value);
                }
            }
        }
        Ok(())
    }

    fn list(&self, coordinator: &SyncCoordinator) -> Result<(), Box<dyn std::error::Error>> {
        let records = coordinator.state().visible_records();

        match self.format {
            OutputFormat::Json => {
                println!("{}", serde_json::to_string_pretty(&records)?);
            }
            OutputFormat::Text => {
                if records.is_empty() {
                    println!("No records.");
                    return Ok(());
                }
                for record in &records {
                    println!("{}", summary_line(coordinator, record));
                }
            }
        }
        Ok(())
    }
}

fn summary_line(coordinator: &SyncCoordinator, record: &Record) -> String {
    format!(
        "{:<24} {:<14} v{:<4} {}",
        record.record_id.as_str(),
        record.kind.as_str(),
        record.version,
        coordinator.record_status(&record.record_id)
    )
}

fn refresh(
    coordinator: &SyncCoordinator,
    config: &Config,
    record_id: &RecordId,
) -> Result<(), Box<dyn std::error::Error>> {
    let backend = http_backend(&config.sync)
        .ok_or("Sync is not configured. Run 'fit-sync sync status' for details.")?;
    let rt = tokio::runtime::Runtime::new()?;

    match rt.block_on(backend.fetch(record_id))? {
        Some(record) => {
            if !coordinator.refresh(record)? {
                tracing::debug!(%record_id, "server copy is not newer than the local snapshot");
            }
        }
        None => println!("{} is not on the server yet.", record_id),
    }
    Ok(())
}
