use anyhow::{anyhow, Result};
use clap::Args;
use strongbox_core::format_size;

use crate::context;

#[derive(Args)]
pub struct ListCommand {
    #[arg(long, help = "Output format (table, json)")]
    format: Option<String>,

    #[arg(long, help = "Show latest N backups")]
    latest: Option<usize>,

    #[arg(long, help = "Only show locked backups")]
    locked: bool,
}

impl ListCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;
        let mut backups = engine.list_backups()?;

        if self.locked {
            backups.retain(|b| b.locked);
        }
        if let Some(latest) = self.latest {
            backups.truncate(latest);
        }

        match self.format.as_deref().unwrap_or("table") {
            "table" => {
                if backups.is_empty() {
                    println!("No backups found");
                    return Ok(());
                }
                println!("{:<8} {:<20} {:<10} {:<6} {}", "ID", "Date", "Size", "Lock", "Message");
                println!("{:-<72}", "");
                for backup in backups {
                    println!(
                        "{:<8} {:<20} {:<10} {:<6} {}",
                        backup.id,
                        backup
                            .created_at
                            .with_timezone(&chrono::Local)
                            .format("%Y-%m-%d %H:%M:%S"),
                        format_size(backup.size),
                        if backup.locked { "yes" } else { "" },
                        backup.message.as_deref().unwrap_or("")
                    );
                }
            }
            "json" => {
                println!("{}", serde_json::to_string_pretty(&backups)?);
            }
            other => return Err(anyhow!("Unsupported format: {}", other)),
        }
        Ok(())
    }
}
