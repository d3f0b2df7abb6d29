use anyhow::Result;
use clap::Args;
use strongbox_core::format_size;

use crate::context;

#[derive(Args)]
pub struct StatusCommand {}

impl StatusCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;
        let config = engine.config();
        let backups = engine.list_backups()?;
        let usage = engine.store_usage()?;
        let logical: u64 = backups.iter().map(|b| b.size).sum();

        println!("Store:      {}", config.data_root.display());
        println!("Sources:    {} ({})", config.server_path.display(), config.source_dirs.join(", "));
        println!(
            "Backups:    {} ({} locked)",
            backups.len(),
            backups.iter().filter(|b| b.locked).count()
        );
        println!("Blobs:      {} using {}", usage.blobs, format_size(usage.bytes));
        println!("Logical:    {}", format_size(logical));
        if let Some(latest) = backups.first() {
            println!("Latest:     {}", latest.summary());
        }
        if config.retention.enabled {
            println!("Retention:  keep {}", config.retention.limit);
        } else {
            println!("Retention:  off");
        }
        if config.scheduler.enabled {
            println!("Schedule:   every {} minutes", config.scheduler.interval_minutes);
        } else {
            println!("Schedule:   off");
        }
        if config.holding_area().exists() {
            println!(
                "⚠️  Holding area {} exists; a previous restore needs manual recovery",
                config.holding_area().display()
            );
        }
        Ok(())
    }
}
