use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use strongbox_core::maintenance;

use crate::{console, context};

#[derive(Args)]
pub struct MigrateCommand {}

impl MigrateCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;
        let pb = console::spinner("Re-hashing legacy blobs...");
        let report = maintenance::migrate_digests(engine.store(), engine.index());
        pb.finish_and_clear();
        let report = report?;

        println!(
            "Migrated {} blobs ({} file records)",
            report.migrated, report.records_rewritten
        );
        for digest in &report.missing {
            println!("   missing: {}", digest);
        }
        for digest in &report.corrupt {
            println!("   corrupt: {}", digest);
        }
        Ok(())
    }
}

#[derive(Args)]
pub struct ImportLegacyCommand {
    #[arg(help = "Directory containing backup_<id>_info.json files")]
    metadata_dir: PathBuf,
}

impl ImportLegacyCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;
        let report = maintenance::import_legacy_metadata(&self.metadata_dir, engine.index())?;
        println!(
            "Imported {} backups, skipped {} already present",
            report.imported.len(),
            report.skipped.len()
        );
        Ok(())
    }
}
