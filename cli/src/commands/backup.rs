use anyhow::Result;
use clap::Args;
use tracing::info;

use crate::{console, context};

#[derive(Args)]
pub struct BackupCommand {
    #[arg(help = "Message to attach to the backup")]
    message: Vec<String>,
}

impl BackupCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;
        let message = (!self.message.is_empty()).then(|| self.message.join(" "));

        info!(
            "Backing up {:?} under {}",
            engine.config().source_dirs,
            engine.config().server_path.display()
        );
        let pb = console::spinner("Storing files...");
        let outcome = engine.create(message).await;
        pb.finish_and_clear();
        let outcome = outcome?;

        println!(
            "   {} files, {} new blobs, {} deduplicated",
            outcome.files,
            outcome.new_blobs,
            outcome.files.saturating_sub(outcome.new_blobs)
        );
        if outcome.skipped > 0 {
            println!("   ⚠️  {} entries skipped (see log)", outcome.skipped);
        }
        Ok(())
    }
}
