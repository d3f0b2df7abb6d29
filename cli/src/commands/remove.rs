use anyhow::Result;
use clap::Args;

use crate::context;

#[derive(Args)]
pub struct RemoveCommand {
    #[arg(help = "Backup id (defaults to the latest backup)")]
    id: Option<String>,

    #[arg(long, conflicts_with = "id", help = "Keep only the newest N backups (locked ones are kept too)")]
    keep_last: Option<usize>,
}

impl RemoveCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;
        if let Some(limit) = self.keep_last {
            let removed = engine.prune(limit).await?;
            if removed.is_empty() {
                println!("Nothing to prune");
            }
            return Ok(());
        }
        engine.remove(self.id.as_deref()).await?;
        Ok(())
    }
}
