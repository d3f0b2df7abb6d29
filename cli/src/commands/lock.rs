use anyhow::Result;
use clap::Args;

use crate::context;

#[derive(Args)]
pub struct LockCommand {
    #[arg(help = "Backup id (defaults to the latest backup)")]
    id: Option<String>,
}

impl LockCommand {
    pub async fn run(&self, cli: &crate::Cli, locked: bool) -> Result<()> {
        let engine = context::open_engine(cli)?;
        let backup = engine.set_locked(self.id.as_deref(), locked)?;
        if locked {
            println!("🔒 Backup {} is locked and will not be pruned", backup.id);
        } else {
            println!("🔓 Backup {} is unlocked", backup.id);
        }
        Ok(())
    }
}
