use anyhow::Result;
use clap::Args;
use tracing::{info, warn};

use crate::{console, context};

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(help = "Backup id (defaults to the latest backup)")]
    id: Option<String>,

    #[arg(long, help = "Skip the confirmation countdown")]
    now: bool,
}

impl RestoreCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;

        if self.now {
            let pb = console::spinner("Restoring...");
            let result = engine.restore(self.id.as_deref()).await;
            pb.finish_and_clear();
            result?;
            return Ok(());
        }

        let session = engine.select_restore(self.id.as_deref())?;
        let backup = engine.resolve(Some(session.backup_id()))?;
        println!("📸 Restoring backup: {}", backup.summary());
        println!(
            "📂 Target: {} ({})",
            engine.config().server_path.display(),
            engine.config().source_dirs.join(", ")
        );

        let token = session.cancellation_token();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!("Could not listen for Ctrl-C: {}", e);
                        return;
                    }
                    info!("Ctrl-C received, cancelling restore");
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });

        let result = engine.confirm_restore(&session).await;
        watcher.abort();
        result?;
        Ok(())
    }
}
