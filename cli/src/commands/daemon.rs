use anyhow::{anyhow, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use strongbox_core::Scheduler;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context;

#[derive(Args)]
pub struct DaemonCommand {
    #[arg(long, help = "Minutes between backups (overrides the config)")]
    interval: Option<f64>,
}

impl DaemonCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut config = context::load_config(cli)?;
        if let Some(minutes) = self.interval {
            if !(minutes > 0.0) {
                return Err(anyhow!("Interval must be positive"));
            }
            config.scheduler.interval_minutes = minutes;
        }
        let interval: Duration = config.scheduler.interval();
        let engine = Arc::new(context::open_engine_with(config, cli.quiet)?);

        let scheduler = Scheduler::new(engine, true, interval);
        scheduler.reset();

        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
            }
            signal_cancel.cancel();
        });

        scheduler.run(cancel).await;
        Ok(())
    }
}
