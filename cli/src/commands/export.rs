use anyhow::Result;
use clap::Args;
use strongbox_core::ExportFormat;

use crate::{console, context};

#[derive(Args)]
pub struct ExportCommand {
    #[arg(help = "Backup id (defaults to the latest backup)")]
    id: Option<String>,

    #[arg(long, help = "Export format (plain, tar, tar+gzip, tar+xz, tar+zstd)")]
    format: Option<ExportFormat>,

    #[arg(long, help = "Compression level for the chosen format")]
    level: Option<u32>,
}

impl ExportCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;
        let pb = console::spinner("Exporting...");
        let result = engine.export(self.id.as_deref(), self.format, self.level).await;
        pb.finish_and_clear();
        result?;
        Ok(())
    }
}
