use anyhow::{anyhow, Result};
use clap::Args;
use std::path::PathBuf;
use strongbox_core::Config;
use tracing::info;

use crate::context;

#[derive(Args)]
pub struct InitCommand {
    #[arg(long, help = "Directory holding the blob cache and index")]
    data_root: Option<PathBuf>,

    #[arg(long, help = "Directory containing the source directories")]
    server_path: Option<PathBuf>,

    #[arg(long = "source", help = "Source directory name (repeatable)")]
    sources: Vec<String>,

    #[arg(long, help = "Overwrite an existing configuration file")]
    force: bool,
}

impl InitCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let path = context::config_path(cli)?;
        if path.exists() && !self.force {
            return Err(anyhow!(
                "Configuration already exists at {} (use --force to overwrite)",
                path.display()
            ));
        }

        let mut config = Config::default();
        if let Some(root) = &self.data_root {
            config.data_root = root.clone();
        }
        if let Some(server) = &self.server_path {
            config.server_path = server.clone();
        }
        if !self.sources.is_empty() {
            config.source_dirs = self.sources.clone();
        }

        info!("Writing configuration to: {}", path.display());
        context::save_config(&path, &config)?;
        let _engine = context::open_engine_with(config.clone(), true)?;

        println!("Successfully initialized backup store at {}", config.data_root.display());
        println!("Configuration written to {}", path.display());
        Ok(())
    }
}
