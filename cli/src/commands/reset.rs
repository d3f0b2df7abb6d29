use anyhow::{anyhow, Result};
use clap::Args;
use std::io::{self, BufRead, Write};

use crate::context;

#[derive(Args)]
pub struct ResetCommand {
    #[arg(long, help = "Do not ask for confirmation")]
    yes: bool,
}

impl ResetCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let engine = context::open_engine(cli)?;
        let count = engine.list_backups()?.len();

        if !self.yes {
            print!("Delete all {} backups and every stored blob? [y/N] ", count);
            io::stdout().flush()?;
            let mut answer = String::new();
            io::stdin().lock().read_line(&mut answer)?;
            if !matches!(answer.trim(), "y" | "Y" | "yes") {
                return Err(anyhow!("Reset aborted"));
            }
        }

        engine.reset().await?;
        Ok(())
    }
}
