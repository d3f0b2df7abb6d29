mod commands;
mod console;
mod context;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{
    backup::BackupCommand, daemon::DaemonCommand, export::ExportCommand, init::InitCommand,
    list::ListCommand, lock::LockCommand, maintenance::ImportLegacyCommand,
    maintenance::MigrateCommand, remove::RemoveCommand, reset::ResetCommand,
    restore::RestoreCommand, status::StatusCommand,
};
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "strongbox",
    about = "Deduplicating snapshot tool for server directories",
    long_about = "Strongbox snapshots a set of directories, stores each distinct file once, and restores any snapshot with rollback on failure"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, env = "STRONGBOX_CONFIG", help = "Configuration file path")]
    config: Option<PathBuf>,

    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Write a default configuration file")]
    Init(InitCommand),

    #[command(about = "Create a new backup", visible_alias = "make")]
    Backup(BackupCommand),

    #[command(about = "List backups", visible_alias = "ls")]
    List(ListCommand),

    #[command(about = "Remove a backup and reclaim unreferenced content")]
    Remove(RemoveCommand),

    #[command(about = "Restore a backup over the live directories")]
    Restore(RestoreCommand),

    #[command(about = "Export a backup as a directory or archive")]
    Export(ExportCommand),

    #[command(about = "Protect a backup from retention")]
    Lock(LockCommand),

    #[command(about = "Allow retention to remove a backup again")]
    Unlock(LockCommand),

    #[command(about = "Delete every backup and stored blob")]
    Reset(ResetCommand),

    #[command(about = "Show store and scheduler status")]
    Status(StatusCommand),

    #[command(about = "Run scheduled backups until interrupted")]
    Daemon(DaemonCommand),

    #[command(about = "Re-hash legacy MD5 blobs as BLAKE3")]
    Migrate(MigrateCommand),

    #[command(about = "Import v1 JSON backup metadata into the index")]
    ImportLegacy(ImportLegacyCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.quiet);

    debug!("Starting Strongbox");

    let result = match cli.command {
        Commands::Init(ref cmd) => cmd.run(&cli).await,
        Commands::Backup(ref cmd) => cmd.run(&cli).await,
        Commands::List(ref cmd) => cmd.run(&cli).await,
        Commands::Remove(ref cmd) => cmd.run(&cli).await,
        Commands::Restore(ref cmd) => cmd.run(&cli).await,
        Commands::Export(ref cmd) => cmd.run(&cli).await,
        Commands::Lock(ref cmd) => cmd.run(&cli, true).await,
        Commands::Unlock(ref cmd) => cmd.run(&cli, false).await,
        Commands::Reset(ref cmd) => cmd.run(&cli).await,
        Commands::Status(ref cmd) => cmd.run(&cli).await,
        Commands::Daemon(ref cmd) => cmd.run(&cli).await,
        Commands::Migrate(ref cmd) => cmd.run(&cli).await,
        Commands::ImportLegacy(ref cmd) => cmd.run(&cli).await,
    };

    if let Err(e) = &result {
        console::report_failure(e);
    }
    result
}

fn init_tracing(verbose: bool, quiet: bool) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        "info"
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(format!(
            "strongbox={0},strongbox_core={0}",
            level
        )))
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Setting default subscriber failed");
}
