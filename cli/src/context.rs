use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::PathBuf;
use std::sync::Arc;
use strongbox_core::{Config, NoopHost, Orchestrator};
use tracing::{debug, info};

use crate::console::ConsoleSink;

const CONFIG_FILE: &str = "config.toml";

/// Resolves the configuration file: `--config`/`STRONGBOX_CONFIG`, then the
/// platform config directory.
pub fn config_path(cli: &crate::Cli) -> Result<PathBuf> {
    if let Some(path) = &cli.config {
        return Ok(path.clone());
    }
    let dirs = ProjectDirs::from("", "", "strongbox")
        .context("Could not determine a configuration directory; pass --config")?;
    Ok(dirs.config_dir().join(CONFIG_FILE))
}

/// Loads the configuration, falling back to defaults when no file exists.
pub fn load_config(cli: &crate::Cli) -> Result<Config> {
    let path = config_path(cli)?;
    if !path.exists() {
        debug!("No config at {}, using defaults", path.display());
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&raw).with_context(|| format!("Invalid config {}", path.display()))?;
    debug!("Loaded config from {}", path.display());
    Ok(config)
}

pub fn save_config(path: &PathBuf, config: &Config) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, toml::to_string_pretty(config)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn open_engine(cli: &crate::Cli) -> Result<Orchestrator> {
    let config = load_config(cli)?;
    open_engine_with(config, cli.quiet)
}

pub fn open_engine_with(config: Config, quiet: bool) -> Result<Orchestrator> {
    info!("Opening backup store at: {}", config.data_root.display());
    let engine = Orchestrator::open(config, Arc::new(NoopHost), Arc::new(ConsoleSink::new(quiet)))?;
    Ok(engine)
}
