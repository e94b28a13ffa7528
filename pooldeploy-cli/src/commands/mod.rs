pub mod apps;
pub mod config;
pub mod daemon;
pub mod pools;
pub mod trigger;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use pooldeploy_core::Config;

pub fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// `--config` / `POOLDEPLOY_CONFIG` if given, else `~/.pooldeploy/config.yaml`.
pub fn config_path(home: &Path, explicit: Option<PathBuf>) -> PathBuf {
    explicit.unwrap_or_else(|| pooldeploy_core::config::config_path_at(home))
}

pub fn load_config(home: &Path, explicit: Option<PathBuf>) -> Result<(PathBuf, Config)> {
    let path = config_path(home, explicit);
    let config = Config::load_from(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    Ok((path, config))
}
