//! `pooldeploy pools` — ask the host which pools or sites exist.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use pooldeploy_daemon::{CommandPoolController, PoolController};

#[derive(Args, Debug)]
pub struct PoolsArgs {
    /// List sites instead of application pools.
    #[arg(long)]
    pub sites: bool,
}

impl PoolsArgs {
    pub fn run(self, config: Option<PathBuf>) -> Result<()> {
        let home = super::home_dir()?;
        let (_, config) = super::load_config(&home, config)?;
        let controller = CommandPoolController::new(config.settings.pool.clone());

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let names = runtime.block_on(async {
            if self.sites {
                controller.list_sites().await
            } else {
                controller.list_pools().await
            }
        });
        let what = if self.sites { "sites" } else { "pools" };
        let names = names.with_context(|| format!("failed to list {what}"))?;

        if names.is_empty() {
            println!("No {what} reported by the host.");
        }
        for name in names {
            println!("{name}");
        }
        Ok(())
    }
}
