//! `pooldeploy config validate|path`

use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;
use colored::Colorize;

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Load the config and report every validation problem.
    Validate,
    /// Print the config file location in use.
    Path,
}

pub fn run(command: ConfigCommand, config: Option<PathBuf>) -> Result<()> {
    let home = super::home_dir()?;
    match command {
        ConfigCommand::Path => {
            println!("{}", super::config_path(&home, config).display());
        }
        ConfigCommand::Validate => {
            let (path, config) = super::load_config(&home, config)?;
            let enabled = config.enabled_applications().count();
            println!(
                "{} {} ({} application(s), {} enabled)",
                "valid:".green().bold(),
                path.display(),
                config.applications.len(),
                enabled,
            );
        }
    }
    Ok(())
}
