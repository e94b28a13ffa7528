//! pooldeploy — watch build output and redeploy it into application pools.
//!
//! # Usage
//!
//! ```text
//! pooldeploy daemon start [--simulate] [--log-file]
//! pooldeploy daemon stop|status
//! pooldeploy daemon logs [--lines N]
//! pooldeploy trigger <application> [--since-minutes N] [--json]
//! pooldeploy apps [--json]
//! pooldeploy pools [--sites]
//! pooldeploy config validate|path
//! ```

mod commands;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{
    apps::AppsArgs, config::ConfigCommand, daemon::DaemonCommand, pools::PoolsArgs,
    trigger::TriggerArgs,
};

#[derive(Parser, Debug)]
#[command(
    name = "pooldeploy",
    version,
    about = "Aggregate file changes and redeploy them into application pools",
    long_about = None,
)]
struct Cli {
    /// Config file to use instead of ~/.pooldeploy/config.yaml.
    #[arg(long, global = true, env = "POOLDEPLOY_CONFIG", value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run and control the deployment daemon.
    Daemon {
        #[command(subcommand)]
        command: DaemonCommand,
    },

    /// Deploy an application now through the running daemon.
    Trigger(TriggerArgs),

    /// List configured applications and their last deployment.
    Apps(AppsArgs),

    /// List pools (or sites) known to the host.
    Pools(PoolsArgs),

    /// Inspect the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config;
    match cli.command {
        Commands::Daemon { command } => commands::daemon::run(command, config),
        Commands::Trigger(args) => args.run(),
        Commands::Apps(args) => args.run(config),
        Commands::Pools(args) => args.run(config),
        Commands::Config { command } => commands::config::run(command, config),
    }
}
