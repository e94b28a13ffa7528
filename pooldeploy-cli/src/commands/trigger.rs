//! `pooldeploy trigger <application>` — manual deployment through the daemon.

use anyhow::{bail, Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::Value;
use tabled::{settings::Style, Table, Tabled};

use pooldeploy_core::{DeploymentOperation, OperationStatus, StepStatus};
use pooldeploy_daemon::{request_trigger, DaemonError};

#[derive(Args, Debug)]
pub struct TriggerArgs {
    /// Application name (case-insensitive).
    pub application: String,

    /// Only deploy files modified in the last N minutes. Omit to deploy
    /// every file under the watch roots.
    #[arg(long, value_name = "N")]
    pub since_minutes: Option<u64>,

    /// Print the raw daemon response.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct StepRow {
    #[tabled(rename = "step")]
    step: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "files")]
    files: usize,
    #[tabled(rename = "detail")]
    detail: String,
}

impl TriggerArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home_dir()?;
        let response = match request_trigger(&home, &self.application, self.since_minutes) {
            Ok(response) => response,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                bail!("daemon is not running; start it with `pooldeploy daemon start`")
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("trigger for '{}' failed", self.application))
            }
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&response)
                    .context("failed to render trigger response JSON")?
            );
            return Ok(());
        }

        print_summary(&response)
    }
}

fn print_summary(response: &Value) -> Result<()> {
    if response["admitted"] != Value::Bool(true) {
        let reason = response["reason"].as_str().unwrap_or("unknown reason");
        println!("{} {reason}", "skipped:".yellow().bold());
        return Ok(());
    }

    let operation: DeploymentOperation = serde_json::from_value(response["operation"].clone())
        .context("daemon returned an unreadable operation")?;
    let status = match operation.status {
        OperationStatus::Completed => operation.status.to_string().green().bold(),
        OperationStatus::Failed => operation.status.to_string().red().bold(),
        _ => operation.status.to_string().yellow().bold(),
    };
    println!(
        "{} {} (pool {}) {} in {} ms, {} change(s)",
        operation.id.to_string().bright_black(),
        operation.application_name,
        operation.pool_name,
        status,
        operation.duration_ms().unwrap_or(0),
        operation.changes.len(),
    );

    let rows: Vec<StepRow> = operation
        .steps
        .iter()
        .map(|step| StepRow {
            step: step.kind.to_string(),
            status: step_label(step.status).to_string(),
            files: step.files.len(),
            detail: step.error_message.clone().unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!("{table}");

    if let Some(error) = &operation.error_message {
        println!("{} {error}", "error:".red().bold());
    }
    Ok(())
}

fn step_label(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Pending => "pending",
        StepStatus::InProgress => "in progress",
        StepStatus::Completed => "completed",
        StepStatus::Failed => "FAILED",
        StepStatus::Skipped => "skipped",
    }
}
