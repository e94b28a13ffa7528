//! `pooldeploy apps` — configured applications and their last deployment.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use colored::Colorize;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

use pooldeploy_core::{ApplicationSpec, DeploymentOperation, OperationStatus};
use pooldeploy_daemon::paths::audit_log_path;
use pooldeploy_daemon::read_audit_log;

#[derive(Args, Debug)]
pub struct AppsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Serialize)]
struct AppJson {
    name: String,
    pool: String,
    enabled: bool,
    watch_roots: Vec<PathBuf>,
    copy_enabled: bool,
    source_root: PathBuf,
    destination_root: Option<PathBuf>,
    last_status: Option<OperationStatus>,
    last_deployed_at: Option<String>,
}

#[derive(Tabled)]
struct AppRow {
    #[tabled(rename = "application")]
    name: String,
    #[tabled(rename = "pool")]
    pool: String,
    #[tabled(rename = "enabled")]
    enabled: String,
    #[tabled(rename = "copy")]
    copy: String,
    #[tabled(rename = "last deploy")]
    last: String,
}

impl AppsArgs {
    pub fn run(self, config: Option<PathBuf>) -> Result<()> {
        let home = super::home_dir()?;
        let (_, config) = super::load_config(&home, config)?;
        let audit_path = audit_log_path(&home);
        let history = read_audit_log(&audit_path)
            .with_context(|| format!("failed to read {}", audit_path.display()))?;
        let last = latest_by_application(history);

        if self.json {
            let payload: Vec<AppJson> = config
                .applications
                .iter()
                .map(|app| to_json(app, last.get(&app.name.0)))
                .collect();
            println!(
                "{}",
                serde_json::to_string_pretty(&payload).context("failed to serialize apps JSON")?
            );
            return Ok(());
        }

        if config.applications.is_empty() {
            println!("No applications configured.");
            return Ok(());
        }

        let rows: Vec<AppRow> = config
            .applications
            .iter()
            .map(|app| to_row(app, last.get(&app.name.0)))
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

/// Most recent finished operation per application name.
fn latest_by_application(history: Vec<DeploymentOperation>) -> HashMap<String, DeploymentOperation> {
    let mut latest: HashMap<String, DeploymentOperation> = HashMap::new();
    for op in history {
        let newer = latest
            .get(&op.application_name.0)
            .map_or(true, |seen| op.start_time >= seen.start_time);
        if newer {
            latest.insert(op.application_name.0.clone(), op);
        }
    }
    latest
}

fn to_json(app: &ApplicationSpec, last: Option<&DeploymentOperation>) -> AppJson {
    AppJson {
        name: app.name.0.clone(),
        pool: app.pool_name.clone(),
        enabled: app.enabled,
        watch_roots: app.watch_roots.clone(),
        copy_enabled: app.copy_enabled,
        source_root: app.source_root.clone(),
        destination_root: app.destination_root.clone(),
        last_status: last.map(|op| op.status),
        last_deployed_at: last
            .map(|op| op.end_time.unwrap_or(op.start_time).to_rfc3339()),
    }
}

fn to_row(app: &ApplicationSpec, last: Option<&DeploymentOperation>) -> AppRow {
    let copy = match (&app.destination_root, app.copy_enabled) {
        (Some(dst), true) => format!("{} -> {}", app.source_root.display(), dst.display()),
        _ => "off".to_string(),
    };
    let last = match last {
        None => "never".bright_black().to_string(),
        Some(op) => {
            let age = format_age(op.end_time.unwrap_or(op.start_time), Utc::now());
            match op.status {
                OperationStatus::Completed => format!("{} {age}", "ok".green()),
                OperationStatus::Failed => format!("{} {age}", "failed".red()),
                other => format!("{other} {age}"),
            }
        }
    };
    AppRow {
        name: app.name.0.clone(),
        pool: app.pool_name.clone(),
        enabled: if app.enabled { "yes" } else { "no" }.to_string(),
        copy,
        last,
    }
}

fn format_age(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
