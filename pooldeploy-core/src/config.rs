//! YAML configuration provider.
//!
//! # Storage layout
//!
//! ```text
//! ~/.pooldeploy/
//!   config.yaml   (settings + applications — mode 0600)
//! ```
//!
//! # API pattern
//!
//! Every function that touches the filesystem has two forms:
//! - `fn_at(home: &Path, …)` — explicit home; used in tests with `TempDir`
//! - `fn(…)` — derives home from `dirs::home_dir()`, delegates to `_at`
//!
//! A loaded [`Config`] is validated and immutable for the lifetime of one
//! orchestration run; reloading means restarting the daemon.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::ApplicationSpec;

pub const MIN_FLUSH_INTERVAL_MS: u64 = 1_000;
pub const MAX_FLUSH_INTERVAL_MS: u64 = 60_000;
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Placeholder substituted with the pool name in command templates.
pub const POOL_PLACEHOLDER: &str = "{pool}";

// ---------------------------------------------------------------------------
// 1. Model
// ---------------------------------------------------------------------------

/// Root of `config.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub applications: Vec<ApplicationSpec>,
}

/// Process-wide orchestration settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub flush_interval_ms: u64,
    pub cooldown_secs: u64,
    /// Capacity of the global execution gate.
    pub max_concurrent_deployments: usize,
    /// Default per-file attempt count for applications that do not set one.
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub shutdown_timeout_secs: u64,
    pub health_check_interval_secs: u64,
    pub event_queue_capacity: usize,
    /// Applied to every raw event before it reaches the pending set.
    pub exclude_patterns: Vec<String>,
    pub pool: PoolSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            flush_interval_ms: 5_000,
            cooldown_secs: 60,
            max_concurrent_deployments: 1,
            max_retries: 3,
            retry_delay_ms: 1_000,
            shutdown_timeout_secs: 300,
            health_check_interval_secs: 30,
            event_queue_capacity: 4_096,
            exclude_patterns: Vec::new(),
            pool: PoolSettings::default(),
        }
    }
}

impl Settings {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// How the command pool controller talks to the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub stop_timeout_secs: u64,
    pub start_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub commands: PoolCommands,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 30,
            start_timeout_secs: 60,
            poll_interval_ms: 500,
            commands: PoolCommands::default(),
        }
    }
}

impl PoolSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// argv templates; `{pool}` is replaced with the pool name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolCommands {
    pub stop: Vec<String>,
    pub start: Vec<String>,
    pub state: Vec<String>,
    pub list_pools: Vec<String>,
    pub list_sites: Vec<String>,
}

impl Default for PoolCommands {
    fn default() -> Self {
        let argv = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();
        Self {
            stop: argv(&["appcmd", "stop", "apppool", "/apppool.name:{pool}"]),
            start: argv(&["appcmd", "start", "apppool", "/apppool.name:{pool}"]),
            state: argv(&["appcmd", "list", "apppool", "/apppool.name:{pool}", "/text:state"]),
            list_pools: argv(&["appcmd", "list", "apppool", "/text:name"]),
            list_sites: argv(&["appcmd", "list", "site", "/text:name"]),
        }
    }
}

impl Config {
    /// Enabled applications in declaration order.
    pub fn enabled_applications(&self) -> impl Iterator<Item = &ApplicationSpec> {
        self.applications.iter().filter(|app| app.enabled)
    }

    /// Look up an application by name (case-insensitive).
    pub fn application(&self, name: &str) -> Option<&ApplicationSpec> {
        self.applications
            .iter()
            .find(|app| app.name.0.eq_ignore_ascii_case(name))
    }

    /// Check every rule and report all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let s = &self.settings;

        if !(MIN_FLUSH_INTERVAL_MS..=MAX_FLUSH_INTERVAL_MS).contains(&s.flush_interval_ms) {
            problems.push(format!(
                "settings.flush_interval_ms must be between {MIN_FLUSH_INTERVAL_MS} and {MAX_FLUSH_INTERVAL_MS} (got {})",
                s.flush_interval_ms
            ));
        }
        if s.max_concurrent_deployments == 0 {
            problems.push("settings.max_concurrent_deployments must be at least 1".to_string());
        }
        if !(1..=MAX_RETRIES_LIMIT).contains(&s.max_retries) {
            problems.push(format!(
                "settings.max_retries must be between 1 and {MAX_RETRIES_LIMIT} (got {})",
                s.max_retries
            ));
        }
        if s.event_queue_capacity == 0 {
            problems.push("settings.event_queue_capacity must be at least 1".to_string());
        }
        if s.health_check_interval_secs == 0 {
            problems.push("settings.health_check_interval_secs must be at least 1".to_string());
        }
        if s.pool.poll_interval_ms == 0 {
            problems.push("settings.pool.poll_interval_ms must be at least 1".to_string());
        }
        for (label, argv) in [
            ("stop", &s.pool.commands.stop),
            ("start", &s.pool.commands.start),
            ("state", &s.pool.commands.state),
            ("list_pools", &s.pool.commands.list_pools),
            ("list_sites", &s.pool.commands.list_sites),
        ] {
            if argv.is_empty() || argv[0].trim().is_empty() {
                problems.push(format!("settings.pool.commands.{label} must not be empty"));
            }
        }

        let mut seen = HashSet::new();
        for (index, app) in self.applications.iter().enumerate() {
            let label = if app.name.0.trim().is_empty() {
                format!("applications[{index}]")
            } else {
                format!("application '{}'", app.name)
            };
            if app.name.0.trim().is_empty() {
                problems.push(format!("{label}: name must not be empty"));
            } else if !seen.insert(app.name.0.to_ascii_lowercase()) {
                problems.push(format!("{label}: duplicate application name"));
            }
            if app.pool_name.trim().is_empty() {
                problems.push(format!("{label}: pool_name must not be empty"));
            }
            if app.watch_roots.is_empty() {
                problems.push(format!("{label}: at least one watch root is required"));
            }
            for root in &app.watch_roots {
                if !root.is_absolute() {
                    problems.push(format!(
                        "{label}: watch root {} must be absolute",
                        root.display()
                    ));
                }
            }
            if app.copy_enabled {
                if !app.source_root.is_absolute() {
                    problems.push(format!(
                        "{label}: source_root {} must be absolute",
                        app.source_root.display()
                    ));
                }
                match &app.destination_root {
                    Some(dest) if dest.is_absolute() => {}
                    Some(dest) => problems.push(format!(
                        "{label}: destination_root {} must be absolute",
                        dest.display()
                    )),
                    None => problems.push(format!(
                        "{label}: destination_root is required when copy_enabled is true"
                    )),
                }
            }
            if let Some(retries) = app.max_retries {
                if !(1..=MAX_RETRIES_LIMIT).contains(&retries) {
                    problems.push(format!(
                        "{label}: max_retries must be between 1 and {MAX_RETRIES_LIMIT} (got {retries})"
                    ));
                }
            }
            if app.timeout_secs == 0 {
                problems.push(format!("{label}: timeout_secs must be at least 1"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }

    /// Parse and validate YAML. `path` is only used for error context.
    pub fn from_yaml_str(contents: &str, path: &Path) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    // -----------------------------------------------------------------------
    // 2. Load
    // -----------------------------------------------------------------------

    /// Load and validate the config file at `path`.
    ///
    /// Returns `ConfigError::ConfigNotFound` if absent,
    /// `ConfigError::Parse` (with path + line context) if malformed YAML,
    /// `ConfigError::Invalid` if validation fails.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents, path)
    }

    /// Load `<home>/.pooldeploy/config.yaml`.
    pub fn load_at(home: &Path) -> Result<Self, ConfigError> {
        Self::load_from(&config_path_at(home))
    }

    /// `load_at` convenience wrapper.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_at(&home()?)
    }

    // -----------------------------------------------------------------------
    // 3. Save (atomic)
    // -----------------------------------------------------------------------

    /// Atomically write this config to `path`.
    ///
    /// Write flow: serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename`.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            if !dir.exists() {
                std::fs::create_dir_all(dir)?;
                set_dir_permissions(dir)?;
            }
        }
        let tmp_path = path.with_extension("yaml.tmp");
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(&tmp_path, yaml)?;
        set_file_permissions(&tmp_path)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// `save_to` rooted at `<home>/.pooldeploy/config.yaml`.
    pub fn save_at(&self, home: &Path) -> Result<(), ConfigError> {
        self.save_to(&config_path_at(home))
    }
}

// ---------------------------------------------------------------------------
// 4. Path helpers
// ---------------------------------------------------------------------------

/// `<home>/.pooldeploy/`
pub fn root_at(home: &Path) -> PathBuf {
    home.join(".pooldeploy")
}

/// `<home>/.pooldeploy/config.yaml` — pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_at(home).join("config.yaml")
}

/// `config_path_at` convenience wrapper.
pub fn config_path() -> Result<PathBuf, ConfigError> {
    Ok(config_path_at(&home()?))
}

/// Replace `{pool}` in every argument of an argv template.
pub fn render_command(template: &[String], pool: &str) -> Vec<String> {
    template
        .iter()
        .map(|arg| arg.replace(POOL_PLACEHOLDER, pool))
        .collect()
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ApplicationName;
    use rstest::rstest;
    use tempfile::TempDir;

    fn api() -> ApplicationSpec {
        ApplicationSpec::new("API", "ApiPool")
            .with_watch_root("/src/api")
            .with_copy("/src/api", "/srv/api")
    }

    fn config_with(apps: Vec<ApplicationSpec>) -> Config {
        Config {
            settings: Settings::default(),
            applications: apps,
        }
    }

    #[test]
    fn config_path_is_correct() {
        let home = TempDir::new().expect("tempdir");
        assert!(config_path_at(home.path()).ends_with(".pooldeploy/config.yaml"));
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = Settings::default();
        assert_eq!(s.flush_interval(), Duration::from_secs(5));
        assert_eq!(s.cooldown(), Duration::from_secs(60));
        assert_eq!(s.max_concurrent_deployments, 1);
        assert_eq!(s.max_retries, 3);
        assert_eq!(s.retry_delay(), Duration::from_secs(1));
        assert_eq!(s.pool.stop_timeout(), Duration::from_secs(30));
        assert_eq!(s.pool.start_timeout(), Duration::from_secs(60));
    }

    #[rstest]
    #[case(999, false)]
    #[case(1_000, true)]
    #[case(60_000, true)]
    #[case(60_001, false)]
    fn flush_interval_bounds(#[case] ms: u64, #[case] valid: bool) {
        let mut config = config_with(vec![api()]);
        config.settings.flush_interval_ms = ms;
        assert_eq!(config.validate().is_ok(), valid);
    }

    #[test]
    fn validation_reports_every_problem() {
        let mut dup = api();
        dup.name = ApplicationName::from("api");
        let mut broken = ApplicationSpec::new("", "");
        broken.copy_enabled = true;
        let config = config_with(vec![api(), dup, broken]);

        let err = config.validate().unwrap_err();
        let ConfigError::Invalid { problems } = err else {
            panic!("expected Invalid");
        };
        assert!(problems.iter().any(|p| p.contains("duplicate")));
        assert!(problems.iter().any(|p| p.contains("name must not be empty")));
        assert!(problems.iter().any(|p| p.contains("pool_name")));
        assert!(problems.iter().any(|p| p.contains("watch root")));
        assert!(problems.iter().any(|p| p.contains("destination_root is required")));
    }

    #[test]
    fn copy_disabled_needs_no_destination() {
        let app = ApplicationSpec::new("Web", "WebPool").with_watch_root("/src/web");
        assert!(config_with(vec![app]).validate().is_ok());
    }

    #[test]
    fn yaml_defaults_apply() {
        let yaml = r#"
applications:
  - name: API
    pool_name: ApiPool
    watch_roots: ["/src/api"]
    source_root: /src/api
    destination_root: /srv/api
"#;
        let config = Config::from_yaml_str(yaml, Path::new("config.yaml")).expect("parse");
        let app = &config.applications[0];
        assert!(app.copy_enabled);
        assert!(app.enabled);
        assert_eq!(app.max_retries_or(config.settings.max_retries), 3);
        assert_eq!(app.timeout(), Duration::from_secs(300));
        assert_eq!(config.settings, Settings::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let home = TempDir::new().expect("tempdir");
        let config = config_with(vec![api()]);
        config.save_at(home.path()).expect("save");
        let loaded = Config::load_at(home.path()).expect("load");
        assert_eq!(loaded, config);
        assert!(!config_path_at(home.path()).with_extension("yaml.tmp").exists());
    }

    #[test]
    fn application_lookup_is_case_insensitive() {
        let config = config_with(vec![api()]);
        assert!(config.application("api").is_some());
        assert!(config.application("web").is_none());
    }

    #[test]
    fn render_command_substitutes_pool() {
        let argv = render_command(&PoolCommands::default().stop, "ApiPool");
        assert_eq!(argv.last().map(String::as_str), Some("/apppool.name:ApiPool"));
    }

    #[test]
    fn home_not_found_error_message() {
        assert!(ConfigError::HomeNotFound.to_string().contains("home directory"));
    }
}
