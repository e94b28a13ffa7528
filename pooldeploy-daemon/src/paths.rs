use std::path::{Path, PathBuf};

pub const DAEMON_LABEL: &str = "dev.pooldeploy.daemon";

pub const DAEMON_LOG: &str = "daemon.log";
pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const AUDIT_LOG: &str = "deployments.jsonl";

pub fn pooldeploy_root(home: &Path) -> PathBuf {
    pooldeploy_core::config::root_at(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    pooldeploy_root(home).join(DAEMON_SOCKET)
}

pub fn logs_dir(home: &Path) -> PathBuf {
    pooldeploy_root(home).join("logs")
}

pub fn daemon_log_path(home: &Path) -> PathBuf {
    logs_dir(home).join(DAEMON_LOG)
}

pub fn audit_dir(home: &Path) -> PathBuf {
    pooldeploy_root(home).join("audit")
}

pub fn audit_log_path(home: &Path) -> PathBuf {
    audit_dir(home).join(AUDIT_LOG)
}
