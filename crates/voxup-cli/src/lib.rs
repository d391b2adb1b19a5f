//! voxup CLI library
//!
//! Service launcher, health prober, supervisor loop, and the systemd /
//! phone-provider integrations behind the `voxup` binary.

use std::path::{Path, PathBuf};

pub mod launcher;
pub mod probe;
pub mod supervisor;
pub mod systemd;
pub mod twilio;

/// Directory holding per-unit log files
pub fn logs_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Log file for one unit's combined stdout/stderr
pub fn unit_log_path(data_dir: &Path, name: &str) -> PathBuf {
    logs_dir(data_dir).join(format!("{}.log", name))
}

/// Directory holding timestamped backups
pub fn backups_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("backups")
}
