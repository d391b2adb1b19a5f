//! systemd user-service installation
//!
//! `install` writes a user unit that runs `voxup start` under systemd as an
//! alternate supervisor; the unit's own restart policy covers the voxup
//! process itself. Installation is per-user and refuses to run as root.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const SERVICE_NAME: &str = "voxup";

/// Whether the current process runs with superuser privileges.
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Path of the systemd user unit file.
pub fn unit_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Failed to get home directory")?;
    Ok(home
        .join(".config")
        .join("systemd")
        .join("user")
        .join(format!("{}.service", SERVICE_NAME)))
}

/// Render the unit file contents for the given voxup binary.
pub fn generate_unit(binary_path: &Path) -> String {
    format!(
        r#"[Unit]
Description=Voxup voice-agent supervisor
After=network.target

[Service]
Type=simple
ExecStart={binary_path} start
Restart=on-failure
RestartSec=5s

[Install]
WantedBy=default.target
"#,
        binary_path = binary_path.display(),
    )
}

/// Install the service unit and reload the systemd user daemon.
pub fn install(binary_path: &Path) -> Result<()> {
    let unit_path = unit_path()?;
    let unit_dir = unit_path
        .parent()
        .context("Failed to get parent directory")?;
    fs::create_dir_all(unit_dir).context("Failed to create systemd user directory")?;

    fs::write(&unit_path, generate_unit(binary_path))
        .context(format!("Failed to write unit file: {:?}", unit_path))?;

    Command::new("systemctl")
        .arg("--user")
        .arg("daemon-reload")
        .output()
        .context("Failed to reload systemd daemon")?;

    println!("✅ Service installed: {}", unit_path.display());
    println!("   Start with: systemctl --user start {}", SERVICE_NAME);

    Ok(())
}

/// Remove the service unit and reload the systemd user daemon.
pub fn uninstall() -> Result<()> {
    let unit_path = unit_path()?;

    if unit_path.exists() {
        Command::new("systemctl")
            .arg("--user")
            .arg("stop")
            .arg(SERVICE_NAME)
            .output()
            .ok();

        fs::remove_file(&unit_path)
            .context(format!("Failed to remove unit file: {:?}", unit_path))?;

        Command::new("systemctl")
            .arg("--user")
            .arg("daemon-reload")
            .output()
            .context("Failed to reload systemd daemon")?;

        println!("✅ Service uninstalled");
    } else {
        println!("Service is not installed");
    }

    Ok(())
}
