//! systemd user unit that autostarts `agentgate serve`.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command as StdCommand;

use anyhow::{Context, Result, anyhow, bail};

use crate::config::APP_NAME;

pub const UNIT_NAME: &str = "agentgate.service";

/// Contents of the unit file.
pub fn unit_contents(exe: &Path, config_file: &Path) -> String {
    format!(
        r#"[Unit]
Description=agentgate - OpenAI-compatible gateway for a command-line agent
After=network.target

[Service]
Type=simple
ExecStart="{}" --config "{}" serve
Restart=on-failure
RestartSec=5

[Install]
WantedBy=default.target
"#,
        exe.display(),
        config_file.display()
    )
}

fn unit_dir() -> Result<PathBuf> {
    if let Some(dir) = env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(dir).join("systemd").join("user"));
    }
    let home = dirs::home_dir().ok_or_else(|| anyhow!("HOME not set"))?;
    Ok(home.join(".config").join("systemd").join("user"))
}

pub fn unit_path() -> Result<PathBuf> {
    Ok(unit_dir()?.join(UNIT_NAME))
}

fn ensure_supported() -> Result<()> {
    if cfg!(target_os = "linux") {
        Ok(())
    } else {
        bail!("{APP_NAME} service management requires systemd (Linux only)")
    }
}

fn systemctl(args: &[&str]) -> Result<bool> {
    let status = StdCommand::new("systemctl")
        .arg("--user")
        .args(args)
        .status()
        .with_context(|| format!("running systemctl --user {}", args.join(" ")))?;
    Ok(status.success())
}

/// Write the unit, reload systemd, and enable it.
pub fn install(config_file: &Path) -> Result<PathBuf> {
    ensure_supported()?;
    let exe = env::current_exe().context("locating the agentgate executable")?;
    let path = unit_path()?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating unit directory {}", parent.display()))?;
    }
    fs::write(&path, unit_contents(&exe, config_file))
        .with_context(|| format!("writing unit file {}", path.display()))?;

    systemctl(&["daemon-reload"])?;
    if !systemctl(&["enable", UNIT_NAME])? {
        bail!("systemctl --user enable {UNIT_NAME} failed");
    }
    Ok(path)
}

/// Disable the unit and remove its file.
pub fn uninstall() -> Result<()> {
    ensure_supported()?;
    let path = unit_path()?;
    if !path.exists() {
        return Ok(());
    }
    if !systemctl(&["disable", "--now", UNIT_NAME])? {
        log::warn!("systemctl --user disable {} reported failure", UNIT_NAME);
    }
    fs::remove_file(&path).with_context(|| format!("removing unit file {}", path.display()))?;
    systemctl(&["daemon-reload"])?;
    Ok(())
}

/// Installed/enabled/active summary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ServiceStatus {
    pub unit_path: PathBuf,
    pub installed: bool,
    pub enabled: bool,
    pub active: bool,
}

pub fn status() -> Result<ServiceStatus> {
    ensure_supported()?;
    let path = unit_path()?;
    let installed = path.exists();
    let query = |verb: &str| -> bool {
        StdCommand::new("systemctl")
            .args(["--user", "--quiet", verb, UNIT_NAME])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    };
    Ok(ServiceStatus {
        installed,
        enabled: installed && query("is-enabled"),
        active: installed && query("is-active"),
        unit_path: path,
    })
}
