use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::vm::PortForward;

/// Top-level configuration for the devsandbox daemon.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub vm: VmConfig,
    pub sync: SyncConfig,
    pub exec: ExecConfig,
    pub defaults: VmDefaults,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.vm.base_dir.is_absolute(),
            "vm.base_dir must be an absolute path"
        );
        anyhow::ensure!(
            !self.vm.vagrant_binary.trim().is_empty(),
            "vm.vagrant_binary must not be empty"
        );
        anyhow::ensure!(
            self.vm.command_timeout_secs >= 1,
            "vm.command_timeout_secs must be >= 1"
        );
        anyhow::ensure!(
            self.sync.guest_root.starts_with('/'),
            "sync.guest_root must be an absolute guest path"
        );
        anyhow::ensure!(
            self.exec.default_timeout_secs >= 1,
            "exec.default_timeout_secs must be >= 1"
        );
        anyhow::ensure!(self.defaults.cpus >= 1, "defaults.cpus must be >= 1");
        anyhow::ensure!(
            self.defaults.memory_mb >= 64,
            "defaults.memory_mb must be >= 64"
        );
        anyhow::ensure!(
            !self.defaults.box_image.trim().is_empty(),
            "defaults.box_image must not be empty"
        );
        Ok(())
    }
}

/// VM lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Base directory holding one subdirectory per VM plus the per-VM
    /// `<name>.json` config records.
    pub base_dir: PathBuf,
    /// Path or name of the vagrant binary.
    pub vagrant_binary: String,
    /// Timeout in seconds for vagrant lifecycle commands (up/halt/destroy
    /// can legitimately take minutes).
    pub command_timeout_secs: u64,
    /// Timeout in seconds for quick vagrant queries (status, ssh-config).
    pub query_timeout_secs: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/var/lib/devsandbox/vms"),
            vagrant_binary: "vagrant".into(),
            command_timeout_secs: 600,
            query_timeout_secs: 60,
        }
    }
}

/// File synchronization configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root of the synced tree inside the guest.
    pub guest_root: String,
    /// Path or name of the rsync binary on the host.
    pub rsync_binary: String,
    /// Timeout in seconds for a single sync invocation.
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            guest_root: "/vagrant".into(),
            rsync_binary: "rsync".into(),
            timeout_secs: 300,
        }
    }
}

/// Command execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Default timeout in seconds for exec_command when the caller does not
    /// specify one.
    pub default_timeout_secs: u64,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self { default_timeout_secs: 120 }
    }
}

/// Default values applied to new VM records when the caller omits them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmDefaults {
    /// Default Vagrant box image.
    pub box_image: String,
    /// Default vCPU count.
    pub cpus: u32,
    /// Default memory in MB.
    pub memory_mb: u32,
    /// Port forwards applied when a VM is created with an empty port list.
    pub ports: Vec<PortForward>,
    /// Sync exclude globs applied when a VM is created with an empty list.
    pub exclude_patterns: Vec<String>,
}

impl Default for VmDefaults {
    fn default() -> Self {
        Self {
            box_image: "ubuntu/focal64".into(),
            cpus: 2,
            memory_mb: 2048,
            ports: default_port_forwards(),
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

/// The documented default forwards for common development services.
fn default_port_forwards() -> Vec<PortForward> {
    [3000, 8000, 5432, 3306, 6379]
        .into_iter()
        .map(|port| PortForward { guest: port, host: port })
        .collect()
}

fn default_exclude_patterns() -> Vec<String> {
    [
        "node_modules",
        ".git",
        "*.log",
        "dist",
        "build",
        "__pycache__",
        "*.pyc",
        "venv",
        ".venv",
        "*.o",
        "*.out",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
