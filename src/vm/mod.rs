pub mod ssh;
pub mod status;
pub mod store;
pub mod vagrantfile;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{Config, VmDefaults};
use crate::error::{Result, SandboxError};
use crate::process::{CommandResult, InvokeRequest, Invoker};
use crate::sync::SyncMethod;
use crate::vm::ssh::SshInfo;
use crate::vm::store::RecordStore;

/// Canonical lifecycle state of a VM.
///
/// Never cached: every query re-derives the state from the external probe,
/// except NotCreated which is inferred from directory absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    NotCreated,
    Running,
    Stopped,
    Suspended,
    Error,
    Unknown,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Same tokens the external probe uses, so logs and API output line up.
        let token = match self {
            VmState::NotCreated => "not_created",
            VmState::Running => "running",
            VmState::Stopped => "poweroff",
            VmState::Suspended => "saved",
            VmState::Error => "error",
            VmState::Unknown => "unknown",
        };
        f.write_str(token)
    }
}

/// A guest/host port forwarding pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForward {
    pub guest: u16,
    pub host: u16,
}

/// Persisted per-VM configuration record. The name is the sole external key
/// and is immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub name: String,
    #[serde(rename = "box")]
    pub box_image: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub project_path: PathBuf,
    pub sync_method: SyncMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guest_path: Option<String>,
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
    #[serde(default)]
    pub ports: Vec<PortForward>,
    #[serde(default)]
    pub environment: Vec<String>,
    #[serde(default)]
    pub provisioners: Vec<String>,
}

impl VmRecord {
    /// The host side of the synced tree; defaults to the project path.
    pub fn host_dir(&self) -> &Path {
        self.host_path.as_deref().unwrap_or(&self.project_path)
    }

    /// The guest side of the synced tree.
    pub fn guest_dir(&self) -> &str {
        self.guest_path.as_deref().unwrap_or("/vagrant")
    }

    /// Fill omitted fields from configured defaults.
    pub fn apply_defaults(&mut self, defaults: &VmDefaults) {
        if self.box_image.trim().is_empty() {
            self.box_image = defaults.box_image.clone();
        }
        if self.cpus == 0 {
            self.cpus = defaults.cpus;
        }
        if self.memory_mb == 0 {
            self.memory_mb = defaults.memory_mb;
        }
        if self.ports.is_empty() {
            self.ports = defaults.ports.clone();
        }
        if self.exclude_patterns.is_empty() {
            self.exclude_patterns = defaults.exclude_patterns.clone();
        }
    }
}

/// Outcome of a destroy operation.
///
/// Local bookkeeping always converges to NotCreated; a failed external
/// destroy is reported here instead of failing the operation, so the caller
/// can tell the backend resource may still exist.
#[derive(Debug, Clone, Serialize)]
pub struct DestroyReport {
    pub backend_warning: Option<String>,
}

/// VM names become directory names and remote log file names; restrict them
/// to a safe character set.
pub fn validate_vm_name(name: &str) -> Result<()> {
    let check = || -> anyhow::Result<()> {
        if name.is_empty() {
            bail!("VM name must not be empty");
        }
        if name.len() > 64 {
            bail!("VM name '{}' too long (max 64 chars)", name);
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            bail!(
                "VM name '{}' contains invalid characters (allowed: alphanumeric, -, _)",
                name
            );
        }
        Ok(())
    };
    check().map_err(|e| SandboxError::operation_failed("validate VM name", e))
}

/// Handles VM lifecycle operations: directory and record management plus
/// invocations of the external VM-control process.
///
/// The manager holds no per-VM state; everything is re-derived from the
/// filesystem and the external probe, so methods take `&self` and inbound
/// operations may run on concurrent tasks.
pub struct VmManager {
    base_dir: PathBuf,
    vagrant: String,
    store: RecordStore,
    invoker: Arc<dyn Invoker>,
    command_timeout: Duration,
    query_timeout: Duration,
}

impl VmManager {
    pub fn new(config: &Config, invoker: Arc<dyn Invoker>) -> Result<Self> {
        std::fs::create_dir_all(&config.vm.base_dir)
            .map_err(|e| SandboxError::operation_failed("create VM base directory", e))?;
        Ok(Self {
            base_dir: config.vm.base_dir.clone(),
            vagrant: config.vm.vagrant_binary.clone(),
            store: RecordStore::new(&config.vm.base_dir),
            invoker,
            command_timeout: Duration::from_secs(config.vm.command_timeout_secs),
            query_timeout: Duration::from_secs(config.vm.query_timeout_secs),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The directory holding a VM's Vagrantfile and provider state.
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    /// Create a VM: directory, persisted record, rendered and validated
    /// Vagrantfile. Does not start the VM. Creating over an existing
    /// directory is not an error.
    pub async fn create(
        &self,
        name: &str,
        project_path: &Path,
        mut record: VmRecord,
    ) -> Result<()> {
        validate_vm_name(name)?;
        record.name = name.to_string();
        record.project_path = project_path.to_path_buf();

        let vm_dir = self.vm_dir(name);
        tokio::fs::create_dir_all(&vm_dir)
            .await
            .map_err(|e| SandboxError::operation_failed("create VM directory", e))?;

        self.store.save(&record).await?;

        let vagrantfile = vagrantfile::render(&record);
        tokio::fs::write(vm_dir.join("Vagrantfile"), vagrantfile)
            .await
            .map_err(|e| SandboxError::operation_failed("write Vagrantfile", e))?;

        let result = self
            .run_vagrant(name, &["validate"], self.query_timeout)
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "validate Vagrantfile",
                result.failure_output(),
            ));
        }

        info!(vm = %name, "VM created");
        Ok(())
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.require_vm_dir(name)?;
        let result = self
            .run_vagrant(name, &["up"], self.command_timeout)
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "start VM",
                result.failure_output(),
            ));
        }
        info!(vm = %name, "VM started");
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.require_vm_dir(name)?;
        let result = self
            .run_vagrant(name, &["halt"], self.command_timeout)
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "stop VM",
                result.failure_output(),
            ));
        }
        info!(vm = %name, "VM stopped");
        Ok(())
    }

    /// Destroy a VM. The external destroy is best-effort: its failure is
    /// logged and reported in the returned [`DestroyReport`], while the
    /// local directory and record are always removed so local bookkeeping
    /// reaches NotCreated.
    pub async fn destroy(&self, name: &str) -> Result<DestroyReport> {
        let vm_dir = self.vm_dir(name);
        if !vm_dir.exists() && !self.store.exists(name) {
            return Err(SandboxError::not_found("VM", name));
        }

        let backend_warning = match self
            .run_vagrant(name, &["destroy", "-f"], self.command_timeout)
            .await
        {
            Ok(result) if result.success() => None,
            Ok(result) => {
                let output = result.failure_output().trim().to_string();
                warn!(vm = %name, exit_code = result.exit_code, output = %output,
                    "external destroy failed, continuing with local cleanup");
                Some(format!(
                    "external destroy exited with code {}: {}; the backend VM may still exist",
                    result.exit_code, output
                ))
            }
            Err(e) => {
                warn!(vm = %name, error = %e,
                    "external destroy could not run, continuing with local cleanup");
                Some(format!(
                    "external destroy could not run: {}; the backend VM may still exist",
                    e
                ))
            }
        };

        if vm_dir.exists() {
            tokio::fs::remove_dir_all(&vm_dir)
                .await
                .map_err(|e| SandboxError::operation_failed("clean up VM directory", e))?;
        }
        self.store.remove(name).await?;

        info!(vm = %name, "VM destroyed");
        Ok(DestroyReport { backend_warning })
    }

    /// Current canonical state. An absent VM directory is NotCreated without
    /// probing; otherwise the external probe runs and its output is mapped.
    pub async fn state(&self, name: &str) -> Result<VmState> {
        if !self.vm_dir(name).exists() {
            return Ok(VmState::NotCreated);
        }
        let result = self
            .run_vagrant(name, &["status", "--machine-readable"], self.query_timeout)
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "get VM status",
                result.failure_output(),
            ));
        }
        status::parse_machine_readable(&result.stdout_lossy())
    }

    pub async fn get_config(&self, name: &str) -> Result<VmRecord> {
        self.store.load(name).await
    }

    /// Replace the persisted record. Fails with NotFound when the VM
    /// directory does not exist. The name is the immutable key and is
    /// forced to match.
    pub async fn update_config(&self, name: &str, mut record: VmRecord) -> Result<()> {
        if !self.vm_dir(name).exists() {
            return Err(SandboxError::not_found("VM directory", name));
        }
        record.name = name.to_string();
        self.store.save(&record).await?;
        info!(vm = %name, "VM configuration updated");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    /// Upload a file or directory into the VM.
    ///
    /// Preconditions are checked in order: the VM must exist, must be
    /// Running, and the source path must exist on the host.
    pub async fn upload(
        &self,
        name: &str,
        source: &Path,
        destination: &str,
        compress: bool,
        compression_type: Option<&str>,
    ) -> Result<()> {
        if !self.vm_dir(name).exists() {
            return Err(SandboxError::not_found("VM", name));
        }
        let state = self.state(name).await?;
        if state != VmState::Running {
            return Err(SandboxError::invalid_state(name, state));
        }
        if !source.exists() {
            return Err(SandboxError::not_found(
                "source path",
                source.display().to_string(),
            ));
        }

        let mut args: Vec<String> = vec!["upload".into()];
        if compress {
            args.push("--compress".into());
            if let Some(kind) = compression_type {
                args.push("--compression-type".into());
                args.push(kind.into());
            }
        }
        args.push(source.display().to_string());
        args.push(destination.into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let result = self
            .run_vagrant(name, &arg_refs, self.command_timeout)
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "upload to VM",
                result.failure_output(),
            ));
        }
        info!(vm = %name, source = %source.display(), destination, "uploaded to VM");
        Ok(())
    }

    /// SSH connection info for the VM, parsed from the external
    /// connection-info query.
    pub async fn ssh_info(&self, name: &str) -> Result<SshInfo> {
        self.require_vm_dir(name)?;
        let result = self
            .run_vagrant(name, &["ssh-config"], self.query_timeout)
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "get ssh config",
                result.failure_output(),
            ));
        }
        ssh::parse_ssh_config(&result.stdout_lossy())
    }

    fn require_vm_dir(&self, name: &str) -> Result<()> {
        if self.vm_dir(name).exists() {
            Ok(())
        } else {
            Err(SandboxError::not_found("VM", name))
        }
    }

    async fn run_vagrant(
        &self,
        name: &str,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandResult> {
        let req = InvokeRequest::new(self.vagrant.as_str(), args.iter().copied())
            .cwd(self.vm_dir(name))
            .timeout(Some(timeout));
        self.invoker.invoke(req).await
    }
}
