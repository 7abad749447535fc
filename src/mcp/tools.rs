use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::*;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::info;

use crate::config::VmDefaults;
use crate::error::SandboxError;
use crate::exec::{ExecutionContext, Executor};
use crate::process::OutputMode;
use crate::sync::{SyncDirection, SyncEngine, SyncMethod};
use crate::vm::{PortForward, VmManager, VmRecord, VmState};

// ---------------------------------------------------------------------------
// Parameter structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize, JsonSchema)]
struct PortForwardParams {
    /// Port inside the guest VM
    guest: u16,
    /// Port on the host to forward to
    host: u16,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct VmCreateParams {
    /// Unique name for the VM (alphanumeric, dashes, underscores)
    name: String,
    /// Host project directory to mirror into the VM
    project_path: String,
    /// Vagrant box image (default from server config, e.g. ubuntu/focal64)
    box_image: Option<String>,
    /// Number of virtual CPUs (default: 2)
    cpus: Option<u32>,
    /// Memory in megabytes (default: 2048)
    memory_mb: Option<u32>,
    /// Sync method: "rsync", "nfs", "smb", or "virtualbox" (default: rsync)
    sync_method: Option<String>,
    /// Port forwards. Empty or omitted applies the default set
    /// {3000, 8000, 5432, 3306, 6379}.
    #[serde(default)]
    ports: Option<Vec<PortForwardParams>>,
    /// Glob patterns excluded from synchronization (default set covers
    /// node_modules, .git, build artifacts, ...)
    #[serde(default)]
    exclude_patterns: Option<Vec<String>>,
    /// Shell lines appended to the provisioning script
    #[serde(default)]
    environment: Option<Vec<String>>,
    /// Provisioner identifiers recorded with the VM
    #[serde(default)]
    provisioners: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct VmNameParams {
    /// Name of the VM
    name: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct VmUpdateConfigParams {
    /// Name of the VM
    name: String,
    /// New box image
    box_image: Option<String>,
    /// New vCPU count
    cpus: Option<u32>,
    /// New memory in megabytes
    memory_mb: Option<u32>,
    /// New sync method: "rsync", "nfs", "smb", or "virtualbox"
    sync_method: Option<String>,
    /// Replacement port forward list
    #[serde(default)]
    ports: Option<Vec<PortForwardParams>>,
    /// Replacement exclude pattern list
    #[serde(default)]
    exclude_patterns: Option<Vec<String>>,
    /// Replacement environment lines
    #[serde(default)]
    environment: Option<Vec<String>>,
    /// Replacement provisioner identifiers
    #[serde(default)]
    provisioners: Option<Vec<String>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct VmUploadParams {
    /// Name of the VM
    name: String,
    /// Source path on the host
    source: String,
    /// Destination path inside the VM
    destination: String,
    /// Compress the transfer (default: false)
    #[serde(default)]
    compress: Option<bool>,
    /// Compression type passed to the uploader (used with compress=true)
    #[serde(default)]
    compression_type: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SyncParams {
    /// Name of the VM
    name: String,
    /// Restrict the pass to one path relative to the synced tree
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SyncStatusParams {
    /// Name of the VM
    name: String,
    /// Re-run conflict detection before reporting (default: false)
    #[serde(default)]
    refresh_conflicts: Option<bool>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ResolveConflictParams {
    /// Name of the VM
    name: String,
    /// Conflicted path, relative to the synced tree
    path: String,
    /// One of "use_host", "use_vm", "merge", "keep_both"
    resolution: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ExecCommandParams {
    /// Name of the VM
    name: String,
    /// Shell command to execute inside the VM
    command: String,
    /// Working directory inside the VM; relative paths resolve under the
    /// synced tree root
    #[serde(default)]
    working_dir: Option<String>,
    /// Environment variables exported before the command
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    /// Sync host files to the VM before running (default: true)
    #[serde(default)]
    sync_before: Option<bool>,
    /// Sync VM files back to the host after the command terminates,
    /// whatever its exit code (default: true)
    #[serde(default)]
    sync_after: Option<bool>,
    /// Timeout in seconds (default from server config)
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct BackgroundTaskParams {
    /// Name of the VM
    name: String,
    /// Shell command to launch as a detached background task
    command: String,
    /// Working directory inside the VM
    #[serde(default)]
    working_dir: Option<String>,
    /// Environment variables exported before the command
    #[serde(default)]
    env: Option<HashMap<String, String>>,
    /// Sync host files to the VM before launching (default: true)
    #[serde(default)]
    sync_before: Option<bool>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// MCP tool surface over the VM lifecycle manager, sync engine, and
/// command executor.
pub struct SandboxServer {
    vms: Arc<VmManager>,
    sync: Arc<SyncEngine>,
    executor: Arc<Executor>,
    defaults: VmDefaults,
    default_exec_timeout: Duration,
    tool_router: ToolRouter<Self>,
}

#[tool_router]
impl SandboxServer {
    pub fn new(
        vms: Arc<VmManager>,
        sync: Arc<SyncEngine>,
        executor: Arc<Executor>,
        defaults: VmDefaults,
        default_exec_timeout: Duration,
    ) -> Self {
        Self {
            vms,
            sync,
            executor,
            defaults,
            default_exec_timeout,
            tool_router: Self::tool_router(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle tools
    // -----------------------------------------------------------------------

    /// Create a development VM: directory, persisted configuration, and a
    /// validated Vagrantfile. The VM is not started.
    #[tool]
    async fn vm_create(
        &self,
        Parameters(params): Parameters<VmCreateParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_create", vm = %params.name, "tool call");

        let sync_method = match params.sync_method.as_deref() {
            None | Some("") => SyncMethod::Rsync,
            Some(value) => value.parse::<SyncMethod>().map_err(mcp_error)?,
        };

        let mut record = VmRecord {
            name: params.name.clone(),
            box_image: params.box_image.unwrap_or_default(),
            cpus: params.cpus.unwrap_or(0),
            memory_mb: params.memory_mb.unwrap_or(0),
            project_path: PathBuf::from(&params.project_path),
            sync_method,
            host_path: None,
            guest_path: None,
            exclude_patterns: params.exclude_patterns.unwrap_or_default(),
            ports: params
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| PortForward { guest: p.guest, host: p.host })
                .collect(),
            environment: params.environment.unwrap_or_default(),
            provisioners: params.provisioners.unwrap_or_default(),
        };
        record.apply_defaults(&self.defaults);

        self.vms
            .create(&params.name, Path::new(&params.project_path), record)
            .await
            .map_err(mcp_error)?;

        let record = self.vms.get_config(&params.name).await.map_err(mcp_error)?;
        let state = match self.vms.state(&params.name).await {
            Ok(state) => state.to_string(),
            Err(_) => VmState::Unknown.to_string(),
        };
        let payload = serde_json::json!({
            "name": record.name,
            "box": record.box_image,
            "cpus": record.cpus,
            "memory_mb": record.memory_mb,
            "sync_method": record.sync_method,
            "project_path": record.project_path,
            "ports": record.ports,
            "state": state,
        });
        Ok(json_result(payload))
    }

    /// Start a VM.
    #[tool]
    async fn vm_start(
        &self,
        Parameters(params): Parameters<VmNameParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_start", vm = %params.name, "tool call");
        self.vms.start(&params.name).await.map_err(mcp_error)?;
        Ok(text_result(format!("VM '{}' started.", params.name)))
    }

    /// Stop a VM.
    #[tool]
    async fn vm_stop(
        &self,
        Parameters(params): Parameters<VmNameParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_stop", vm = %params.name, "tool call");
        self.vms.stop(&params.name).await.map_err(mcp_error)?;
        Ok(text_result(format!("VM '{}' stopped.", params.name)))
    }

    /// Destroy a VM and remove its local directory and configuration.
    /// Local bookkeeping always converges to not_created; if the backend
    /// destroy failed, the response carries a backend_warning and the
    /// backend VM may still exist.
    #[tool]
    async fn vm_destroy(
        &self,
        Parameters(params): Parameters<VmNameParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_destroy", vm = %params.name, "tool call");
        let report = self.vms.destroy(&params.name).await.map_err(mcp_error)?;
        self.sync.forget(&params.name).await;

        let payload = serde_json::json!({
            "name": params.name,
            "destroyed": true,
            "state": VmState::NotCreated.to_string(),
            "backend_warning": report.backend_warning,
        });
        Ok(json_result(payload))
    }

    /// Get the canonical lifecycle state of a VM. A probe or parse failure
    /// is reported as state "unknown" or "error" with the failure attached.
    #[tool]
    async fn vm_state(
        &self,
        Parameters(params): Parameters<VmNameParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_state", vm = %params.name, "tool call");
        let payload = match self.vms.state(&params.name).await {
            Ok(state) => serde_json::json!({
                "name": params.name,
                "state": state.to_string(),
            }),
            // The probe ran but failed: state is unknowable right now.
            Err(e @ SandboxError::OperationFailed { .. }) => serde_json::json!({
                "name": params.name,
                "state": VmState::Unknown.to_string(),
                "error": e.to_string(),
            }),
            // The probe answered something unintelligible.
            Err(e @ SandboxError::Parse { .. }) => serde_json::json!({
                "name": params.name,
                "state": VmState::Error.to_string(),
                "error": e.to_string(),
            }),
            Err(e) => return Err(mcp_error(e)),
        };
        Ok(json_result(payload))
    }

    /// List all VMs with their current states.
    #[tool]
    async fn vm_list(&self) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_list", "tool call");
        let names = self.vms.list().await.map_err(mcp_error)?;
        let mut vms = Vec::with_capacity(names.len());
        for name in names {
            let state = match self.vms.state(&name).await {
                Ok(state) => state.to_string(),
                Err(_) => VmState::Unknown.to_string(),
            };
            vms.push(serde_json::json!({ "name": name, "state": state }));
        }
        Ok(json_result(serde_json::json!({ "vms": vms })))
    }

    /// Get the persisted configuration record of a VM.
    #[tool]
    async fn vm_get_config(
        &self,
        Parameters(params): Parameters<VmNameParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_get_config", vm = %params.name, "tool call");
        let record = self.vms.get_config(&params.name).await.map_err(mcp_error)?;
        let payload = serde_json::to_value(&record)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(json_result(payload))
    }

    /// Update the persisted configuration of a VM. Omitted fields keep
    /// their current values.
    #[tool]
    async fn vm_update_config(
        &self,
        Parameters(params): Parameters<VmUpdateConfigParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_update_config", vm = %params.name, "tool call");
        let mut record = self.vms.get_config(&params.name).await.map_err(mcp_error)?;

        if let Some(box_image) = params.box_image {
            record.box_image = box_image;
        }
        if let Some(cpus) = params.cpus {
            record.cpus = cpus;
        }
        if let Some(memory_mb) = params.memory_mb {
            record.memory_mb = memory_mb;
        }
        if let Some(method) = params.sync_method {
            record.sync_method = method.parse().map_err(mcp_error)?;
        }
        if let Some(ports) = params.ports {
            record.ports = ports
                .into_iter()
                .map(|p| PortForward { guest: p.guest, host: p.host })
                .collect();
        }
        if let Some(patterns) = params.exclude_patterns {
            record.exclude_patterns = patterns;
        }
        if let Some(environment) = params.environment {
            record.environment = environment;
        }
        if let Some(provisioners) = params.provisioners {
            record.provisioners = provisioners;
        }

        self.vms
            .update_config(&params.name, record)
            .await
            .map_err(mcp_error)?;
        Ok(text_result(format!(
            "Configuration of VM '{}' updated.",
            params.name
        )))
    }

    /// Upload a file or directory from the host into a running VM.
    #[tool]
    async fn vm_upload(
        &self,
        Parameters(params): Parameters<VmUploadParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "vm_upload", vm = %params.name, source = %params.source, "tool call");
        self.vms
            .upload(
                &params.name,
                Path::new(&params.source),
                &params.destination,
                params.compress.unwrap_or(false),
                params.compression_type.as_deref(),
            )
            .await
            .map_err(mcp_error)?;
        Ok(text_result(format!(
            "Uploaded '{}' to '{}' on VM '{}'.",
            params.source, params.destination, params.name
        )))
    }

    // -----------------------------------------------------------------------
    // Sync tools
    // -----------------------------------------------------------------------

    /// Synchronize files from the host project to the VM.
    #[tool]
    async fn sync_to_vm(
        &self,
        Parameters(params): Parameters<SyncParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "sync_to_vm", vm = %params.name, "tool call");
        let outcome = self
            .sync
            .sync(&params.name, SyncDirection::ToVm, params.path.as_deref())
            .await
            .map_err(mcp_error)?;
        Ok(json_result(sync_payload(&params.name, "to_vm", &outcome)))
    }

    /// Synchronize files from the VM back to the host project.
    #[tool]
    async fn sync_from_vm(
        &self,
        Parameters(params): Parameters<SyncParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "sync_from_vm", vm = %params.name, "tool call");
        let outcome = self
            .sync
            .sync(&params.name, SyncDirection::FromVm, params.path.as_deref())
            .await
            .map_err(mcp_error)?;
        Ok(json_result(sync_payload(&params.name, "from_vm", &outcome)))
    }

    /// Report a VM's sync status: timestamps, counters, and unresolved
    /// conflicts. Set refresh_conflicts=true to re-run conflict detection
    /// first.
    #[tool]
    async fn sync_status(
        &self,
        Parameters(params): Parameters<SyncStatusParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "sync_status", vm = %params.name, "tool call");
        if params.refresh_conflicts.unwrap_or(false) {
            self.sync
                .detect_conflicts(&params.name)
                .await
                .map_err(mcp_error)?;
        }
        let status = self.sync.status(&params.name).await.map_err(mcp_error)?;
        let payload = serde_json::to_value(&status)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(json_result(payload))
    }

    /// Resolve a recorded sync conflict with "use_host", "use_vm",
    /// "merge", or "keep_both". The conflict entry is removed on success.
    #[tool]
    async fn resolve_sync_conflict(
        &self,
        Parameters(params): Parameters<ResolveConflictParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(
            tool = "resolve_sync_conflict",
            vm = %params.name,
            path = %params.path,
            resolution = %params.resolution,
            "tool call"
        );
        self.sync
            .resolve_conflict(&params.name, &params.path, &params.resolution)
            .await
            .map_err(mcp_error)?;
        Ok(json_result(serde_json::json!({
            "name": params.name,
            "path": params.path,
            "resolution": params.resolution,
            "resolved": true,
        })))
    }

    // -----------------------------------------------------------------------
    // Execution tools
    // -----------------------------------------------------------------------

    /// Execute a command in a running VM, synchronized with the host
    /// project: host files are synced in before the command and VM files
    /// are synced back after it terminates (both on by default).
    #[tool]
    async fn exec_command(
        &self,
        Parameters(params): Parameters<ExecCommandParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "exec_command", vm = %params.name, command = %params.command, "tool call");

        let ctx = self.execution_context(
            &params.name,
            params.working_dir,
            params.env,
            params.sync_before.unwrap_or(true),
            params.sync_after.unwrap_or(true),
            params.timeout_secs,
        );

        let outcome = self
            .executor
            .execute(&params.command, &ctx, OutputMode::Capture, None)
            .await
            .map_err(mcp_error)?;

        let result = &outcome.command;
        let payload = serde_json::json!({
            "vm_name": params.name,
            "command": params.command,
            "exit_code": result.exit_code,
            "stdout": result.stdout_lossy(),
            "stderr": result.stderr_lossy(),
            "duration_ms": result.duration.as_millis() as u64,
            "execution_error": result.error,
            "post_sync_error": outcome.post_sync_error,
        });
        Ok(json_result(payload))
    }

    /// Launch a command as a detached background task in a running VM.
    /// Output goes to a VM-local log file; completion is not tracked.
    #[tool]
    async fn run_background_task(
        &self,
        Parameters(params): Parameters<BackgroundTaskParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(tool = "run_background_task", vm = %params.name, command = %params.command, "tool call");

        let ctx = self.execution_context(
            &params.name,
            params.working_dir,
            params.env,
            params.sync_before.unwrap_or(true),
            false,
            None,
        );

        let launch = self
            .executor
            .execute_background(&params.command, &ctx)
            .await
            .map_err(mcp_error)?;

        let payload = serde_json::json!({
            "vm_name": params.name,
            "command": params.command,
            "status": "started",
            "log_file": launch.log_file,
            "exit_code": launch.exit_code,
        });
        Ok(json_result(payload))
    }

    fn execution_context(
        &self,
        vm_name: &str,
        working_dir: Option<String>,
        env: Option<HashMap<String, String>>,
        sync_before: bool,
        sync_after: bool,
        timeout_secs: Option<u64>,
    ) -> ExecutionContext {
        // Deterministic export order regardless of map iteration order.
        let mut env: Vec<(String, String)> = env.unwrap_or_default().into_iter().collect();
        env.sort();
        ExecutionContext {
            vm_name: vm_name.to_string(),
            working_dir,
            env,
            sync_before,
            sync_after,
            timeout: Some(
                timeout_secs
                    .map(Duration::from_secs)
                    .unwrap_or(self.default_exec_timeout),
            ),
        }
    }
}

#[tool_handler]
impl ServerHandler for SandboxServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "devsandbox: disposable Vagrant development VMs with synchronized execution \
                 (15 tools).\n\
                 \n\
                 LIFECYCLE: vm_create, vm_start, vm_stop, vm_destroy, vm_state, vm_list, \
                 vm_get_config, vm_update_config, vm_upload\n\
                 \n\
                 SYNC: sync_to_vm, sync_from_vm, sync_status (refresh_conflicts=true to \
                 re-detect), resolve_sync_conflict (use_host/use_vm/merge/keep_both)\n\
                 \n\
                 EXECUTION: exec_command (sync_before/sync_after default true), \
                 run_background_task (detached, output in /tmp/bg_<vm>.log)\n\
                 \n\
                 Typical flow: vm_create -> vm_start -> exec_command. Commands run inside \
                 the VM over ssh; the host project directory mirrors to the VM's synced \
                 tree before execution and back after it."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn text_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(message.into())])
}

fn json_result(payload: serde_json::Value) -> CallToolResult {
    CallToolResult::success(vec![Content::text(
        serde_json::to_string(&payload).unwrap(),
    )])
}

fn sync_payload(
    vm_name: &str,
    direction: &str,
    outcome: &crate::sync::SyncOutcome,
) -> serde_json::Value {
    serde_json::json!({
        "vm_name": vm_name,
        "direction": direction,
        "synced_files": outcome.synced_paths,
        "count": outcome.synced_paths.len(),
        "sync_time_ms": outcome.duration.as_millis() as u64,
    })
}

/// Map orchestrator errors onto MCP error classes: caller mistakes are
/// invalid_request, failed external work is internal_error.
fn mcp_error(e: SandboxError) -> McpError {
    match &e {
        SandboxError::OperationFailed { .. } => McpError::internal_error(e.to_string(), None),
        SandboxError::NotFound { .. }
        | SandboxError::InvalidState { .. }
        | SandboxError::Parse { .. }
        | SandboxError::Unsupported { .. } => McpError::invalid_request(e.to_string(), None),
    }
}
