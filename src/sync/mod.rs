pub mod conflict;
pub mod strategy;

pub use conflict::{Resolution, SyncConflict};
pub use strategy::{SyncDirection, SyncMethod};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::{Result, SandboxError};
use crate::process::{InvokeRequest, Invoker};
use crate::sync::strategy::{StrategyRegistry, SyncContext};
use crate::util::shell_escape;
use crate::vm::{VmManager, VmRecord};

/// Per-VM synchronization status.
///
/// The in-progress flag is set before a pass dispatches and cleared after
/// it returns, on success and failure alike, so the status always reflects
/// a terminal state between operations. Counters cover every attempt;
/// files-synced and the last-sync stamps advance only on success.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncStatus {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_sync_to_vm: Option<DateTime<Utc>>,
    pub last_sync_from_vm: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub conflicts: Vec<SyncConflict>,
    pub total_syncs: u64,
    pub total_files_synced: u64,
    pub total_sync_ms: u64,
    pub last_error: Option<String>,
}

/// Result of a single sync pass. Transient; the engine folds it into the
/// per-VM [`SyncStatus`].
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub synced_paths: Vec<String>,
    pub duration: Duration,
}

struct VmSyncState {
    /// Serializes sync operations per VM; distinct VMs run fully in
    /// parallel.
    op_lock: tokio::sync::Mutex<()>,
    status: tokio::sync::Mutex<SyncStatus>,
}

impl VmSyncState {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            op_lock: tokio::sync::Mutex::new(()),
            status: tokio::sync::Mutex::new(SyncStatus::default()),
        })
    }
}

/// Dispatches synchronization passes to the configured strategy and tracks
/// per-VM status and conflicts.
pub struct SyncEngine {
    vms: Arc<VmManager>,
    invoker: Arc<dyn Invoker>,
    registry: StrategyRegistry,
    timeout: Duration,
    states: tokio::sync::Mutex<HashMap<String, Arc<VmSyncState>>>,
}

impl SyncEngine {
    pub fn new(config: &Config, vms: Arc<VmManager>, invoker: Arc<dyn Invoker>) -> Self {
        Self {
            vms,
            invoker,
            registry: StrategyRegistry::new(config.sync.rsync_binary.clone()),
            timeout: Duration::from_secs(config.sync.timeout_secs),
            states: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Lazily created per-VM state.
    async fn state_handle(&self, vm_name: &str) -> Arc<VmSyncState> {
        let mut states = self.states.lock().await;
        states
            .entry(vm_name.to_string())
            .or_insert_with(VmSyncState::new)
            .clone()
    }

    /// Run one synchronization pass for a VM.
    ///
    /// `path_filter` restricts the pass to one path relative to the synced
    /// tree. Fails with NotFound for an unknown VM and with OperationFailed
    /// when the strategy reports an error.
    pub async fn sync(
        &self,
        vm_name: &str,
        direction: SyncDirection,
        path_filter: Option<&str>,
    ) -> Result<SyncOutcome> {
        let record = self.vms.get_config(vm_name).await?;
        let state = self.state_handle(vm_name).await;
        let _op = state.op_lock.lock().await;

        state.status.lock().await.in_progress = true;
        let started = tokio::time::Instant::now();
        let outcome = self.run_strategy(&record, direction, path_filter).await;
        let elapsed = started.elapsed();

        let mut status = state.status.lock().await;
        status.in_progress = false;
        status.total_syncs += 1;
        status.total_sync_ms += elapsed.as_millis() as u64;

        match outcome {
            Ok(synced_paths) => {
                let now = Utc::now();
                status.last_sync = Some(now);
                match direction {
                    SyncDirection::ToVm => status.last_sync_to_vm = Some(now),
                    SyncDirection::FromVm => status.last_sync_from_vm = Some(now),
                }
                status.total_files_synced += synced_paths.len() as u64;
                status.last_error = None;
                drop(status);
                info!(vm = %vm_name, direction = %direction,
                    files = synced_paths.len(), ms = elapsed.as_millis() as u64, "sync completed");
                Ok(SyncOutcome { synced_paths, duration: elapsed })
            }
            Err(e) => {
                status.last_error = Some(e.to_string());
                drop(status);
                warn!(vm = %vm_name, direction = %direction, error = %e, "sync failed");
                Err(e)
            }
        }
    }

    /// Current status for a VM. A VM that has never synced reports an empty
    /// default status; an unknown VM is NotFound.
    pub async fn status(&self, vm_name: &str) -> Result<SyncStatus> {
        self.vms.get_config(vm_name).await?;
        let state = self.state_handle(vm_name).await;
        let status = state.status.lock().await;
        Ok(status.clone())
    }

    /// Drop all sync state for a VM. Called when the VM is destroyed.
    pub async fn forget(&self, vm_name: &str) {
        self.states.lock().await.remove(vm_name);
    }

    /// Refresh the conflict registry for a VM and return it.
    ///
    /// A path conflicts when the host copy changed after the last
    /// successful to-VM sync and the guest copy changed after the last
    /// successful from-VM sync. Without both baselines no conflict can be
    /// attributed, and the current registry is returned unchanged.
    pub async fn detect_conflicts(&self, vm_name: &str) -> Result<Vec<SyncConflict>> {
        let record = self.vms.get_config(vm_name).await?;
        let state = self.state_handle(vm_name).await;

        let (last_to, last_from) = {
            let status = state.status.lock().await;
            (status.last_sync_to_vm, status.last_sync_from_vm)
        };
        let (Some(last_to), Some(last_from)) = (last_to, last_from) else {
            let status = state.status.lock().await;
            return Ok(status.conflicts.clone());
        };

        let host_changed =
            conflict::host_files_newer_than(record.host_dir(), &record.exclude_patterns, last_to)?;
        let guest_changed = self.guest_files_newer_than(&record, last_from).await?;

        let mut conflicted: Vec<&String> =
            host_changed.intersection(&guest_changed).collect();
        conflicted.sort();

        let mut status = state.status.lock().await;
        let now = Utc::now();
        for path in conflicted {
            if !status.conflicts.iter().any(|c| &c.path == path) {
                status.conflicts.push(SyncConflict {
                    path: path.clone(),
                    detected_at: now,
                });
            }
        }
        Ok(status.conflicts.clone())
    }

    /// Resolve one recorded conflict. The entry is removed only when the
    /// chosen resolution succeeds; unknown resolution values fail fast.
    pub async fn resolve_conflict(
        &self,
        vm_name: &str,
        path: &str,
        resolution: &str,
    ) -> Result<()> {
        let resolution: Resolution = resolution.parse()?;
        let record = self.vms.get_config(vm_name).await?;
        let state = self.state_handle(vm_name).await;
        let _op = state.op_lock.lock().await;

        {
            let status = state.status.lock().await;
            if !status.conflicts.iter().any(|c| c.path == path) {
                return Err(SandboxError::not_found("conflict", path));
            }
        }

        match resolution {
            Resolution::UseHost => {
                self.run_strategy(&record, SyncDirection::ToVm, Some(path))
                    .await?;
            }
            Resolution::UseVm => {
                self.run_strategy(&record, SyncDirection::FromVm, Some(path))
                    .await?;
            }
            Resolution::Merge => self.merge_versions(&record, path).await?,
            Resolution::KeepBoth => self.keep_both_versions(&record, path).await?,
        }

        let mut status = state.status.lock().await;
        status.conflicts.retain(|c| c.path != path);
        info!(vm = %vm_name, path, resolution = ?resolution, "sync conflict resolved");
        Ok(())
    }

    /// Dispatch one pass to the configured strategy. Used by `sync` and by
    /// the targeted re-syncs of conflict resolution; resolution passes do
    /// not advance the cumulative counters.
    async fn run_strategy(
        &self,
        record: &VmRecord,
        direction: SyncDirection,
        path_filter: Option<&str>,
    ) -> Result<Vec<String>> {
        let ssh = self.vms.ssh_info(&record.name).await?;
        let ctx = SyncContext {
            vm_name: &record.name,
            record,
            direction,
            path_filter,
            ssh: &ssh,
            timeout: self.timeout,
        };
        self.registry
            .dispatch(record.sync_method, &ctx, self.invoker.as_ref())
            .await
    }

    /// Guest-side files (relative to the synced tree) modified after the
    /// given instant, probed with a remote find.
    async fn guest_files_newer_than(
        &self,
        record: &VmRecord,
        since: DateTime<Utc>,
    ) -> Result<std::collections::HashSet<String>> {
        let ssh = self.vms.ssh_info(&record.name).await?;
        let guest_root = record.guest_dir().trim_end_matches('/').to_string();
        let stamp = since.format("%Y-%m-%d %H:%M:%S UTC").to_string();
        let probe = format!(
            "find {} -type f -newermt {}",
            shell_escape(&guest_root),
            shell_escape(&stamp)
        );

        let result = self
            .invoker
            .invoke(
                InvokeRequest::new("ssh", ssh.ssh_args(&probe))
                    .timeout(Some(self.timeout)),
            )
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "probe guest changes",
                result.failure_output(),
            ));
        }

        let prefix = format!("{}/", guest_root);
        Ok(result
            .stdout_lossy()
            .lines()
            .filter_map(|line| line.strip_prefix(&prefix))
            .map(String::from)
            .collect())
    }

    /// Fetch the guest copy of a conflicted path.
    async fn guest_file_content(&self, record: &VmRecord, rel: &str) -> Result<Vec<u8>> {
        let ssh = self.vms.ssh_info(&record.name).await?;
        let guest_path = format!("{}/{}", record.guest_dir().trim_end_matches('/'), rel);
        let result = self
            .invoker
            .invoke(
                InvokeRequest::new("ssh", ssh.ssh_args(&format!("cat {}", shell_escape(&guest_path))))
                    .timeout(Some(self.timeout)),
            )
            .await?;
        if !result.success() {
            return Err(SandboxError::operation_output(
                "read guest file",
                result.failure_output(),
            ));
        }
        Ok(result.stdout)
    }

    /// Three-way merge of a conflicted path, then push the result to the
    /// guest. When the automatic merge cannot reconcile the versions, the
    /// file is left (and synced) with conflict markers and the resolution
    /// fails, keeping the conflict entry.
    async fn merge_versions(&self, record: &VmRecord, rel: &str) -> Result<()> {
        let host_abs = record.host_dir().join(rel);
        let host_content = tokio::fs::read_to_string(&host_abs)
            .await
            .map_err(|e| SandboxError::operation_failed("read host file", e))?;
        let vm_bytes = self.guest_file_content(record, rel).await?;
        let vm_content = String::from_utf8_lossy(&vm_bytes).into_owned();
        let base_content = conflict::common_base(&host_content, &vm_content);

        let host_file = path_with_suffix(&host_abs, ".host");
        let vm_file = path_with_suffix(&host_abs, ".vm");
        let base_file = path_with_suffix(&host_abs, ".base");
        for (path, content) in [
            (&host_file, host_content.as_str()),
            (&vm_file, vm_content.as_str()),
            (&base_file, base_content.as_str()),
        ] {
            tokio::fs::write(path, content)
                .await
                .map_err(|e| SandboxError::operation_failed("write merge input", e))?;
        }

        let diff3_args = vec![
            "-m".to_string(),
            host_file.display().to_string(),
            base_file.display().to_string(),
            vm_file.display().to_string(),
        ];
        let result = self
            .invoker
            .invoke(InvokeRequest::new("diff3", diff3_args).timeout(Some(self.timeout)))
            .await;

        for path in [&host_file, &vm_file, &base_file] {
            if let Err(e) = tokio::fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove merge scratch file");
            }
        }

        let result = result?;
        match result.exit_code {
            // Clean merge or a merge with conflicts; diff3 -m prints the
            // merged document on stdout either way.
            0 | 1 => {
                tokio::fs::write(&host_abs, &result.stdout)
                    .await
                    .map_err(|e| SandboxError::operation_failed("write merged file", e))?;
                self.run_strategy(record, SyncDirection::ToVm, Some(rel))
                    .await?;
                if result.exit_code == 1 {
                    return Err(SandboxError::operation_output(
                        "merge file versions",
                        format!("automatic merge left conflict markers in {}", rel),
                    ));
                }
                Ok(())
            }
            _ => Err(SandboxError::operation_output(
                "merge file versions",
                result.failure_output(),
            )),
        }
    }

    /// Keep both copies: the guest version is materialized on the host as
    /// `<path>.vm` and synced back so both sides carry both files.
    async fn keep_both_versions(&self, record: &VmRecord, rel: &str) -> Result<()> {
        let vm_bytes = self.guest_file_content(record, rel).await?;
        let kept_rel = format!("{}.vm", rel);
        let kept_abs = record.host_dir().join(&kept_rel);
        tokio::fs::write(&kept_abs, &vm_bytes)
            .await
            .map_err(|e| SandboxError::operation_failed("write kept guest copy", e))?;
        self.run_strategy(record, SyncDirection::ToVm, Some(&kept_rel))
            .await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn seed_conflict(&self, vm_name: &str, path: &str) {
        let state = self.state_handle(vm_name).await;
        state.status.lock().await.conflicts.push(SyncConflict {
            path: path.to_string(),
            detected_at: Utc::now(),
        });
    }
}

fn path_with_suffix(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    std::path::PathBuf::from(s)
}
